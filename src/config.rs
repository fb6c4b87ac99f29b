use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::audio::AudioFormat;
use crate::credentials::RenewalConfig;
use crate::handles::LeakPolicy;
use crate::scheduler::SchedulerConfig;
use crate::transport::TransportConfig;

pub const ENV_PREFIX: &str = "SPEECH";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// env_logger filter, e.g. `info` or `speech_usp_rs::transport=debug`.
    pub filter: String,
    /// Lines kept in memory for [`LogRing::lines`](crate::diagnostics::LogRing::lines).
    pub ring_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ring_capacity: 1000,
        }
    }
}

/// Every tunable of the runtime. Missing fields fall back to their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    // 调度器
    pub scheduler: SchedulerConfig,
    // 连接
    pub transport: TransportConfig,
    pub credentials: RenewalConfig,
    // 句柄泄漏阈值
    pub registry: LeakPolicy,
    pub audio: AudioFormat,
    pub logging: LogConfig,
}

impl RuntimeConfig {
    /// Reads an optional TOML file, then applies `SPEECH_*` environment
    /// overrides. Nested keys use `__`, e.g. `SPEECH_TRANSPORT__POLLING_INTERVAL_MS=5`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read runtime configuration")?;

        let config: RuntimeConfig = settings
            .try_deserialize()
            .context("Failed to parse runtime configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.scheduler.max_slice > 0, "scheduler.max_slice must be positive");
        anyhow::ensure!(
            self.transport.max_send_per_cycle > 0,
            "transport.max_send_per_cycle must be positive"
        );
        anyhow::ensure!(
            self.audio.sample_rate > 0 && self.audio.channels > 0 && self.audio.bits_per_sample > 0,
            "audio format must be non-zero"
        );
        anyhow::ensure!(
            self.registry.soft_threshold <= self.registry.hard_threshold,
            "registry.soft_threshold exceeds registry.hard_threshold"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("speech-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = RuntimeConfig::load(None).unwrap();
        assert_eq!(config.scheduler.max_slice, 10);
        assert_eq!(config.transport.max_send_per_cycle, 20);
        assert_eq!(config.credentials.success_interval_secs, 540);
        assert_eq!(config.audio, AudioFormat::default());
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = write_config(
            "[transport]\npolling_interval_ms = 25\nuser_message_paths = [\"*\"]\n\n[audio]\nsample_rate = 8000\n",
        );
        let config = RuntimeConfig::load(Some(&path)).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(config.transport.polling_interval_ms, 25);
        assert_eq!(config.transport.user_message_paths, vec!["*".to_string()]);
        assert_eq!(config.transport.close_retry_limit, 100);
        assert_eq!(config.audio.sample_rate, 8000);
        assert_eq!(config.audio.channels, 1);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join(format!("speech-absent-{}.toml", uuid::Uuid::new_v4()));
        let config = RuntimeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.idle_wait_ms, 200);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let path = write_config("[scheduler]\nmax_slice = 0\n");
        assert!(RuntimeConfig::load(Some(&path)).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
