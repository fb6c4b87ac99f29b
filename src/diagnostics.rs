//! Read-only diagnostics: recent log lines and live object counts.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use log::{Log, Metadata, Record};
use parking_lot::Mutex;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::handles::{self, HandleRegistry};

struct RingState {
    lines: VecDeque<String>,
    /// Line number of `lines[0]`.
    first: u64,
}

/// Bounded buffer of the most recent log lines. Line numbers start at 0 and
/// keep increasing after old lines are evicted.
pub struct LogRing {
    capacity: usize,
    state: Mutex<RingState>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RingState {
                lines: VecDeque::with_capacity(capacity.max(1)),
                first: 0,
            }),
        }
    }

    /// Appends a line and returns its number.
    pub fn push(&self, line: String) -> u64 {
        let mut state = self.state.lock();
        if state.lines.len() == self.capacity {
            state.lines.pop_front();
            state.first += 1;
        }
        state.lines.push_back(line);
        state.first + state.lines.len() as u64 - 1
    }

    /// Lines numbered `start..end` that are still retained.
    pub fn lines(&self, start: u64, end: u64) -> Vec<(u64, String)> {
        let state = self.state.lock();
        let from = start.max(state.first);
        let to = end.min(state.first + state.lines.len() as u64);
        (from..to)
            .map(|number| (number, state.lines[(number - state.first) as usize].clone()))
            .collect()
    }

    /// Number the next line will get.
    pub fn next_line_number(&self) -> u64 {
        let state = self.state.lock();
        state.first + state.lines.len() as u64
    }

    pub fn len(&self) -> usize {
        self.state.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        let next = state.first + state.lines.len() as u64;
        state.lines.clear();
        state.first = next;
    }
}

/// Forwards to env_logger and keeps a copy of every emitted line.
struct RingLogger {
    inner: env_logger::Logger,
    ring: Arc<LogRing>,
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.matches(record) {
            return;
        }
        self.ring.push(format!(
            "[{} {:<5} {}] {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record.level(),
            record.target(),
            record.args()
        ));
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

fn build_logger(config: &LogConfig) -> (RingLogger, Arc<LogRing>) {
    // RUST_LOG 优先于配置文件
    let inner = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.filter.as_str()))
        .build();
    let ring = Arc::new(LogRing::new(config.ring_capacity));
    (
        RingLogger {
            inner,
            ring: ring.clone(),
        },
        ring,
    )
}

/// Installs the process logger. Can only succeed once per process.
pub fn init_logging(config: &LogConfig) -> Result<Arc<LogRing>> {
    let (logger, ring) = build_logger(config);
    let max_level = logger.inner.filter();
    log::set_boxed_logger(Box::new(logger))
        .map_err(|_| Error::AlreadyInitialized("process logger".into()))?;
    log::set_max_level(max_level);
    Ok(ring)
}

/// One line per tracked type with its live handle count.
pub fn object_report(registry: &HandleRegistry) -> String {
    let counts = registry.object_counts();
    let mut report = String::new();
    for (type_name, count) in &counts {
        let _ = writeln!(report, "{}: {}", type_name, count);
    }
    let _ = writeln!(report, "total live handles (process): {}", handles::live_objects());
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            assert_eq!(ring.push(format!("line {}", i)), i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.next_line_number(), 5);

        let lines = ring.lines(0, 100);
        assert_eq!(
            lines,
            vec![
                (2, "line 2".to_string()),
                (3, "line 3".to_string()),
                (4, "line 4".to_string())
            ]
        );
        assert_eq!(ring.lines(3, 4), vec![(3, "line 3".to_string())]);
        assert!(ring.lines(4, 3).is_empty());
    }

    #[test]
    fn test_clear_keeps_numbering() {
        let ring = LogRing::new(10);
        ring.push("a".into());
        ring.push("b".into());
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.push("c".into()), 2);
    }

    #[test]
    fn test_logger_records_enabled_lines() {
        let (logger, ring) = build_logger(&LogConfig {
            filter: "warn".into(),
            ring_capacity: 8,
        });
        logger.log(
            &Record::builder()
                .level(log::Level::Warn)
                .target("speech")
                .args(format_args!("socket closed"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(log::Level::Debug)
                .target("speech")
                .args(format_args!("noise"))
                .build(),
        );

        if std::env::var_os("RUST_LOG").is_none() {
            let lines = ring.lines(0, 10);
            assert_eq!(lines.len(), 1);
            assert!(lines[0].1.ends_with("socket closed"));
            assert!(lines[0].1.contains("WARN"));
        }
    }

    #[test]
    fn test_object_report() {
        struct Session;
        let registry = HandleRegistry::default();
        let handle = registry.track(Arc::new(Session)).unwrap();
        let report = object_report(&registry);
        assert!(report.contains("Session: 1"));
        registry.release::<Session>(handle).unwrap();
        assert!(object_report(&registry).contains("Session: 0"));
    }
}
