//! Credential renewal.
//!
//! A [`CredentialRenewalTimer`] keeps a fresh credential available to the
//! transport. Renewals are triggered by scheduler timers; the fetch itself
//! runs on the IO runtime so a slow token endpoint never blocks a lane.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tokio::runtime::Handle;

use crate::error::{Error, Result};
use crate::error_info::{ErrorRecord, ErrorSource, WebSocketError, classify, classify_http};
use crate::scheduler::{Affinity, Repeat, Scheduler, TaskId};

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    SubscriptionKey,
    AuthorizationToken,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub kind: CredentialKind,
    pub value: String,
    /// `None` means the credential does not expire.
    pub expires_at: Option<Instant>,
}

impl Credential {
    pub fn subscription_key(key: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::SubscriptionKey,
            value: key.into(),
            expires_at: None,
        }
    }

    pub fn token(token: impl Into<String>, valid_for: Duration) -> Self {
        Self {
            kind: CredentialKind::AuthorizationToken,
            value: token.into(),
            // 超出可表示范围视为永不过期
            expires_at: Instant::now().checked_add(valid_for),
        }
    }

    pub fn is_valid_for(&self, min_validity: Duration) -> bool {
        match self.expires_at {
            Some(at) => Instant::now()
                .checked_add(min_validity)
                .is_some_and(|needed| at > needed),
            None => true,
        }
    }

    /// The upgrade-request header carrying this credential.
    pub fn header(&self) -> (String, String) {
        match self.kind {
            CredentialKind::SubscriptionKey => (SUBSCRIPTION_KEY_HEADER.to_string(), self.value.clone()),
            CredentialKind::AuthorizationToken => {
                (AUTHORIZATION_HEADER.to_string(), format!("Bearer {}", self.value))
            }
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> std::result::Result<Credential, ErrorRecord>;
}

/// A credential that never changes, e.g. a subscription key.
pub struct StaticCredential(pub Credential);

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn fetch(&self) -> std::result::Result<Credential, ErrorRecord> {
        Ok(self.0.clone())
    }
}

/// Exchanges a subscription key for a short-lived authorization token.
pub struct TokenIssuer {
    client: reqwest::Client,
    endpoint: String,
    subscription_key: String,
    validity: Duration,
}

impl TokenIssuer {
    pub fn new(endpoint: impl Into<String>, subscription_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            subscription_key: subscription_key.into(),
            validity: Duration::from_secs(600),
        }
    }

    /// Token endpoint of a service region.
    pub fn for_region(region: &str, subscription_key: impl Into<String>) -> Self {
        Self::new(
            format!("https://{}.api.cognitive.microsoft.com/sts/v1.0/issueToken", region),
            subscription_key,
        )
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }
}

#[async_trait]
impl CredentialSource for TokenIssuer {
    async fn fetch(&self) -> std::result::Result<Credential, ErrorRecord> {
        let connection_error = |e: reqwest::Error| {
            classify(
                ErrorSource::Transport(WebSocketError::ConnectionFailure),
                0,
                &format!("token request to {} failed: {}", self.endpoint, e),
            )
            .unwrap_or_else(|| ErrorRecord::runtime(e.to_string()))
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(connection_error)?;

        let status = response.status();
        let body = response.text().await.map_err(connection_error)?;
        if let Some(record) = classify_http(status.as_u16(), "Token request failed:", "") {
            log::warn!("token endpoint returned {}: {}", status, body);
            return Err(record);
        }
        Ok(Credential::token(body.trim(), self.validity))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
    /// Delay until the next renewal after a successful one.
    pub success_interval_secs: u64,
    /// Delay until the next attempt after a failure.
    pub failure_interval_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            success_interval_secs: 540,
            failure_interval_secs: 5,
        }
    }
}

#[derive(Default)]
struct RenewalState {
    current: Option<Credential>,
    last_error: Option<ErrorRecord>,
    pending: Option<TaskId>,
    /// Bumped by `force_renew`; renewals from an older chain stop rescheduling.
    generation: u64,
    started: bool,
    stopped: bool,
}

struct RenewalInner {
    source: Arc<dyn CredentialSource>,
    scheduler: Arc<Scheduler>,
    runtime: Handle,
    config: RenewalConfig,
    state: Mutex<RenewalState>,
    changed: Condvar,
}

/// Periodically refreshes a credential from a [`CredentialSource`].
pub struct CredentialRenewalTimer {
    inner: Arc<RenewalInner>,
}

impl CredentialRenewalTimer {
    pub fn new(
        source: Arc<dyn CredentialSource>,
        scheduler: Arc<Scheduler>,
        runtime: Handle,
        config: RenewalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RenewalInner {
                source,
                scheduler,
                runtime,
                config,
                state: Mutex::new(RenewalState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Schedules the first renewal immediately.
    pub fn start(&self) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(Error::AlreadyInitialized("credential renewal timer".into()));
            }
            state.started = true;
            state.generation
        };
        schedule(&self.inner, Duration::ZERO, generation)
    }

    /// Drops the pending renewal and renews right away. A fetch already in
    /// flight still completes but no longer schedules the next renewal. Also
    /// starts a timer that was never started.
    pub fn force_renew(&self) -> Result<()> {
        let (pending, generation) = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(Error::InvalidState("credential renewal timer is stopped".into()));
            }
            state.started = true;
            state.generation += 1;
            (state.pending.take(), state.generation)
        };
        if let Some(id) = pending {
            self.inner.scheduler.cancel(id);
        }
        schedule(&self.inner, Duration::ZERO, generation)
    }

    /// The current credential, if it has not expired.
    pub fn current(&self) -> Option<Credential> {
        self.inner
            .state
            .lock()
            .current
            .clone()
            .filter(|credential| credential.is_valid_for(Duration::ZERO))
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.inner.state.lock().last_error.clone()
    }

    /// Blocks until a credential valid for at least `min_validity` exists, or
    /// `timeout` passes. Returns false on timeout and changes nothing.
    pub fn wait_until_valid(&self, min_validity: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        loop {
            if state
                .current
                .as_ref()
                .is_some_and(|credential| credential.is_valid_for(min_validity))
            {
                return true;
            }
            let Some(deadline) = deadline else {
                self.inner.changed.wait(&mut state);
                continue;
            };
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state
                    .current
                    .as_ref()
                    .is_some_and(|credential| credential.is_valid_for(min_validity));
            }
        }
    }

    pub fn stop(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.pending.take()
        };
        if let Some(id) = pending {
            self.inner.scheduler.cancel(id);
        }
        self.inner.changed.notify_all();
    }
}

impl Drop for CredentialRenewalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn schedule(inner: &Arc<RenewalInner>, delay: Duration, generation: u64) -> Result<()> {
    let weak = Arc::downgrade(inner);
    let timer = inner.scheduler.execute_after(
        move || renew(&weak, generation),
        delay,
        Repeat::once(),
        Affinity::Background,
    )?;
    let mut state = inner.state.lock();
    if state.stopped || state.generation != generation {
        drop(state);
        timer.cancel();
    } else {
        state.pending = Some(timer.id());
    }
    Ok(())
}

fn renew(weak: &Weak<RenewalInner>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    {
        let mut state = inner.state.lock();
        if state.stopped || state.generation != generation {
            return;
        }
        state.pending = None;
    }

    let runtime = inner.runtime.clone();
    runtime.spawn(async move {
        let outcome = inner.source.fetch().await;
        let delay = {
            let mut state = inner.state.lock();
            if state.stopped {
                return;
            }
            if state.generation != generation {
                // 已被 force_renew 取代，由新的一轮负责续期
                log::debug!("discarding credential fetch superseded by a forced renewal");
                return;
            }
            match outcome {
                Ok(credential) => {
                    log::debug!("credential renewed ({:?})", credential.kind);
                    state.current = Some(credential);
                    state.last_error = None;
                    Duration::from_secs(inner.config.success_interval_secs)
                }
                Err(error) => {
                    log::warn!("credential renewal failed: {}", error);
                    state.last_error = Some(error);
                    Duration::from_secs(inner.config.failure_interval_secs)
                }
            }
        };
        inner.changed.notify_all();
        if let Err(e) = schedule(&inner, delay, generation) {
            log::warn!("could not schedule the next credential renewal: {}", e);
        }
    });
}
