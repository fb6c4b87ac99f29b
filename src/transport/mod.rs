//! Protocol transport: one websocket connection to the speech service.
//!
//! All connection work happens in a pass that reschedules itself on the
//! scheduler's background lane. Public methods only touch the shared state
//! and return at once; the pass does the socket IO, dispatches inbound
//! messages and drains the outbound queue.

pub mod endpoint;
pub mod events;
pub mod message;
pub mod metrics;
pub mod socket;
pub mod tungstenite;

pub use endpoint::{EndpointInfo, ProxyInfo, Scheme, TrustedCertificate};
pub use events::{
    DisconnectReason, Hypothesis, InboundEvent, Phrase, Translation, TransportCallbacks, TransportEvent,
};
pub use message::{FrameBody, OutboundFrame, ProtocolViolation, WirePayload};
pub use metrics::{LatencyStats, MetricEvent, MetricTag, MetricsSnapshot, TelemetryReport};
pub use socket::{SocketEvent, WebSocketIo};
pub use tungstenite::TungsteniteSocket;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::audio::AudioStreamBuffer;
use crate::credentials::CredentialRenewalTimer;
use crate::error::{Error, Result};
use crate::error_info::{CancellationCode, ErrorRecord, ErrorSource, WebSocketError, classify};
use crate::scheduler::{Affinity, Repeat, Scheduler, TaskHandle, TaskId};
use message::{PATH_AUDIO, PATH_TELEMETRY, RawMessage};
use metrics::TransportMetrics;

pub const CONNECTION_ID_HEADER: &str = "X-ConnectionId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Initial,
    Opening,
    Connected,
    Destroying,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frames handed to the socket per pass.
    pub max_send_per_cycle: usize,
    pub polling_interval_ms: u64,
    /// Passes to wait for the peer's close frame before dropping the socket.
    pub close_retry_limit: u32,
    pub close_retry_interval_ms: u64,
    /// Inbound paths delivered as `NamedUserMessage`; `"*"` accepts any.
    pub user_message_paths: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_send_per_cycle: 20,
            polling_interval_ms: 10,
            close_retry_limit: 100,
            close_retry_interval_ms: 10,
            user_message_paths: vec![
                "response".to_string(),
                "translation.synthesis".to_string(),
                "translation.synthesis.end".to_string(),
                "speech.keyword".to_string(),
            ],
        }
    }
}

type Delivery = Option<oneshot::Sender<Result<bool>>>;

struct Pending {
    frame_id: u64,
    frame: OutboundFrame,
    delivery: Delivery,
    /// Overrides the connection's current request id.
    request_id: Option<String>,
}

struct AudioSource {
    buffer: Arc<AudioStreamBuffer>,
    header_sent: bool,
    flush_requested: bool,
}

/// Callback work collected under the lock and run after it is released.
enum Note {
    Connected,
    Event(InboundEvent),
    Error(ErrorRecord),
    Disconnected(DisconnectReason, String),
}

struct Core {
    state: ConnectionState,
    socket: Box<dyn WebSocketIo>,
    endpoint: Option<EndpointInfo>,
    connection_id: String,
    request_id: String,
    queue: VecDeque<Pending>,
    in_flight: HashMap<u64, Delivery>,
    next_id: u64,
    audio: Option<AudioSource>,
    credentials: Option<Arc<CredentialRenewalTimer>>,
    close_retries: u32,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
    error_reported: bool,
    disconnect_reported: bool,
    pass_scheduled: bool,
    metrics: TransportMetrics,
}

impl Core {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn resolve(delivery: Delivery, sent: bool) {
    if let Some(tx) = delivery {
        let _ = tx.send(Ok(sent));
    }
}

struct Inner {
    config: TransportConfig,
    scheduler: Arc<Scheduler>,
    callbacks: Arc<dyn TransportCallbacks>,
    core: Mutex<Core>,
}

/// A speech-protocol connection driven by the scheduler.
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(
        scheduler: Arc<Scheduler>,
        socket: Box<dyn WebSocketIo>,
        callbacks: Arc<dyn TransportCallbacks>,
        config: TransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                scheduler,
                callbacks,
                core: Mutex::new(Core {
                    state: ConnectionState::Closed,
                    socket,
                    endpoint: None,
                    connection_id: String::new(),
                    request_id: message::new_request_id(),
                    queue: VecDeque::new(),
                    in_flight: HashMap::new(),
                    next_id: 0,
                    audio: None,
                    credentials: None,
                    close_retries: 0,
                    close_waiters: Vec::new(),
                    error_reported: false,
                    disconnect_reported: false,
                    pass_scheduled: false,
                    metrics: TransportMetrics::default(),
                }),
            }),
        }
    }

    /// Starts opening a connection. Only valid while `Closed`.
    pub fn connect(&self, endpoint: EndpointInfo, connection_id: &str) -> Result<()> {
        let start_pass = {
            let mut core = self.inner.core.lock();
            if core.state != ConnectionState::Closed {
                return Err(Error::InvalidState(format!(
                    "cannot connect while {:?}",
                    core.state
                )));
            }
            log::info!("connecting to {} (connection {})", endpoint.host, connection_id);
            core.endpoint = Some(endpoint);
            core.connection_id = connection_id.to_string();
            core.request_id = message::new_request_id();
            core.state = ConnectionState::Initial;
            core.close_retries = 0;
            core.error_reported = false;
            core.disconnect_reported = false;
            let start = !core.pass_scheduled;
            core.pass_scheduled = true;
            start
        };

        if start_pass {
            if let Err(e) = Inner::schedule(&self.inner, Duration::ZERO) {
                let mut core = self.inner.core.lock();
                core.state = ConnectionState::Closed;
                core.pass_scheduled = false;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Queues a frame. The handle resolves `true` once the socket wrote it
    /// and `false` if the connection closed first.
    pub fn send(&self, frame: OutboundFrame) -> TaskHandle<bool> {
        let mut core = self.inner.core.lock();
        let frame_id = core.next_id();
        if matches!(core.state, ConnectionState::Closed | ConnectionState::Destroying) {
            return TaskHandle::ready(TaskId(frame_id), Ok(false));
        }
        if !frame.headers_fit() {
            log::warn!("rejecting frame with a {}-byte path: header block too large", frame.path.len());
            return TaskHandle::ready(TaskId(frame_id), Ok(false));
        }
        let (tx, rx) = oneshot::channel();
        core.queue.push_back(Pending {
            frame_id,
            frame,
            delivery: Some(tx),
            request_id: None,
        });
        TaskHandle::new(TaskId(frame_id), rx)
    }

    /// Starts the close handshake. The handle resolves once the connection
    /// is fully closed.
    pub fn disconnect(&self) -> TaskHandle<()> {
        let mut notes = Vec::new();
        let handle = {
            let mut core = self.inner.core.lock();
            let id = TaskId(core.next_id());
            match core.state {
                ConnectionState::Closed => TaskHandle::ready(id, Ok(())),
                ConnectionState::Initial => {
                    close_now(&mut core, &mut notes, DisconnectReason::Normal, "disconnected before open");
                    TaskHandle::ready(id, Ok(()))
                }
                ConnectionState::Opening | ConnectionState::Connected | ConnectionState::Destroying => {
                    if core.state != ConnectionState::Destroying {
                        log::info!("closing connection {}", core.connection_id);
                        core.socket.close(DisconnectReason::Normal, "client disconnect");
                        core.state = ConnectionState::Destroying;
                        core.close_retries = 0;
                    }
                    let (tx, rx) = oneshot::channel();
                    core.close_waiters.push(tx);
                    TaskHandle::new(id, rx)
                }
            }
        };
        self.inner.notify(notes);
        handle
    }

    /// Streams audio from `buffer` once connected. The first frame of every
    /// request carries a WAV header built from the buffer's format.
    pub fn attach_audio(&self, buffer: Arc<AudioStreamBuffer>) {
        self.inner.core.lock().audio = Some(AudioSource {
            buffer,
            header_sent: false,
            flush_requested: false,
        });
    }

    pub fn detach_audio(&self) -> Option<Arc<AudioStreamBuffer>> {
        self.inner.core.lock().audio.take().map(|audio| audio.buffer)
    }

    /// Uses the timer's current credential for every upgrade request.
    pub fn attach_credentials(&self, timer: Arc<CredentialRenewalTimer>) {
        self.inner.core.lock().credentials = Some(timer);
    }

    /// Sends an empty audio frame after the buffered audio, which ends the
    /// audio stream for the current request.
    pub fn flush_audio(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        let audio = core
            .audio
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no audio attached".into()))?;
        audio.flush_requested = true;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.core.lock().metrics.snapshot()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let mut notes = Vec::new();
        {
            let mut core = self.inner.core.lock();
            if core.state != ConnectionState::Closed {
                close_now(&mut core, &mut notes, DisconnectReason::Normal, "transport dropped");
            }
        }
        self.inner.notify(notes);
    }
}

impl Inner {
    fn schedule(inner: &Arc<Inner>, delay: Duration) -> Result<()> {
        let weak = Arc::downgrade(inner);
        inner
            .scheduler
            .execute_after(move || run_pass(&weak), delay, Repeat::once(), Affinity::Background)
            .map(|_| ())
    }

    fn notify(&self, notes: Vec<Note>) {
        for note in notes {
            match note {
                Note::Connected => self.callbacks.on_connected(),
                Note::Event(event) => self.callbacks.on_event(event),
                Note::Error(record) => self.callbacks.on_error(record),
                Note::Disconnected(reason, detail) => self.callbacks.on_disconnected(reason, &detail),
            }
        }
    }

    fn step(&self, core: &mut Core, notes: &mut Vec<Note>) {
        match core.state {
            ConnectionState::Closed => {}
            ConnectionState::Initial => self.open(core, notes),
            ConnectionState::Opening => self.poll_opening(core, notes),
            ConnectionState::Connected => {
                if self.poll_connected(core, notes) {
                    self.pull_audio(core);
                    self.send_queued(core, notes);
                }
            }
            ConnectionState::Destroying => self.poll_destroying(core, notes),
        }
    }

    fn open(&self, core: &mut Core, notes: &mut Vec<Note>) {
        let Some(endpoint) = core.endpoint.clone() else {
            close_now(core, notes, DisconnectReason::Unknown, "no endpoint");
            return;
        };

        let mut headers = vec![(CONNECTION_ID_HEADER.to_string(), core.connection_id.clone())];
        let credential = match &core.credentials {
            None => Ok(None),
            Some(timer) => timer.current().map(Some).ok_or_else(|| {
                timer.last_error().unwrap_or_else(|| {
                    ErrorRecord::explicit(
                        CancellationCode::AuthenticationFailure,
                        "No valid credential is available.",
                    )
                })
            }),
        };
        match credential {
            Ok(Some(credential)) => headers.push(credential.header()),
            Ok(None) => {}
            Err(record) => {
                fail(core, notes, Some(record), DisconnectReason::Unknown);
                return;
            }
        }

        core.metrics.connect_started();
        match core.socket.open(&endpoint, &headers) {
            Ok(()) => core.state = ConnectionState::Opening,
            Err(e) => {
                let record = classify(
                    ErrorSource::Transport(WebSocketError::ConnectionFailure),
                    0,
                    &e.to_string(),
                );
                fail(core, notes, record, DisconnectReason::Unknown);
            }
        }
    }

    fn poll_opening(&self, core: &mut Core, notes: &mut Vec<Note>) {
        while let Some(event) = core.socket.poll_event() {
            match event {
                SocketEvent::Opened => {
                    log::info!("connection {} established", core.connection_id);
                    core.state = ConnectionState::Connected;
                    let connection_id = core.connection_id.clone();
                    core.metrics.connected(&connection_id);
                    if let Some(audio) = core.audio.as_mut() {
                        // 重连后从未确认的位置重新发送
                        audio.buffer.new_turn();
                        audio.header_sent = false;
                    }
                    notes.push(Note::Connected);
                    return;
                }
                SocketEvent::OpenFailed {
                    kind,
                    status,
                    headers,
                    message,
                } => {
                    let record = open_failure(kind, status, &headers, &message);
                    fail(core, notes, record, DisconnectReason::Unknown);
                    return;
                }
                SocketEvent::PeerClosed { code, reason } => {
                    let record = classify(
                        ErrorSource::Transport(WebSocketError::RemoteClosed),
                        code as i32,
                        &reason,
                    );
                    fail(core, notes, record, DisconnectReason::from_code(code as i32));
                    return;
                }
                SocketEvent::Error { kind, code, message } => {
                    fail(core, notes, classify(ErrorSource::Transport(kind), code, &message), DisconnectReason::Unknown);
                    return;
                }
                SocketEvent::Closed => {
                    let record = classify(
                        ErrorSource::Transport(WebSocketError::ConnectionFailure),
                        0,
                        "connection closed before it was opened",
                    );
                    fail(core, notes, record, DisconnectReason::Unknown);
                    return;
                }
                other => log::debug!("ignoring {:?} while opening", other),
            }
        }
    }

    /// Returns false once the connection has been torn down.
    fn poll_connected(&self, core: &mut Core, notes: &mut Vec<Note>) -> bool {
        while let Some(event) = core.socket.poll_event() {
            match event {
                SocketEvent::Text(text) => self.inbound(core, notes, message::parse_text(&text)),
                SocketEvent::Binary(data) => self.inbound(core, notes, message::parse_binary(&data)),
                SocketEvent::Sent { frame_id, ok } => {
                    resolve(core.in_flight.remove(&frame_id).flatten(), ok);
                    if !ok {
                        let record = classify(
                            ErrorSource::Transport(WebSocketError::SendFrame),
                            0,
                            &format!("frame {} was not written", frame_id),
                        );
                        fail(core, notes, record, DisconnectReason::Unknown);
                        return false;
                    }
                    if let Some((tag, elapsed)) = core.metrics.frame_sent(frame_id) {
                        log::debug!("{:?} frame sent after {:?}", tag, elapsed);
                    }
                }
                SocketEvent::PeerClosed { code, reason } => {
                    let disconnect = DisconnectReason::from_code(code as i32);
                    if disconnect == DisconnectReason::Normal {
                        log::info!("service closed connection {}: {}", core.connection_id, reason);
                        close_now(core, notes, disconnect, &reason);
                    } else {
                        let record = classify(
                            ErrorSource::Transport(WebSocketError::RemoteClosed),
                            code as i32,
                            &reason,
                        );
                        fail(core, notes, record, disconnect);
                    }
                    return false;
                }
                SocketEvent::Error { kind, code, message } => {
                    fail(core, notes, classify(ErrorSource::Transport(kind), code, &message), DisconnectReason::Unknown);
                    return false;
                }
                SocketEvent::Closed => {
                    let record = classify(
                        ErrorSource::Transport(WebSocketError::RemoteClosed),
                        1006,
                        "connection dropped",
                    );
                    fail(core, notes, record, DisconnectReason::Unknown);
                    return false;
                }
                SocketEvent::Opened | SocketEvent::OpenFailed { .. } => {}
            }
        }
        true
    }

    fn inbound(
        &self,
        core: &mut Core,
        notes: &mut Vec<Note>,
        parsed: std::result::Result<RawMessage, ProtocolViolation>,
    ) {
        core.metrics
            .frame_received(parsed.as_ref().ok().and_then(|raw| raw.path()));
        let event = match parsed.and_then(|raw| message::to_event(raw, &self.config.user_message_paths)) {
            Ok(event) => event,
            Err(violation) => {
                core.metrics.protocol_violation();
                log::warn!("dropping inbound message: {}", violation);
                return;
            }
        };

        match &event {
            InboundEvent::FinalPhrase(phrase) => {
                if let Some(audio) = &core.audio {
                    audio.buffer.discard_through_time(phrase.offset + phrase.duration);
                }
                if phrase.status.is_error() && !core.error_reported {
                    if let Some(record) = classify(ErrorSource::RecognitionStatus(phrase.status), 0, &phrase.json) {
                        log::warn!("recognition failed: {}", record);
                        core.error_reported = true;
                        notes.push(Note::Error(record));
                    }
                }
            }
            InboundEvent::TurnEnd => {
                // 先发送本轮遥测，再切换 request id
                self.queue_telemetry(core);
                core.request_id = message::new_request_id();
                if let Some(audio) = core.audio.as_mut() {
                    audio.buffer.new_turn();
                    audio.header_sent = false;
                }
            }
            _ => {}
        }
        notes.push(Note::Event(event));
    }

    fn pull_audio(&self, core: &mut Core) {
        let budget = self.config.max_send_per_cycle.max(1);
        let Some(audio) = core.audio.as_mut() else {
            return;
        };
        while core.queue.len() < budget {
            let Some(chunk) = audio.buffer.get_next() else {
                if audio.flush_requested {
                    audio.flush_requested = false;
                    core.next_id += 1;
                    core.queue.push_back(Pending {
                        frame_id: core.next_id,
                        frame: OutboundFrame::binary(PATH_AUDIO, bytes::Bytes::new())
                            .with_metric(MetricTag::AudioLast),
                        delivery: None,
                        request_id: None,
                    });
                }
                break;
            };
            let frame = if audio.header_sent {
                OutboundFrame::binary(PATH_AUDIO, chunk.data)
            } else {
                audio.header_sent = true;
                let header = audio.buffer.format().wav_header();
                let mut data = BytesMut::with_capacity(header.len() + chunk.data.len());
                data.put_slice(&header);
                data.put_slice(&chunk.data);
                OutboundFrame::binary(PATH_AUDIO, data.freeze()).with_metric(MetricTag::AudioStart)
            };
            core.next_id += 1;
            core.queue.push_back(Pending {
                frame_id: core.next_id,
                frame,
                delivery: None,
                request_id: None,
            });
        }
    }

    /// Queues the turn's telemetry under the request id that is ending.
    fn queue_telemetry(&self, core: &mut Core) {
        let report = core.metrics.take_telemetry();
        if report.is_empty() {
            return;
        }
        let json = match serde_json::to_string(&report) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("could not serialize telemetry: {}", e);
                return;
            }
        };
        let frame_id = core.next_id();
        core.queue.push_back(Pending {
            frame_id,
            frame: OutboundFrame::text(PATH_TELEMETRY, json).with_metric(MetricTag::Telemetry),
            delivery: None,
            request_id: Some(core.request_id.clone()),
        });
    }

    fn send_queued(&self, core: &mut Core, notes: &mut Vec<Note>) {
        let timestamp = message::timestamp();
        for _ in 0..self.config.max_send_per_cycle.max(1) {
            let Some(pending) = core.queue.pop_front() else {
                break;
            };
            let request_id = pending.request_id.as_deref().unwrap_or(&core.request_id);
            let payload = match message::encode(&pending.frame, request_id, &timestamp) {
                Ok(payload) => payload,
                Err(violation) => {
                    log::warn!("dropping outbound frame {}: {}", pending.frame_id, violation);
                    resolve(pending.delivery, false);
                    continue;
                }
            };
            match core.socket.send(pending.frame_id, payload) {
                Ok(()) => {
                    core.metrics
                        .frame_queued(pending.frame_id, pending.frame.metric, pending.frame.len());
                    core.in_flight.insert(pending.frame_id, pending.delivery);
                }
                Err(e) => {
                    resolve(pending.delivery, false);
                    let record = classify(
                        ErrorSource::Transport(WebSocketError::SendFrame),
                        0,
                        &e.to_string(),
                    );
                    fail(core, notes, record, DisconnectReason::Unknown);
                    return;
                }
            }
        }
    }

    fn poll_destroying(&self, core: &mut Core, notes: &mut Vec<Note>) {
        while let Some(event) = core.socket.poll_event() {
            match event {
                SocketEvent::PeerClosed { .. } | SocketEvent::Closed => {
                    close_now(core, notes, DisconnectReason::Normal, "closed by client");
                    return;
                }
                SocketEvent::Sent { frame_id, ok } => {
                    resolve(core.in_flight.remove(&frame_id).flatten(), ok);
                }
                _ => {}
            }
        }

        core.close_retries += 1;
        if core.close_retries >= self.config.close_retry_limit {
            log::warn!(
                "no close frame from the service after {} attempts, dropping connection {}",
                core.close_retries,
                core.connection_id
            );
            close_now(core, notes, DisconnectReason::Normal, "close handshake timed out");
        }
    }
}

fn run_pass(weak: &Weak<Inner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let mut notes = Vec::new();
    let next = {
        let mut core = inner.core.lock();
        inner.step(&mut core, &mut notes);
        match core.state {
            ConnectionState::Closed => {
                core.pass_scheduled = false;
                None
            }
            ConnectionState::Destroying => Some(Duration::from_millis(inner.config.close_retry_interval_ms)),
            _ => Some(Duration::from_millis(inner.config.polling_interval_ms)),
        }
    };
    inner.notify(notes);

    if let Some(delay) = next {
        if let Err(e) = Inner::schedule(&inner, delay) {
            log::warn!("transport pass could not be rescheduled: {}", e);
            let mut notes = Vec::new();
            {
                let mut core = inner.core.lock();
                core.pass_scheduled = false;
                close_now(&mut core, &mut notes, DisconnectReason::Unknown, "scheduler stopped");
            }
            inner.notify(notes);
        }
    }
}

fn open_failure(
    kind: WebSocketError,
    status: Option<u16>,
    headers: &[(String, String)],
    message: &str,
) -> Option<ErrorRecord> {
    match status {
        Some(status @ (301 | 307 | 308)) => {
            let location = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("location"))
                .map(|(_, value)| value.as_str())
                .unwrap_or_default();
            classify(ErrorSource::HttpStatus(status), status as i32, location)
        }
        Some(status) => classify(
            ErrorSource::Transport(WebSocketError::UpgradeFailed),
            status as i32,
            message,
        ),
        None => classify(ErrorSource::Transport(kind), 0, message),
    }
}

/// Reports at most one error, then closes.
fn fail(core: &mut Core, notes: &mut Vec<Note>, record: Option<ErrorRecord>, reason: DisconnectReason) {
    let detail = match record {
        Some(record) => {
            log::error!("connection {} failed: {}", core.connection_id, record);
            let detail = record.detail.clone();
            if !core.error_reported {
                core.error_reported = true;
                notes.push(Note::Error(record));
            }
            detail
        }
        None => String::new(),
    };
    close_now(core, notes, reason, &detail);
}

fn close_now(core: &mut Core, notes: &mut Vec<Note>, reason: DisconnectReason, detail: &str) {
    core.state = ConnectionState::Closed;
    core.socket.force_close();
    for pending in core.queue.drain(..) {
        resolve(pending.delivery, false);
    }
    for (_, delivery) in core.in_flight.drain() {
        resolve(delivery, false);
    }
    core.metrics.dropped();
    for waiter in core.close_waiters.drain(..) {
        let _ = waiter.send(Ok(()));
    }
    if !core.disconnect_reported {
        core.disconnect_reported = true;
        notes.push(Note::Disconnected(reason, detail.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::audio::AudioFormat;
    use crate::error_info::RetryMode;
    use crate::scheduler::SchedulerConfig;

    #[derive(Default)]
    struct MockState {
        opened: Vec<Vec<(String, String)>>,
        sent: Vec<(usize, WirePayload)>,
        closes: Vec<DisconnectReason>,
        forced: usize,
        events: VecDeque<SocketEvent>,
        /// Number of polls that found nothing; one per connected pass.
        idle_polls: usize,
    }

    #[derive(Clone, Default)]
    struct MockSocket(Arc<Mutex<MockState>>);

    impl MockSocket {
        fn push(&self, event: SocketEvent) {
            self.0.lock().events.push_back(event);
        }

        fn sent(&self) -> Vec<WirePayload> {
            self.0.lock().sent.iter().map(|(_, payload)| payload.clone()).collect()
        }
    }

    impl WebSocketIo for MockSocket {
        fn open(&mut self, _endpoint: &EndpointInfo, headers: &[(String, String)]) -> Result<()> {
            self.0.lock().opened.push(headers.to_vec());
            Ok(())
        }

        fn send(&mut self, frame_id: u64, payload: WirePayload) -> Result<()> {
            let mut state = self.0.lock();
            let pass = state.idle_polls;
            state.sent.push((pass, payload));
            state.events.push_back(SocketEvent::Sent { frame_id, ok: true });
            Ok(())
        }

        fn close(&mut self, reason: DisconnectReason, _detail: &str) {
            self.0.lock().closes.push(reason);
        }

        fn force_close(&mut self) {
            self.0.lock().forced += 1;
        }

        fn poll_event(&mut self) -> Option<SocketEvent> {
            let mut state = self.0.lock();
            let event = state.events.pop_front();
            if event.is_none() {
                state.idle_polls += 1;
            }
            event
        }
    }

    struct Fixture {
        _scheduler: Arc<Scheduler>,
        socket: MockSocket,
        transport: Transport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn fixture(config: TransportConfig) -> Fixture {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        scheduler.init().unwrap();
        let socket = MockSocket::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Transport::new(scheduler.clone(), Box::new(socket.clone()), Arc::new(tx), config);
        Fixture {
            _scheduler: scheduler,
            socket,
            transport,
            events: rx,
        }
    }

    fn endpoint() -> EndpointInfo {
        EndpointInfo::parse("wss://localhost/speech/recognition").unwrap()
    }

    fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(event) = events.try_recv() {
                return event;
            }
            assert!(Instant::now() < deadline, "no transport event within 2s");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn assert_quiet(events: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        std::thread::sleep(Duration::from_millis(100));
        assert!(events.try_recv().is_err());
    }

    fn connected(config: TransportConfig) -> Fixture {
        let mut fx = fixture(config);
        fx.socket.push(SocketEvent::Opened);
        fx.transport.connect(endpoint(), "conn-1").unwrap();
        assert_eq!(next_event(&mut fx.events), TransportEvent::Connected);
        fx
    }

    fn text(path: &str, body: &str) -> SocketEvent {
        SocketEvent::Text(format!("Path:{}\r\nX-RequestId:r\r\n\r\n{}", path, body))
    }

    fn header(payload: &WirePayload, name: &str) -> Option<String> {
        let raw = match payload {
            WirePayload::Text(text) => message::parse_text(text).unwrap(),
            WirePayload::Binary(data) => message::parse_binary(data).unwrap(),
        };
        raw.header(name).map(str::to_string)
    }

    #[test]
    fn test_connect_sends_connection_id_and_delivers_events() {
        let mut fx = connected(TransportConfig::default());
        assert_eq!(fx.transport.state(), ConnectionState::Connected);
        let opened = fx.socket.0.lock().opened.clone();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].contains(&(CONNECTION_ID_HEADER.to_string(), "conn-1".to_string())));

        fx.socket.push(text("turn.end", ""));
        assert_eq!(next_event(&mut fx.events), TransportEvent::Event(InboundEvent::TurnEnd));
        assert!(matches!(
            fx.transport.connect(endpoint(), "again"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_send_resolves_after_write() {
        let fx = connected(TransportConfig::default());
        let mut handle = fx
            .transport
            .send(OutboundFrame::text(message::PATH_SPEECH_CONFIG, "{}").with_metric(MetricTag::Config));
        assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap());

        let sent = fx.socket.sent();
        assert_eq!(header(&sent[0], "Path").as_deref(), Some("speech.config"));
        let metrics = fx.transport.metrics();
        assert_eq!(metrics.frames_sent, 1);
        assert_eq!(metrics.latency[&MetricTag::Config].count, 1);
    }

    #[test]
    fn test_send_budget_per_pass() {
        let mut fx = fixture(TransportConfig {
            max_send_per_cycle: 2,
            ..TransportConfig::default()
        });
        fx.socket.push(SocketEvent::Opened);
        fx.transport.connect(endpoint(), "conn").unwrap();
        let handles: Vec<_> = (0..5)
            .map(|i| fx.transport.send(OutboundFrame::text("telemetry", format!("{{\"n\":{}}}", i))))
            .collect();
        assert_eq!(next_event(&mut fx.events), TransportEvent::Connected);
        for mut handle in handles {
            assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap());
        }

        let passes: Vec<usize> = fx.socket.0.lock().sent.iter().map(|(pass, _)| *pass).collect();
        assert_eq!(passes.len(), 5);
        for pass in &passes {
            assert!(passes.iter().filter(|p| *p == pass).count() <= 2);
        }
        // FIFO
        let bodies: Vec<String> = fx
            .socket
            .sent()
            .into_iter()
            .map(|payload| match payload {
                WirePayload::Text(text) => text.rsplit("\r\n").next().unwrap_or_default().to_string(),
                WirePayload::Binary(_) => String::new(),
            })
            .collect();
        assert_eq!(bodies[0], "{\"n\":0}");
        assert_eq!(bodies[4], "{\"n\":4}");
    }

    #[test]
    fn test_redirect_on_open() {
        let mut fx = fixture(TransportConfig::default());
        fx.socket.push(SocketEvent::OpenFailed {
            kind: WebSocketError::UpgradeFailed,
            status: Some(307),
            headers: vec![("location".into(), "wss://westus2.example.com/speech".into())],
            message: String::new(),
        });
        fx.socket.push(SocketEvent::Closed);
        fx.transport.connect(endpoint(), "conn").unwrap();

        let TransportEvent::Error(record) = next_event(&mut fx.events) else {
            panic!("expected error");
        };
        assert_eq!(record.cancellation_code, CancellationCode::ServiceRedirectTemporary);
        assert_eq!(record.detail, "wss://westus2.example.com/speech");
        assert_eq!(record.retry_mode, RetryMode::Allowed);
        assert!(matches!(
            next_event(&mut fx.events),
            TransportEvent::Disconnected { .. }
        ));
        assert_quiet(&mut fx.events);
        assert_eq!(fx.transport.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_upgrade_rejected_with_auth_error() {
        let mut fx = fixture(TransportConfig::default());
        fx.socket.push(SocketEvent::OpenFailed {
            kind: WebSocketError::UpgradeFailed,
            status: Some(401),
            headers: Vec::new(),
            message: "denied".into(),
        });
        fx.transport.connect(endpoint(), "conn").unwrap();
        let TransportEvent::Error(record) = next_event(&mut fx.events) else {
            panic!("expected error");
        };
        assert_eq!(record.cancellation_code, CancellationCode::AuthenticationFailure);
        assert!(record.detail.starts_with("WebSocket upgrade failed:"));
    }

    #[test]
    fn test_single_disconnect_notification() {
        let mut fx = connected(TransportConfig::default());
        fx.socket.push(SocketEvent::PeerClosed {
            code: 1011,
            reason: "internal".into(),
        });
        fx.socket.push(SocketEvent::Closed);

        let TransportEvent::Error(record) = next_event(&mut fx.events) else {
            panic!("expected error");
        };
        assert_eq!(record.cancellation_code, CancellationCode::ConnectionFailure);
        assert_eq!(record.status_code, 1011);
        assert_eq!(
            next_event(&mut fx.events),
            TransportEvent::Disconnected {
                reason: DisconnectReason::InternalServerError,
                detail: record.detail.clone(),
            }
        );
        // a late disconnect does not notify again
        fx.transport.disconnect().wait().unwrap();
        assert_quiet(&mut fx.events);
    }

    #[test]
    fn test_forced_close_after_retry_budget() {
        let mut fx = connected(TransportConfig {
            close_retry_limit: 3,
            close_retry_interval_ms: 5,
            ..TransportConfig::default()
        });
        let mut closing = fx.transport.disconnect();
        assert_eq!(fx.transport.state(), ConnectionState::Destroying);
        closing.wait_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(fx.transport.state(), ConnectionState::Closed);
        assert_eq!(fx.socket.0.lock().closes, vec![DisconnectReason::Normal]);
        assert!(fx.socket.0.lock().forced >= 1);
        assert!(matches!(
            next_event(&mut fx.events),
            TransportEvent::Disconnected {
                reason: DisconnectReason::Normal,
                ..
            }
        ));
        assert!(fx.transport.metrics().dropped.is_some());
    }

    #[test]
    fn test_send_while_closed_is_rejected() {
        let fx = fixture(TransportConfig::default());
        assert!(!fx.transport.send(OutboundFrame::text("telemetry", "{}")).wait().unwrap());
    }

    #[test]
    fn test_protocol_violation_is_not_fatal() {
        let mut fx = connected(TransportConfig::default());
        fx.socket.push(SocketEvent::Text("garbage without headers".into()));
        fx.socket.push(text("no.such.path", "{}"));
        fx.socket.push(text("turn.end", ""));
        assert_eq!(next_event(&mut fx.events), TransportEvent::Event(InboundEvent::TurnEnd));
        assert_eq!(fx.transport.metrics().protocol_violations, 2);
        assert_eq!(fx.transport.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_audio_streaming_and_turns() {
        let format = AudioFormat::default();
        let buffer = Arc::new(AudioStreamBuffer::new(format));
        for _ in 0..3 {
            buffer.add(Bytes::from(vec![0u8; 3200]));
        }
        let mut fx = fixture(TransportConfig::default());
        fx.transport.attach_audio(buffer.clone());
        fx.socket.push(SocketEvent::Opened);
        fx.transport.connect(endpoint(), "conn").unwrap();
        assert_eq!(next_event(&mut fx.events), TransportEvent::Connected);

        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.socket.sent().len() < 3 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        let sent = fx.socket.sent();
        let WirePayload::Binary(first) = &sent[0] else {
            panic!("expected binary audio frame");
        };
        let raw = message::parse_binary(first).unwrap();
        assert!(raw.body.starts_with(b"RIFF"));
        assert_eq!(raw.body.len(), 44 + 3200);
        let WirePayload::Binary(second) = &sent[1] else {
            panic!("expected binary audio frame");
        };
        assert_eq!(message::parse_binary(second).unwrap().body.len(), 3200);
        assert_eq!(buffer.non_acknowledged_bytes(), 9600);

        // 0.1s of 16kHz mono 16-bit audio acknowledges the first chunk
        fx.socket.push(text(
            "speech.phrase",
            r#"{"RecognitionStatus":"Success","DisplayText":"hi","Offset":0,"Duration":1000000}"#,
        ));
        assert!(matches!(
            next_event(&mut fx.events),
            TransportEvent::Event(InboundEvent::FinalPhrase(_))
        ));
        assert_eq!(buffer.non_acknowledged_bytes(), 6400);

        let first_request = header(&sent[0], "X-RequestId");
        fx.socket.push(text("turn.end", ""));
        assert_eq!(next_event(&mut fx.events), TransportEvent::Event(InboundEvent::TurnEnd));

        // telemetry closes the old request, then the unacknowledged audio is
        // replayed under a new request id
        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.socket.sent().len() < 5 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        let sent = fx.socket.sent();
        assert_eq!(header(&sent[3], "Path").as_deref(), Some(PATH_TELEMETRY));
        assert_eq!(header(&sent[3], "X-RequestId"), first_request);
        let replay = &sent[4];
        assert_ne!(header(replay, "X-RequestId"), first_request);
        let WirePayload::Binary(replay) = replay else {
            panic!("expected binary audio frame");
        };
        assert!(message::parse_binary(replay).unwrap().body.starts_with(b"RIFF"));
    }

    #[test]
    fn test_flush_sends_empty_audio_frame_last() {
        let buffer = Arc::new(AudioStreamBuffer::new(AudioFormat::default()));
        buffer.add(Bytes::from(vec![1u8; 640]));
        let mut fx = fixture(TransportConfig::default());
        assert!(fx.transport.flush_audio().is_err());
        fx.transport.attach_audio(buffer);
        fx.transport.flush_audio().unwrap();
        fx.socket.push(SocketEvent::Opened);
        fx.transport.connect(endpoint(), "conn").unwrap();
        assert_eq!(next_event(&mut fx.events), TransportEvent::Connected);

        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.socket.sent().len() < 2 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        let WirePayload::Binary(last) = &fx.socket.sent()[1] else {
            panic!("expected binary audio frame");
        };
        assert!(message::parse_binary(last).unwrap().body.is_empty());
    }

    #[test]
    fn test_turn_end_sends_telemetry_before_callback() {
        let mut fx = connected(TransportConfig::default());
        let mut config = fx
            .transport
            .send(OutboundFrame::text(message::PATH_SPEECH_CONFIG, "{}"));
        assert!(config.wait_timeout(Duration::from_secs(2)).unwrap());
        let request = header(&fx.socket.sent()[0], "X-RequestId");

        fx.socket.push(text("turn.start", r#"{"context":{"serviceTag":"t"}}"#));
        fx.socket.push(text("turn.end", ""));
        assert!(matches!(next_event(&mut fx.events), TransportEvent::Event(InboundEvent::TurnStart { .. })));
        assert_eq!(next_event(&mut fx.events), TransportEvent::Event(InboundEvent::TurnEnd));

        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.socket.sent().len() < 2 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        let telemetry = &fx.socket.sent()[1];
        assert_eq!(header(telemetry, "Path").as_deref(), Some(PATH_TELEMETRY));
        assert_eq!(header(telemetry, "X-RequestId"), request);

        let WirePayload::Text(first) = telemetry else {
            panic!("expected text frame");
        };
        let body = message::parse_text(first).unwrap().body;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["Metrics"][0]["Name"], "Connection");
        assert_eq!(json["Metrics"][0]["Id"], "conn-1");
        let received: Vec<String> = json["ReceivedMessages"]
            .as_array()
            .unwrap()
            .iter()
            .flat_map(|entry| entry.as_object().unwrap().keys().cloned().collect::<Vec<_>>())
            .collect();
        assert_eq!(received, vec!["turn.end".to_string(), "turn.start".to_string()]);

        // the next turn reports only what it saw
        fx.socket.push(text("turn.end", ""));
        assert_eq!(next_event(&mut fx.events), TransportEvent::Event(InboundEvent::TurnEnd));
        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.socket.sent().len() < 3 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        let WirePayload::Text(second) = &fx.socket.sent()[2] else {
            panic!("expected text frame");
        };
        let body = message::parse_text(second).unwrap().body;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["Metrics"].as_array().map(Vec::len), Some(0));
        assert_ne!(header(&fx.socket.sent()[2], "X-RequestId"), request);
    }

    #[test]
    fn test_oversized_binary_frame_is_rejected_at_send() {
        let fx = connected(TransportConfig::default());
        let frame = OutboundFrame::binary("p".repeat(70_000), Bytes::from_static(&[1]));
        assert!(!fx.transport.send(frame).wait().unwrap());
        assert_eq!(fx.transport.state(), ConnectionState::Connected);

        let mut ok = fx.transport.send(OutboundFrame::text(message::PATH_SPEECH_CONFIG, "{}"));
        assert!(ok.wait_timeout(Duration::from_secs(2)).unwrap());
        assert_eq!(fx.socket.sent().len(), 1);
    }

    #[test]
    fn test_recognition_error_status() {
        let mut fx = connected(TransportConfig::default());
        fx.socket.push(text(
            "speech.phrase",
            r#"{"RecognitionStatus":"TooManyRequests","Offset":0,"Duration":0}"#,
        ));
        let TransportEvent::Error(record) = next_event(&mut fx.events) else {
            panic!("expected error");
        };
        assert_eq!(record.cancellation_code, CancellationCode::TooManyRequests);
        assert!(matches!(
            next_event(&mut fx.events),
            TransportEvent::Event(InboundEvent::FinalPhrase(_))
        ));
    }
}
