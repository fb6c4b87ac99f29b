use bytes::Bytes;

use super::endpoint::EndpointInfo;
use super::events::DisconnectReason;
use super::message::WirePayload;
use crate::error::Result;
use crate::error_info::WebSocketError;

/// Something that happened on the socket since the last poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    OpenFailed {
        kind: WebSocketError,
        /// HTTP status of the upgrade response, if one was received.
        status: Option<u16>,
        headers: Vec<(String, String)>,
        message: String,
    },
    Text(String),
    Binary(Bytes),
    Sent {
        frame_id: u64,
        ok: bool,
    },
    PeerClosed {
        code: u16,
        reason: String,
    },
    Error {
        kind: WebSocketError,
        code: i32,
        message: String,
    },
    /// The connection is gone; no further events follow.
    Closed,
}

/// Non-blocking websocket used by the transport state machine.
///
/// Every method returns immediately; outcomes arrive later through
/// [`poll_event`](WebSocketIo::poll_event).
pub trait WebSocketIo: Send {
    fn open(&mut self, endpoint: &EndpointInfo, headers: &[(String, String)]) -> Result<()>;

    fn send(&mut self, frame_id: u64, payload: WirePayload) -> Result<()>;

    /// Starts the close handshake.
    fn close(&mut self, reason: DisconnectReason, detail: &str);

    /// Drops the connection without waiting for the peer.
    fn force_close(&mut self);

    fn poll_event(&mut self) -> Option<SocketEvent>;
}
