use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error_info::{ErrorRecord, RecognitionStatus};

/// Websocket close codes the runtime distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Normal,
    EndpointUnavailable,
    ProtocolError,
    CannotAcceptDataType,
    InvalidPayloadData,
    PolicyViolation,
    MessageTooBig,
    UnexpectedCondition,
    InternalServerError,
    Unknown,
}

impl DisconnectReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            1000 => DisconnectReason::Normal,
            1001 => DisconnectReason::EndpointUnavailable,
            1002 => DisconnectReason::ProtocolError,
            1003 => DisconnectReason::CannotAcceptDataType,
            1007 => DisconnectReason::InvalidPayloadData,
            1008 => DisconnectReason::PolicyViolation,
            1009 => DisconnectReason::MessageTooBig,
            1010 => DisconnectReason::UnexpectedCondition,
            1011 => DisconnectReason::InternalServerError,
            _ => DisconnectReason::Unknown,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            DisconnectReason::Normal => 1000,
            DisconnectReason::EndpointUnavailable => 1001,
            DisconnectReason::ProtocolError => 1002,
            DisconnectReason::CannotAcceptDataType => 1003,
            DisconnectReason::InvalidPayloadData => 1007,
            DisconnectReason::PolicyViolation => 1008,
            DisconnectReason::MessageTooBig => 1009,
            DisconnectReason::UnexpectedCondition => 1010,
            DisconnectReason::InternalServerError => 1011,
            DisconnectReason::Unknown => u16::MAX,
        }
    }
}

/// Interim result from `speech.hypothesis` or `speech.fragment`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hypothesis {
    pub text: String,
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
}

/// Final result of a phrase.
#[derive(Debug, Clone, PartialEq)]
pub struct Phrase {
    pub status: RecognitionStatus,
    pub text: String,
    pub offset: u64,
    pub duration: u64,
    /// The untouched JSON payload.
    pub json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub status: Option<RecognitionStatus>,
    pub text: String,
    pub offset: u64,
    pub duration: u64,
    /// `(language, text)` pairs.
    pub translations: Vec<(String, String)>,
    pub json: String,
}

/// A typed protocol message received from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TurnStart { service_tag: Option<String> },
    TurnEnd,
    SpeechStartDetected { offset: u64 },
    SpeechEndDetected { offset: u64 },
    InterimHypothesis(Hypothesis),
    FinalPhrase(Phrase),
    Fragment(Hypothesis),
    TranslationHypothesis(Translation),
    TranslationPhrase(Translation),
    NamedUserMessage {
        path: String,
        content_type: Option<String>,
        body: Bytes,
    },
}

/// Everything a [`Transport`](super::Transport) reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
        detail: String,
    },
    Event(InboundEvent),
    Error(ErrorRecord),
}

/// Receives transport notifications. Called from a scheduler lane, so
/// implementations must not block for long.
pub trait TransportCallbacks: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self, _reason: DisconnectReason, _detail: &str) {}
    fn on_event(&self, _event: InboundEvent) {}
    fn on_error(&self, _error: ErrorRecord) {}
}

impl TransportCallbacks for mpsc::UnboundedSender<TransportEvent> {
    fn on_connected(&self) {
        let _ = self.send(TransportEvent::Connected);
    }

    fn on_disconnected(&self, reason: DisconnectReason, detail: &str) {
        let _ = self.send(TransportEvent::Disconnected {
            reason,
            detail: detail.to_string(),
        });
    }

    fn on_event(&self, event: InboundEvent) {
        let _ = self.send(TransportEvent::Event(event));
    }

    fn on_error(&self, error: ErrorRecord) {
        let _ = self.send(TransportEvent::Error(error));
    }
}
