//! Client runtime for a streaming speech-recognition service.
//!
//! The pieces are: a [`HandleRegistry`] for objects shared across an API
//! boundary, a two-lane [`Scheduler`], an [`AudioStreamBuffer`] that replays
//! unacknowledged audio, and a [`Transport`] that speaks the service's
//! websocket protocol. A [`SpeechContext`] owns all of them and shuts them down
//! in order.

pub mod audio;
pub mod config;
pub mod context;
pub mod credentials;
pub mod diagnostics;
pub mod error;
pub mod error_info;
pub mod handles;
pub mod scheduler;
pub mod transport;

pub use audio::{AudioChunk, AudioFormat, AudioStreamBuffer};
pub use config::RuntimeConfig;
pub use context::SpeechContext;
pub use credentials::{Credential, CredentialRenewalTimer, CredentialSource, StaticCredential, TokenIssuer};
pub use error::{Error, Result};
pub use error_info::{CancellationCode, ErrorRecord, ErrorSource, RetryMode, classify};
pub use handles::{Handle, HandleRegistry, HandleTable};
pub use scheduler::{Affinity, Repeat, Scheduler, TaskHandle, TimerHandle};
pub use transport::{
    ConnectionState, EndpointInfo, InboundEvent, OutboundFrame, Transport, TransportCallbacks, TransportEvent,
};
