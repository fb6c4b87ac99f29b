use thiserror::Error;

use crate::error_info::ErrorRecord;
use crate::handles::Handle;

/// Errors raised by the runtime itself.
///
/// These are programmer or lifecycle errors: they are returned immediately and
/// never retried. Failures coming from the remote service are described by
/// [`ErrorRecord`] instead and reach callers through the transport callbacks.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Aborted: {0}")]
    Abort(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Service error: {0}")]
    Service(ErrorRecord),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
