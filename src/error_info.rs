//! Uniform classification of failures into [`ErrorRecord`]s.
//!
//! Every failure the runtime reports to a caller (an explicit error, a bad
//! recognition status from the service, a websocket failure, an HTTP status on
//! the upgrade request) goes through [`classify`], so that cancellation codes
//! and retry eligibility are decided in exactly one place.

use std::fmt;

use serde::Deserialize;

use crate::transport::DisconnectReason;

/// Externally visible cancellation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CancellationCode {
    NoError = 0,
    AuthenticationFailure = 1,
    BadRequest = 2,
    TooManyRequests = 3,
    Forbidden = 4,
    ConnectionFailure = 5,
    ServiceTimeout = 6,
    ServiceError = 7,
    ServiceUnavailable = 8,
    RuntimeError = 9,
    ServiceRedirectTemporary = 10,
    ServiceRedirectPermanent = 11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    Error,
    EndOfStream,
    CancelledByUser,
}

/// Whether the caller may reasonably retry the failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    Allowed,
    NotAllowed,
}

/// `RecognitionStatus` as reported in `speech.phrase` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RecognitionStatus {
    Success,
    NoMatch,
    InitialSilenceTimeout,
    #[serde(alias = "InitialBabbleTimeout")]
    BabbleTimeout,
    Error,
    EndOfDictation,
    TooManyRequests,
    BadRequest,
    Forbidden,
    ServiceUnavailable,
    InvalidMessage,
    #[serde(other)]
    Unknown,
}

impl RecognitionStatus {
    /// True for statuses that end the turn with a service-side error.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            RecognitionStatus::Error
                | RecognitionStatus::TooManyRequests
                | RecognitionStatus::BadRequest
                | RecognitionStatus::Forbidden
                | RecognitionStatus::ServiceUnavailable
                | RecognitionStatus::InvalidMessage
        )
    }
}

/// Failure kinds reported by the websocket layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WebSocketError {
    Unknown = 0,
    RemoteClosed = 1,
    ConnectionFailure = 2,
    UpgradeFailed = 3,
    SendFrame = 4,
    WebSocket = 5,
    DnsFailure = 6,
}

/// Where a failure came from. The payload is the category code for that source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Explicit(CancellationCode),
    RecognitionStatus(RecognitionStatus),
    Transport(WebSocketError),
    HttpStatus(u16),
}

impl ErrorSource {
    fn category_code(self) -> i32 {
        match self {
            ErrorSource::Explicit(code) => code as i32,
            ErrorSource::RecognitionStatus(status) => status as i32,
            ErrorSource::Transport(kind) => kind as i32,
            ErrorSource::HttpStatus(status) => status as i32,
        }
    }
}

/// An immutable, classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub detail: String,
    pub category_code: i32,
    pub status_code: i32,
    pub cancellation_code: CancellationCode,
    pub cancellation_reason: CancellationReason,
    pub retry_mode: RetryMode,
}

impl ErrorRecord {
    pub fn explicit(code: CancellationCode, detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            category_code: code as i32,
            status_code: 0,
            cancellation_code: code,
            cancellation_reason: CancellationReason::Error,
            retry_mode: RetryMode::NotAllowed,
        }
    }

    pub fn runtime(detail: impl Into<String>) -> Self {
        Self::explicit(CancellationCode::RuntimeError, detail)
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_mode == RetryMode::Allowed
    }

    pub fn is_redirect(&self) -> bool {
        matches!(
            self.cancellation_code,
            CancellationCode::ServiceRedirectTemporary | CancellationCode::ServiceRedirectPermanent
        )
    }

    /// Derives a new record with `extra` appended to the detail text; every
    /// classification field is preserved.
    pub fn append_detail(&self, extra: &str) -> Self {
        Self {
            detail: format!("{} {}", self.detail, extra),
            ..self.clone()
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} (category {}, status {}): {}",
            self.cancellation_code, self.category_code, self.status_code, self.detail
        )
    }
}

/// Maps a failure to a record. Returns `None` only for 2xx HTTP statuses.
pub fn classify(source: ErrorSource, status_code: i32, detail: &str) -> Option<ErrorRecord> {
    match source {
        ErrorSource::Explicit(code) => Some(ErrorRecord {
            status_code,
            ..ErrorRecord::explicit(code, detail)
        }),
        ErrorSource::RecognitionStatus(status) => Some(from_recognition_status(status, detail)),
        ErrorSource::Transport(kind) => Some(from_transport(kind, status_code, detail)),
        ErrorSource::HttpStatus(status) => from_http_status(status, status_code, "", detail, true),
    }
}

/// Classifies an HTTP status with an explicit message prefix, the way the
/// upgrade path reports `"WebSocket upgrade failed:"` failures.
pub fn classify_http(status: u16, prefix: &str, detail: &str) -> Option<ErrorRecord> {
    from_http_status(status, 0, prefix, detail, true)
}

fn from_recognition_status(status: RecognitionStatus, response_text: &str) -> ErrorRecord {
    let (msg, code) = match status {
        RecognitionStatus::Error => (
            "The speech service encountered an internal error and could not continue.",
            CancellationCode::ServiceError,
        ),
        RecognitionStatus::TooManyRequests => (
            "The number of parallel requests exceeded the number of allowed concurrent transcriptions.",
            CancellationCode::TooManyRequests,
        ),
        RecognitionStatus::BadRequest => (
            "Invalid parameter or unsupported audio format in the request.",
            CancellationCode::BadRequest,
        ),
        RecognitionStatus::Forbidden => (
            "The recognizer is using a free subscription that ran out of quota.",
            CancellationCode::Forbidden,
        ),
        RecognitionStatus::ServiceUnavailable => (
            "The service is currently unavailable.",
            CancellationCode::ServiceUnavailable,
        ),
        RecognitionStatus::InvalidMessage => ("Invalid response.", CancellationCode::ServiceError),
        RecognitionStatus::Success
        | RecognitionStatus::NoMatch
        | RecognitionStatus::InitialSilenceTimeout
        | RecognitionStatus::BabbleTimeout
        | RecognitionStatus::EndOfDictation => (
            "Unexpected error callback for non-error recognition status.",
            CancellationCode::RuntimeError,
        ),
        RecognitionStatus::Unknown => (
            "Runtime Error: invalid recognition status.",
            CancellationCode::RuntimeError,
        ),
    };

    ErrorRecord {
        detail: format!("{} Response text: {}", msg, response_text),
        category_code: status as i32,
        status_code: 0,
        cancellation_code: code,
        cancellation_reason: CancellationReason::Error,
        retry_mode: RetryMode::Allowed,
    }
}

fn from_transport(kind: WebSocketError, status_code: i32, detail: &str) -> ErrorRecord {
    let mut retry_mode = RetryMode::Allowed;
    let msg = match kind {
        WebSocketError::RemoteClosed => {
            if matches!(
                DisconnectReason::from_code(status_code),
                DisconnectReason::ProtocolError | DisconnectReason::InvalidPayloadData
            ) {
                retry_mode = RetryMode::NotAllowed;
            }
            format!(
                "Connection was closed by the remote host. Error code: {}. Error details: {}",
                status_code, detail
            )
        }
        WebSocketError::ConnectionFailure => format!(
            "Connection failed (no connection to the remote host). Internal error: {}. Error details: {}",
            status_code, detail
        ),
        WebSocketError::UpgradeFailed => {
            // 升级请求必须返回 101；即便是 2xx 也算失败
            let status = u16::try_from(status_code).unwrap_or(0);
            return from_http_status(status, status_code, "WebSocket upgrade failed:", detail, false)
                .unwrap_or_else(|| ErrorRecord::runtime(detail));
        }
        WebSocketError::SendFrame => format!(
            "Failure while sending a frame over the WebSocket connection. Internal error: {}. Error details: {}",
            status_code, detail
        ),
        WebSocketError::WebSocket => format!(
            "WebSocket operation failed. Internal error: {}. Error details: {}",
            status_code, detail
        ),
        WebSocketError::DnsFailure => format!(
            "DNS connection failed (the remote host did not respond). Internal error: {}.",
            status_code
        ),
        WebSocketError::Unknown => "Unknown transport error.".to_string(),
    };

    ErrorRecord {
        detail: msg,
        category_code: kind as i32,
        status_code,
        cancellation_code: CancellationCode::ConnectionFailure,
        cancellation_reason: CancellationReason::Error,
        retry_mode,
    }
}

fn from_http_status(
    status: u16,
    status_code: i32,
    prefix: &str,
    body: &str,
    success_is_none: bool,
) -> Option<ErrorRecord> {
    if success_is_none && (200..300).contains(&status) {
        return None;
    }

    let mut msg = String::new();
    if !prefix.is_empty() {
        msg.push_str(prefix);
        msg.push(' ');
    }

    let mut retry_mode = RetryMode::Allowed;
    let mut reason = CancellationReason::Error;
    let code = match status {
        400 => {
            msg.push_str(&format!(
                "Bad request ({}). Please verify the provided subscription details and language information.",
                status
            ));
            retry_mode = RetryMode::NotAllowed;
            CancellationCode::BadRequest
        }
        415 => {
            msg.push_str(&format!(
                "Unsupported media type ({}). Please verify the format of the request input.",
                status
            ));
            retry_mode = RetryMode::NotAllowed;
            CancellationCode::BadRequest
        }
        401 | 403 => {
            msg.push_str(&format!(
                "Authentication error ({}). Please check subscription information and region name.",
                status
            ));
            retry_mode = RetryMode::NotAllowed;
            CancellationCode::AuthenticationFailure
        }
        429 => {
            msg.push_str(&format!(
                "Too many requests ({}). Please check subscription information and region name.",
                status
            ));
            CancellationCode::TooManyRequests
        }
        301 | 307 | 308 => {
            let temporary = status == 307;
            // 重定向：body 即新的地址，调用方据此重试
            if body.is_empty() {
                retry_mode = RetryMode::NotAllowed;
                msg.push_str(&format!(
                    "A {} redirect ({}). Redirect location unknown.",
                    if temporary { "temporary" } else { "permanent" },
                    status
                ));
            } else {
                msg = body.to_string();
            }
            let code = if temporary {
                CancellationCode::ServiceRedirectTemporary
            } else {
                CancellationCode::ServiceRedirectPermanent
            };
            return Some(ErrorRecord {
                detail: msg,
                category_code: status as i32,
                status_code,
                cancellation_code: code,
                cancellation_reason: reason,
                retry_mode,
            });
        }
        503 => {
            msg.push_str(&format!(
                "Service unavailable ({}). Please try the request again.",
                status
            ));
            CancellationCode::ServiceUnavailable
        }
        408 => {
            msg.push_str(&format!("Timeout ({}). Please try the request again.", status));
            CancellationCode::ServiceTimeout
        }
        499 => {
            msg.push_str(&format!("Request closed by client ({}).", status));
            retry_mode = RetryMode::NotAllowed;
            reason = CancellationReason::CancelledByUser;
            CancellationCode::NoError
        }
        404 | 409 | 500..=599 => {
            msg.push_str(&format!(
                "Internal service error ({}). Please check request details.",
                status
            ));
            CancellationCode::ServiceError
        }
        _ => {
            msg.push_str(&format!("Unspecified connection error ({}).", status));
            CancellationCode::ConnectionFailure
        }
    };

    if !body.is_empty() {
        msg.push(' ');
        msg.push_str(body);
    }

    Some(ErrorRecord {
        detail: msg,
        category_code: status as i32,
        status_code,
        cancellation_code: code,
        cancellation_reason: reason,
        retry_mode,
    })
}
