//! Wire framing for the speech protocol.
//!
//! Text frames are a header block, a blank line and a JSON body:
//!
//! ```text
//! Path:speech.config\r\n
//! X-RequestId:2f1c0b6ad4c34c8e9d7f0e4b0b1f7a2e\r\n
//! X-Timestamp:2024-05-01T10:00:00.000Z\r\n
//! Content-Type:application/json\r\n
//! \r\n
//! {"context":{...}}
//! ```
//!
//! Binary frames start with a big-endian `u16` header length, followed by the
//! header block and the raw body.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::events::{Hypothesis, InboundEvent, Phrase, Translation};
use super::metrics::MetricTag;
use crate::error_info::RecognitionStatus;

pub const HEADER_PATH: &str = "Path";
pub const HEADER_REQUEST_ID: &str = "X-RequestId";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

pub const PATH_AUDIO: &str = "audio";
pub const PATH_SPEECH_CONFIG: &str = "speech.config";
pub const PATH_SPEECH_CONTEXT: &str = "speech.context";
pub const PATH_TELEMETRY: &str = "telemetry";

/// Largest header block a binary frame's `u16` length prefix can describe.
pub const MAX_BINARY_HEADER_LEN: usize = u16::MAX as usize;

// request id, timestamp and header names never need more than this
const FIXED_HEADER_LEN: usize = 128;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_WAV: &str = "audio/x-wav";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("message has no Path header")]
    MissingPath,
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("text message has no header terminator")]
    MissingHeaderTerminator,
    #[error("binary message truncated ({0} bytes)")]
    TruncatedBinary(usize),
    #[error("unknown message path: {0}")]
    UnknownPath(String),
    #[error("invalid {path} payload: {reason}")]
    InvalidPayload { path: String, reason: String },
    #[error("binary header block of {0} bytes does not fit the length prefix")]
    HeaderTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Text(String),
    Binary(Bytes),
}

/// A message queued for sending.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub path: String,
    pub content_type: String,
    pub body: FrameBody,
    pub metric: Option<MetricTag>,
}

impl OutboundFrame {
    pub fn text(path: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            body: FrameBody::Text(json.into()),
            metric: None,
        }
    }

    pub fn binary(path: impl Into<String>, data: Bytes) -> Self {
        Self {
            path: path.into(),
            content_type: CONTENT_TYPE_WAV.to_string(),
            body: FrameBody::Binary(data),
            metric: None,
        }
    }

    pub fn with_metric(mut self, tag: MetricTag) -> Self {
        self.metric = Some(tag);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn len(&self) -> usize {
        match &self.body {
            FrameBody::Text(text) => text.len(),
            FrameBody::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False for a binary frame whose headers could not be length-prefixed.
    pub fn headers_fit(&self) -> bool {
        match self.body {
            FrameBody::Text(_) => true,
            FrameBody::Binary(_) => {
                self.path.len() + self.content_type.len() + FIXED_HEADER_LEN <= MAX_BINARY_HEADER_LEN
            }
        }
    }
}

/// An encoded frame ready for the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    Text(String),
    Binary(Bytes),
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn header_block(frame: &OutboundFrame, request_id: &str, timestamp: &str) -> String {
    format!(
        "{}:{}\r\n{}:{}\r\n{}:{}\r\n{}:{}\r\n",
        HEADER_PATH,
        frame.path,
        HEADER_REQUEST_ID,
        request_id,
        HEADER_TIMESTAMP,
        timestamp,
        HEADER_CONTENT_TYPE,
        frame.content_type
    )
}

pub fn encode(
    frame: &OutboundFrame,
    request_id: &str,
    timestamp: &str,
) -> Result<WirePayload, ProtocolViolation> {
    let headers = header_block(frame, request_id, timestamp);
    match &frame.body {
        FrameBody::Text(body) => Ok(WirePayload::Text(format!("{}\r\n{}", headers, body))),
        FrameBody::Binary(body) => {
            let header_len =
                u16::try_from(headers.len()).map_err(|_| ProtocolViolation::HeaderTooLarge(headers.len()))?;
            let mut out = BytesMut::with_capacity(2 + headers.len() + body.len());
            out.put_u16(header_len);
            out.put_slice(headers.as_bytes());
            out.put_slice(body);
            Ok(WirePayload::Binary(out.freeze()))
        }
    }
}

/// A decoded but not yet interpreted inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn path(&self) -> Option<&str> {
        self.header(HEADER_PATH).filter(|path| !path.is_empty())
    }

    pub fn request_id(&self) -> Option<&str> {
        self.header(HEADER_REQUEST_ID)
    }
}

fn parse_headers(block: &str) -> Result<Vec<(String, String)>, ProtocolViolation> {
    block
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolViolation::MalformedHeader(line.to_string()))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn parse_text(text: &str) -> Result<RawMessage, ProtocolViolation> {
    let (block, body) = text
        .split_once("\r\n\r\n")
        .ok_or(ProtocolViolation::MissingHeaderTerminator)?;
    Ok(RawMessage {
        headers: parse_headers(block)?,
        body: Bytes::copy_from_slice(body.as_bytes()),
    })
}

pub fn parse_binary(data: &Bytes) -> Result<RawMessage, ProtocolViolation> {
    if data.len() < 2 {
        return Err(ProtocolViolation::TruncatedBinary(data.len()));
    }
    let header_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + header_len {
        return Err(ProtocolViolation::TruncatedBinary(data.len()));
    }
    let block = std::str::from_utf8(&data[2..2 + header_len])
        .map_err(|e| ProtocolViolation::MalformedHeader(e.to_string()))?;
    Ok(RawMessage {
        headers: parse_headers(block)?,
        body: data.slice(2 + header_len..),
    })
}

#[derive(Deserialize)]
struct TurnStartPayload {
    #[serde(default)]
    context: Option<TurnContext>,
}

#[derive(Deserialize)]
struct TurnContext {
    #[serde(rename = "serviceTag")]
    service_tag: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OffsetPayload {
    offset: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PhrasePayload {
    recognition_status: RecognitionStatus,
    #[serde(default)]
    display_text: Option<String>,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    duration: u64,
    #[serde(default, rename = "NBest")]
    nbest: Vec<NBestEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NBestEntry {
    #[serde(default)]
    display: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TranslationPayload {
    #[serde(default)]
    recognition_status: Option<RecognitionStatus>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    translation: Option<TranslationBlock>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TranslationBlock {
    #[serde(default)]
    translations: Vec<TranslationEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TranslationEntry {
    language: String,
    text: String,
}

fn json<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T, ProtocolViolation> {
    if body.is_empty() {
        return Err(ProtocolViolation::InvalidPayload {
            path: path.to_string(),
            reason: "empty body".to_string(),
        });
    }
    serde_json::from_slice(body).map_err(|e| ProtocolViolation::InvalidPayload {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

fn translation(path: &str, body: &[u8]) -> Result<Translation, ProtocolViolation> {
    let payload: TranslationPayload = json(path, body)?;
    Ok(Translation {
        status: payload.recognition_status,
        text: payload.text,
        offset: payload.offset,
        duration: payload.duration,
        translations: payload
            .translation
            .map(|block| {
                block
                    .translations
                    .into_iter()
                    .map(|entry| (entry.language, entry.text))
                    .collect()
            })
            .unwrap_or_default(),
        json: String::from_utf8_lossy(body).into_owned(),
    })
}

/// Interprets a raw message by its `Path` header. Paths outside the protocol
/// are accepted only if listed in `user_paths` (or `user_paths` has `"*"`).
pub fn to_event(raw: RawMessage, user_paths: &[String]) -> Result<InboundEvent, ProtocolViolation> {
    let path = raw.path().ok_or(ProtocolViolation::MissingPath)?.to_string();
    let body = &raw.body[..];

    let event = match path.to_ascii_lowercase().as_str() {
        "turn.start" => {
            let payload: TurnStartPayload = json(&path, body)?;
            InboundEvent::TurnStart {
                service_tag: payload.context.and_then(|context| context.service_tag),
            }
        }
        "turn.end" => InboundEvent::TurnEnd,
        "speech.startdetected" => {
            let payload: OffsetPayload = json(&path, body)?;
            InboundEvent::SpeechStartDetected {
                offset: payload.offset,
            }
        }
        "speech.enddetected" => {
            let payload: OffsetPayload = json(&path, body)?;
            InboundEvent::SpeechEndDetected {
                offset: payload.offset,
            }
        }
        "speech.hypothesis" => InboundEvent::InterimHypothesis(json::<Hypothesis>(&path, body)?),
        "speech.fragment" => InboundEvent::Fragment(json::<Hypothesis>(&path, body)?),
        "speech.phrase" => {
            let payload: PhrasePayload = json(&path, body)?;
            let text = payload
                .display_text
                .or_else(|| payload.nbest.into_iter().next().and_then(|best| best.display))
                .unwrap_or_default();
            InboundEvent::FinalPhrase(Phrase {
                status: payload.recognition_status,
                text,
                offset: payload.offset,
                duration: payload.duration,
                json: String::from_utf8_lossy(body).into_owned(),
            })
        }
        "translation.hypothesis" => InboundEvent::TranslationHypothesis(translation(&path, body)?),
        "translation.phrase" => InboundEvent::TranslationPhrase(translation(&path, body)?),
        _ if user_paths.iter().any(|p| p == "*" || p.eq_ignore_ascii_case(&path)) => {
            InboundEvent::NamedUserMessage {
                content_type: raw.header(HEADER_CONTENT_TYPE).map(str::to_string),
                body: raw.body.clone(),
                path,
            }
        }
        _ => return Err(ProtocolViolation::UnknownPath(path)),
    };
    Ok(event)
}
