//! Audio buffering between the caller and the transport.
//!
//! Audio is opaque bytes in a declared PCM format. Bytes are the canonical
//! unit; times (100ns ticks) are derived through the buffer's format.

mod buffer;
mod format;

pub use buffer::{AudioChunk, AudioStreamBuffer};
pub use format::{AudioFormat, TICKS_PER_SECOND};
