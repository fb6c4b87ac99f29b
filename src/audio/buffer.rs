use std::collections::VecDeque;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;

use super::AudioFormat;

/// A slice of audio handed to the transport.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Bytes,
    pub received_at: SystemTime,
    /// Absolute byte offset of `data[0]` in the stream.
    pub offset: u64,
}

struct StoredChunk {
    start: u64,
    data: Bytes,
    received_at: SystemTime,
}

impl StoredChunk {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

struct State {
    chunks: VecDeque<StoredChunk>,
    written: u64,
    served: u64,
    discarded: u64,
    turn_start: u64,
}

/// Buffered audio with acknowledgement tracking.
///
/// Three cursors move forward through the byte stream: `written` (everything
/// added), `served` (handed to the transport) and `discarded` (acknowledged by
/// the service). Bytes between `discarded` and `written` are stashed and get
/// replayed after [`new_turn`](Self::new_turn).
pub struct AudioStreamBuffer {
    format: AudioFormat,
    state: Mutex<State>,
}

impl AudioStreamBuffer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            state: Mutex::new(State {
                chunks: VecDeque::new(),
                written: 0,
                served: 0,
                discarded: 0,
                turn_start: 0,
            }),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn add(&self, data: Bytes) {
        self.add_at(data, SystemTime::now());
    }

    pub fn add_at(&self, data: Bytes, received_at: SystemTime) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let start = state.written;
        state.written += data.len() as u64;
        state.chunks.push_back(StoredChunk {
            start,
            data,
            received_at,
        });
    }

    /// Returns the unserved remainder of the chunk at the served cursor and
    /// advances the cursor past it.
    pub fn get_next(&self) -> Option<AudioChunk> {
        let mut state = self.state.lock();
        let served = state.served;
        if served >= state.written {
            return None;
        }
        let chunk = state
            .chunks
            .iter()
            .find(|chunk| chunk.start <= served && served < chunk.end())?;
        let next = AudioChunk {
            data: chunk.data.slice((served - chunk.start) as usize..),
            received_at: chunk.received_at,
            offset: served,
        };
        let end = chunk.end();
        state.served = end;
        Some(next)
    }

    /// Acknowledges `size` more bytes past the current discard point.
    pub fn discard_bytes(&self, size: u64) {
        let mut state = self.state.lock();
        let target = state.discarded + size;
        Self::discard_to(&mut state, target);
    }

    /// Acknowledges audio up to `ticks` (relative to the current turn) and
    /// returns the receipt time of the audio at the new discard point.
    pub fn discard_through_time(&self, ticks: u64) -> Option<SystemTime> {
        let mut state = self.state.lock();
        let target = state.turn_start + self.format.ticks_to_bytes(ticks);
        Self::discard_to(&mut state, target);
        let discarded = state.discarded;
        state
            .chunks
            .iter()
            .find(|chunk| chunk.start <= discarded && discarded < chunk.end())
            .map(|chunk| chunk.received_at)
    }

    fn discard_to(state: &mut State, target: u64) {
        // 只能确认已发送的数据
        let target = target.min(state.served);
        if target <= state.discarded {
            return;
        }
        state.discarded = target;
        while state.chunks.front().is_some_and(|chunk| chunk.end() <= target) {
            state.chunks.pop_front();
        }
    }

    /// Rewinds the served cursor to the discard point so every unacknowledged
    /// byte is sent again; offsets of the new turn are relative to that point.
    pub fn new_turn(&self) {
        let mut state = self.state.lock();
        state.served = state.discarded;
        state.turn_start = state.discarded;
    }

    /// Throws away everything buffered, e.g. after an overflow.
    pub fn drop_all(&self) {
        let mut state = self.state.lock();
        let written = state.written;
        state.chunks.clear();
        state.served = written;
        state.discarded = written;
        state.turn_start = written;
    }

    /// Converts a turn-relative offset to an offset from the start of the
    /// stream, both in ticks.
    pub fn to_absolute(&self, ticks: u64) -> u64 {
        let turn_start = self.state.lock().turn_start;
        self.format.bytes_to_ticks(turn_start) + ticks
    }

    /// Position of the served cursor, in ticks from the start of the stream.
    pub fn absolute_offset(&self) -> u64 {
        let served = self.state.lock().served;
        self.format.bytes_to_ticks(served)
    }

    pub fn non_acknowledged_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.served - state.discarded
    }

    pub fn stashed_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.written - state.discarded
    }

    pub fn written_bytes(&self) -> u64 {
        self.state.lock().written
    }
}
