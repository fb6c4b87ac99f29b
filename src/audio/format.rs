use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

/// Service offsets and durations are expressed in 100ns ticks.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// PCM format of the audio carried by a buffer. Fixed for a buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        // 服务端默认格式：16kHz 16bit 单声道
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    pub fn block_align(&self) -> u64 {
        (self.channels as u64 * self.bits_per_sample as u64).div_ceil(8)
    }

    pub fn avg_bytes_per_sec(&self) -> u64 {
        self.sample_rate as u64 * self.block_align()
    }

    /// Byte position reached after `ticks` of audio, aligned down to a whole
    /// sample frame.
    pub fn ticks_to_bytes(&self, ticks: u64) -> u64 {
        let bytes = (ticks as u128 * self.avg_bytes_per_sec() as u128 / TICKS_PER_SECOND as u128) as u64;
        let align = self.block_align().max(1);
        bytes - bytes % align
    }

    pub fn bytes_to_ticks(&self, bytes: u64) -> u64 {
        let rate = self.avg_bytes_per_sec();
        if rate == 0 {
            return 0;
        }
        (bytes as u128 * TICKS_PER_SECOND as u128 / rate as u128) as u64
    }

    /// RIFF/WAVE header sent ahead of the first audio frame of a request. The
    /// data length is left open since the stream length is unknown.
    pub fn wav_header(&self) -> Bytes {
        let mut header = BytesMut::with_capacity(44);
        header.put_slice(b"RIFF");
        header.put_u32_le(0);
        header.put_slice(b"WAVE");
        header.put_slice(b"fmt ");
        header.put_u32_le(16);
        header.put_u16_le(1); // PCM
        header.put_u16_le(self.channels);
        header.put_u32_le(self.sample_rate);
        header.put_u32_le(self.avg_bytes_per_sec() as u32);
        header.put_u16_le(self.block_align() as u16);
        header.put_u16_le(self.bits_per_sample);
        header.put_slice(b"data");
        header.put_u32_le(0);
        header.freeze()
    }
}
