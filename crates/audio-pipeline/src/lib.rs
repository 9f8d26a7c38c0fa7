//! Audio pipeline for the RTP bridge
//!
//! Provides the jitter buffer with timed playout, the lock-free capture
//! ring for sender modes, and the PCM format description shared by the
//! network and audio I/O layers.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(any(feature = "std", test))]
extern crate std;

mod capture_ring;
mod jitter;

pub use capture_ring::CaptureRing;
pub use jitter::{
    ChunkMeta, JitterBuffer, LatePolicy, PopOutcome, PoppedChunk, MAX_PLAYOUT_DELAY_MS,
    MIN_FUTURE_BUFFER_MS,
};

/// Bytes per PCM chunk: 288 stereo frames of 16-bit samples (6 ms at 48 kHz)
pub const PCM_CHUNK_SIZE: usize = 1152;

/// Stereo frames per chunk
pub const FRAMES_PER_CHUNK: usize = PCM_CHUNK_SIZE / 4;

/// One fixed-size block of interleaved little-endian signed 16-bit PCM
pub type AudioChunk = [u8; PCM_CHUNK_SIZE];

/// An all-zero chunk, written while the pipeline has nothing to play
pub const SILENT_CHUNK: AudioChunk = [0u8; PCM_CHUNK_SIZE];

/// Audio format description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels (the bridge always runs 2)
    pub channels: u8,
    /// Bits per sample (the bridge always runs 16)
    pub bits_per_sample: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    /// Bytes per frame (one sample for every channel)
    pub const fn bytes_per_frame(&self) -> usize {
        (self.channels as usize) * (self.bits_per_sample as usize / 8)
    }

    /// Bytes per second of PCM at this format
    pub const fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }

    /// Duration of one chunk at this format, in milliseconds
    pub const fn chunk_duration_ms(&self) -> u32 {
        (PCM_CHUNK_SIZE * 1000 / self.bytes_per_second()) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_duration() {
        let fmt = AudioFormat::default();
        assert_eq!(fmt.bytes_per_frame(), 4);
        assert_eq!(fmt.chunk_duration_ms(), 6);

        let fmt = AudioFormat {
            sample_rate: 44100,
            ..AudioFormat::default()
        };
        assert_eq!(fmt.chunk_duration_ms(), 6); // truncated from 6.53
    }
}
