//! Sender-side RTP framing
//!
//! Wraps PCM chunks into RTP packets with a monotonically increasing
//! sequence number and a timestamp that advances by the frame count of each
//! chunk. The payload is converted to network byte order on the way out.

use crate::header::RtpHeader;
use crate::{samples, WireError, RTP_HEADER_LEN};

/// Payload type the bridge stamps on outgoing audio (dynamic range)
pub const AUDIO_PAYLOAD_TYPE: u8 = 96;

/// Frames one PCM chunk per call into an RTP packet
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Packetizer {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    frames_per_chunk: u32,
    payload_type: u8,
}

impl Packetizer {
    /// Create a framer emitting under `ssrc`
    ///
    /// `frames_per_chunk` is the per-packet RTP timestamp increment (sample
    /// frames, not bytes).
    pub const fn new(ssrc: u32, frames_per_chunk: u32) -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            ssrc,
            frames_per_chunk,
            payload_type: AUDIO_PAYLOAD_TYPE,
        }
    }

    /// Next sequence number to be emitted
    pub const fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Frame one little-endian PCM chunk into `out`
    ///
    /// Returns the total packet length. The payload lands big-endian; the
    /// input chunk is not modified.
    pub fn frame(&mut self, pcm_le: &[u8], out: &mut [u8]) -> Result<usize, WireError> {
        let total = RTP_HEADER_LEN + pcm_le.len();
        if out.len() < total {
            return Err(WireError::BufferTooSmall);
        }

        RtpHeader {
            marker: false,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        }
        .to_bytes(out)?;

        out[RTP_HEADER_LEN..total].copy_from_slice(pcm_le);
        samples::swap_sample_bytes(&mut out[RTP_HEADER_LEN..total]);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.frames_per_chunk);
        Ok(total)
    }
}
