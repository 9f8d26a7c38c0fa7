//! PCM payload byte-order normalization
//!
//! RTP carries signed 16-bit samples big-endian; the audio hardware wants
//! host (little-endian) order. The conversion is its own inverse, so the
//! same routine serves ingress and egress.

/// Swap the bytes of every 16-bit sample in place
///
/// A trailing odd byte is left untouched; well-formed payloads do not have
/// one.
pub fn swap_sample_bytes(pcm: &mut [u8]) {
    for pair in pcm.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Number of 16-bit samples in a payload
pub const fn sample_count(payload_len: usize) -> usize {
    payload_len / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_is_involutive() {
        let mut pcm = [0x12, 0x34, 0xAB, 0xCD, 0x00, 0x7F];
        swap_sample_bytes(&mut pcm);
        assert_eq!(pcm, [0x34, 0x12, 0xCD, 0xAB, 0x7F, 0x00]);
        swap_sample_bytes(&mut pcm);
        assert_eq!(pcm, [0x12, 0x34, 0xAB, 0xCD, 0x00, 0x7F]);
    }

    #[test]
    fn test_odd_tail_untouched() {
        let mut pcm = [0x01, 0x02, 0x99];
        swap_sample_bytes(&mut pcm);
        assert_eq!(pcm, [0x02, 0x01, 0x99]);
    }

    #[test]
    fn test_sample_count() {
        assert_eq!(sample_count(1152), 576);
        assert_eq!(sample_count(3), 1);
    }
}
