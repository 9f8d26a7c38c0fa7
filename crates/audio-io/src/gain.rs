//! Software gain and level measurement on little-endian s16 PCM

/// Scale every sample by `percent` (0..=100) in place
///
/// 100 is the identity and touches nothing; 0 silences.
pub fn apply_volume(pcm_le: &mut [u8], percent: u8) {
    if percent >= 100 {
        return;
    }
    let percent = i32::from(percent);
    for pair in pcm_le.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (i32::from(sample) * percent / 100) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Peak absolute sample value in the block
///
/// Used by the egress pump's amplitude silence detector.
pub fn peak_magnitude(pcm_le: &[u8]) -> u16 {
    let mut peak: u16 = 0;
    for pair in pcm_le.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        peak = peak.max(sample.unsigned_abs());
    }
    peak
}
