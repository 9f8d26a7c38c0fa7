//! Master-clock projection of RTP timestamps
//!
//! Two clock domains meet here: the local monotonic clock that tasks run
//! on, and the NTP-disciplined master clock (Unix milliseconds) that playout
//! deadlines are scheduled in. [`MasterClock`] carries the offset between
//! them; [`RtpClockMap`] anchors a stream's RTP timestamps to the master
//! clock from RTCP sender reports.

use portable_atomic::{AtomicBool, AtomicI64, Ordering};

use crate::rtcp::SenderInfo;

/// Shared local-to-master clock offset
///
/// Written by the NTP service, read lock-free by the ingress worker and the
/// PCM pump. Until the first discipline the master domain degenerates to the
/// local one, which keeps all deadline math consistent.
pub struct MasterClock {
    offset_ms: AtomicI64,
    valid: AtomicBool,
}

impl MasterClock {
    /// An undisciplined clock (master == local)
    pub const fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            valid: AtomicBool::new(false),
        }
    }

    /// Feed a fresh NTP offset (master minus local, in ms)
    pub fn discipline(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Drop the discipline (NTP service stopped or unreachable)
    pub fn clear(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Whether an NTP offset has been applied
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Convert a local monotonic time to the master domain
    pub fn master_ms(&self, local_ms: u64) -> u64 {
        if self.is_valid() {
            let shifted = local_ms as i64 + self.offset_ms.load(Ordering::Acquire);
            shifted.max(0) as u64
        } else {
            local_ms
        }
    }
}

impl Default for MasterClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Anchors one stream's RTP timestamps to the master clock
///
/// Owned by the ingress worker; re-anchored on every sender report and
/// dropped on BYE. Also remembers what an RR must echo as LSR/DLSR.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RtpClockMap {
    sample_rate: u32,
    anchor_master_ms: u64,
    anchor_rtp_ts: u32,
    anchor_lsr: u32,
    anchor_local_ms: u64,
    valid: bool,
}

impl RtpClockMap {
    /// Create an unanchored map for a stream at `sample_rate`
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            anchor_master_ms: 0,
            anchor_rtp_ts: 0,
            anchor_lsr: 0,
            anchor_local_ms: 0,
            valid: false,
        }
    }

    /// Re-anchor from a sender report
    pub fn on_sender_report(&mut self, sr: &SenderInfo, local_ms: u64) {
        self.anchor_master_ms = sr.ntp_unix_ms();
        self.anchor_rtp_ts = sr.rtp_timestamp;
        self.anchor_lsr = sr.lsr();
        self.anchor_local_ms = local_ms;
        self.valid = true;
    }

    /// The stream ended or the rate changed; projections stop until the
    /// next SR
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Change the stream rate (invalidates the anchor)
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.valid = false;
    }

    /// Whether a projection is currently possible
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Project an RTP timestamp to its playout deadline in master ms
    ///
    /// `delay_ms` is the configured jitter delay added on top of the
    /// sampling instant. Returns `None` while unanchored.
    pub fn playout_time(&self, rtp_ts: u32, delay_ms: u32) -> Option<u64> {
        if !self.valid || self.sample_rate == 0 {
            return None;
        }
        // Wrapping difference keeps working across the u32 boundary.
        let frames = rtp_ts.wrapping_sub(self.anchor_rtp_ts) as i32 as i64;
        let diff_ms = frames * 1000 / i64::from(self.sample_rate);
        let deadline = self.anchor_master_ms as i64 + diff_ms + i64::from(delay_ms);
        Some(deadline.max(0) as u64)
    }

    /// LSR value for the next receiver report
    pub const fn last_sr(&self) -> u32 {
        self.anchor_lsr
    }

    /// DLSR (1/65536 s units) given the current local time
    pub fn delay_since_last_sr(&self, local_ms: u64) -> u32 {
        if !self.valid {
            return 0;
        }
        let elapsed_ms = local_ms.saturating_sub(self.anchor_local_ms);
        ((elapsed_ms * 65536) / 1000) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchored(rate: u32) -> RtpClockMap {
        let mut map = RtpClockMap::new(rate);
        map.on_sender_report(
            &SenderInfo {
                ssrc: 1,
                ntp_seconds: 3_900_000_000,
                ntp_fraction: 0,
                rtp_timestamp: 96_000,
                packet_count: 0,
                octet_count: 0,
            },
            50_000,
        );
        map
    }

    #[test]
    fn test_unanchored_projects_nothing() {
        let map = RtpClockMap::new(48000);
        assert_eq!(map.playout_time(1234, 0), None);
    }

    #[test]
    fn test_projection_is_linear_at_rate() {
        let map = anchored(48000);
        let base = map.playout_time(96_000, 0).unwrap();
        // 48_000 frames at 48 kHz is exactly one second.
        assert_eq!(map.playout_time(144_000, 0).unwrap(), base + 1000);
        assert_eq!(map.playout_time(96_480, 0).unwrap(), base + 10);
    }

    #[test]
    fn test_delay_is_added() {
        let map = anchored(48000);
        let base = map.playout_time(96_000, 0).unwrap();
        assert_eq!(map.playout_time(96_000, 120).unwrap(), base + 120);
    }

    #[test]
    fn test_timestamps_before_anchor_project_backwards() {
        let map = anchored(48000);
        let base = map.playout_time(96_000, 0).unwrap();
        assert_eq!(map.playout_time(48_000, 0).unwrap(), base - 1000);
    }

    #[test]
    fn test_wrapping_timestamp_difference() {
        let mut map = RtpClockMap::new(48000);
        map.on_sender_report(
            &SenderInfo {
                ssrc: 1,
                ntp_seconds: 3_900_000_000,
                ntp_fraction: 0,
                rtp_timestamp: u32::MAX - 23_999,
                packet_count: 0,
                octet_count: 0,
            },
            0,
        );
        let base = map.playout_time(u32::MAX - 23_999, 0).unwrap();
        // 48_000 frames later wraps through zero; still +1 s.
        let wrapped = (u32::MAX - 23_999).wrapping_add(48_000);
        assert_eq!(map.playout_time(wrapped, 0).unwrap(), base + 1000);
    }

    #[test]
    fn test_invalidate_and_rate_change() {
        let mut map = anchored(48000);
        assert!(map.is_valid());
        map.set_sample_rate(44100);
        assert!(!map.is_valid());
        assert_eq!(map.playout_time(0, 0), None);
    }

    #[test]
    fn test_dlsr_units() {
        let map = anchored(48000);
        assert_eq!(map.delay_since_last_sr(51_000), 65536); // one second later
        assert_eq!(map.delay_since_last_sr(50_500), 32768);
    }

    #[test]
    fn test_master_clock_offset() {
        let clock = MasterClock::new();
        assert_eq!(clock.master_ms(1000), 1000);

        clock.discipline(1_700_000_000_000 - 1000);
        assert!(clock.is_valid());
        assert_eq!(clock.master_ms(1000), 1_700_000_000_000);
        assert_eq!(clock.master_ms(1250), 1_700_000_000_250);

        clock.clear();
        assert_eq!(clock.master_ms(1000), 1000);
    }

    #[test]
    fn test_negative_offset_clamps_at_zero() {
        let clock = MasterClock::new();
        clock.discipline(-5000);
        assert_eq!(clock.master_ms(1000), 0);
    }
}
