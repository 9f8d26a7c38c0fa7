//! Sequence-number loss accounting
//!
//! Diagnostic only: the bridge plays chunks in arrival order and never
//! reorders, so this tracker just counts what the network dropped.

/// Gaps at least this large are treated as a reordered or restarted stream
/// rather than loss
const REORDER_WINDOW: u16 = 1000;

/// Tracks the last sequence number seen and accumulates loss counters
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceTracker {
    last_seq: u16,
    first_packet: bool,
    received: u32,
    lost: u32,
}

impl SequenceTracker {
    /// Create a tracker awaiting its first packet
    pub const fn new() -> Self {
        Self {
            last_seq: 0,
            first_packet: true,
            received: 0,
            lost: 0,
        }
    }

    /// Record one arrived sequence number, returning how many packets the
    /// gap says were just lost
    pub fn record(&mut self, seq: u16) -> u16 {
        self.received = self.received.saturating_add(1);

        if self.first_packet {
            self.first_packet = false;
            self.last_seq = seq;
            return 0;
        }

        let expected = self.last_seq.wrapping_add(1);
        let gap = seq.wrapping_sub(expected);
        self.last_seq = seq;

        if gap != 0 && gap < REORDER_WINDOW {
            self.lost = self.lost.saturating_add(u32::from(gap));
            gap
        } else {
            0
        }
    }

    /// Packets received since the last reset
    pub const fn received(&self) -> u32 {
        self.received
    }

    /// Packets counted as lost since the last reset
    pub const fn lost(&self) -> u32 {
        self.lost
    }

    /// Loss as a fraction of everything that should have arrived
    pub fn loss_rate(&self) -> f32 {
        let total = self.received + self.lost;
        if total == 0 {
            0.0
        } else {
            self.lost as f32 / total as f32
        }
    }

    /// Forget everything, including the first-packet latch
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_counts_no_loss() {
        let mut t = SequenceTracker::new();
        for seq in 1000..1100 {
            assert_eq!(t.record(seq), 0);
        }
        assert_eq!(t.received(), 100);
        assert_eq!(t.lost(), 0);
    }

    #[test]
    fn test_single_gap_counted() {
        let mut t = SequenceTracker::new();
        for seq in [1000, 1001, 1003, 1004] {
            t.record(seq);
        }
        assert_eq!(t.received(), 4);
        assert_eq!(t.lost(), 1);
    }

    #[test]
    fn test_wraparound_is_in_order() {
        let mut t = SequenceTracker::new();
        t.record(0xFFFF);
        assert_eq!(t.record(0x0000), 0);
        assert_eq!(t.lost(), 0);
    }

    #[test]
    fn test_wide_jump_is_reordering_not_loss() {
        let mut t = SequenceTracker::new();
        t.record(5000);
        assert_eq!(t.record(100), 0);
        assert_eq!(t.lost(), 0);
        // last_seq still tracks the observed value.
        assert_eq!(t.record(101), 0);
    }

    #[test]
    fn test_duplicate_counts_nothing() {
        let mut t = SequenceTracker::new();
        t.record(42);
        // gap = 42 - 43 = 0xFFFF, outside the window
        assert_eq!(t.record(42), 0);
        assert_eq!(t.lost(), 0);
    }

    #[test]
    fn test_loss_rate() {
        let mut t = SequenceTracker::new();
        t.record(0);
        t.record(4); // 3 lost
        assert!((t.loss_rate() - 0.6).abs() < 1e-6);
        t.reset();
        assert_eq!(t.loss_rate(), 0.0);
    }
}
