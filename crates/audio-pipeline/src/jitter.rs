//! Bounded jitter buffer with scheduled playout
//!
//! A ring of PCM chunks annotated with master-clock playout deadlines.
//! The ingress task pushes chunks as datagrams arrive; the PCM pump pops
//! them no earlier than their deadline. Underruns are absorbed by growing
//! the refill target, trading a little extra latency for burst tolerance.
//!
//! The buffer itself is clock-agnostic: every timed operation takes the
//! current master-clock time in milliseconds. Callers must derive that from
//! a monotonic source.

use crate::{AudioChunk, PCM_CHUNK_SIZE};

/// Wall-clock-future audio the buffer must hold to leave underrun when
/// playout deadlines are synchronized
pub const MIN_FUTURE_BUFFER_MS: u64 = 30;

/// Late bound for scheduled chunks; a chunk older than half this is dropped
/// under [`LatePolicy::Strict`]
pub const MAX_PLAYOUT_DELAY_MS: u64 = 1000;

/// A chunk due no more than this far in the future plays now instead of
/// making the pump wait another cycle
const PLAYOUT_EARLY_GATE_MS: i64 = 10;

/// Deadlines further than this from now are treated as unsynchronized
const PLAYOUT_PLAUSIBLE_WINDOW_MS: i64 = 1000;

/// Deadlines at or beyond this cannot come from a sane clock projection
const MAX_SYNC_PLAYOUT_MS: u64 = u64::MAX - u32::MAX as u64;

/// Metadata carried with each buffered chunk
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkMeta {
    /// Scheduled playout time in master-clock ms; 0 plays immediately
    pub playout_time_ms: u64,
    /// RTP timestamp of the packet the chunk came from, for diagnostics
    pub rtp_timestamp: u32,
    /// Bit 0: deadline is synchronized to the master clock
    pub flags: u8,
    /// Leading bytes to discard when rendering
    pub skip_bytes: u16,
}

impl ChunkMeta {
    const FLAG_HAS_SYNC: u8 = 0x01;

    /// Whether the playout deadline is master-clock synchronized
    pub const fn has_sync(&self) -> bool {
        self.flags & Self::FLAG_HAS_SYNC != 0
    }
}

/// What to do with a chunk whose deadline has long passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LatePolicy {
    /// Drop the chunk and advance; keeps latency bounded
    #[default]
    Strict,
    /// Play it anyway; keeps the stream gap-free
    Adaptive,
}

/// A successfully popped chunk's rendering info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoppedChunk {
    /// The deadline the chunk was scheduled for (0 = immediate)
    pub playout_time_ms: u64,
    /// Leading bytes the renderer must discard
    pub skip_bytes: usize,
}

/// Outcome of a timed pop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// Chunk copied to the caller's buffer
    Ready(PoppedChunk),
    /// Nothing due yet (head chunk scheduled in the future, underrun
    /// refill in progress, or a late chunk was just dropped)
    NotYet,
    /// Buffer empty; underrun entered
    Empty,
}

/// Bounded ring of (chunk, metadata) pairs with timed popping
///
/// `N` is the compile-time slot count; the runtime capacity from the
/// configuration is clamped to it. Storage is one inline slab indexed by
/// position, so the type can live in a `static` and is `const`-constructible.
///
/// Not internally synchronized: the owner wraps it in a mutex and keeps
/// each operation's critical section minimal.
pub struct JitterBuffer<const N: usize> {
    slots: [AudioChunk; N],
    meta: [ChunkMeta; N],
    capacity: usize,
    size: usize,
    read_pos: usize,
    target: usize,
    initial_target: usize,
    grow_step: usize,
    max_grow: usize,
    late_policy: LatePolicy,
    is_underrun: bool,
    received_packets: u32,
}

impl<const N: usize> JitterBuffer<N> {
    /// Create an unconfigured buffer (capacity `N`, immediate-play, underrun)
    pub const fn new() -> Self {
        assert!(N > 0, "Jitter buffer needs at least one slot");
        Self {
            slots: [[0u8; PCM_CHUNK_SIZE]; N],
            meta: [ChunkMeta {
                playout_time_ms: 0,
                rtp_timestamp: 0,
                flags: 0,
                skip_bytes: 0,
            }; N],
            capacity: N,
            size: 0,
            read_pos: 0,
            target: 1,
            initial_target: 1,
            grow_step: 1,
            max_grow: N,
            late_policy: LatePolicy::Strict,
            is_underrun: true,
            received_packets: 0,
        }
    }

    /// Apply the configured shape and reset all contents
    ///
    /// A `max_size` above `N` is clamped; the caller decides whether that
    /// deserves a restart or a warning. Returns the effective capacity.
    pub fn configure(
        &mut self,
        initial: u8,
        grow_step: u8,
        max_size: u8,
        max_grow: u8,
        late_policy: LatePolicy,
    ) -> usize {
        self.capacity = (max_size as usize).clamp(1, N);
        self.initial_target = (initial as usize).clamp(1, self.capacity);
        self.grow_step = grow_step as usize;
        self.max_grow = (max_grow as usize).clamp(self.initial_target, self.capacity);
        self.late_policy = late_policy;
        self.reset();
        self.capacity
    }

    /// Reload the growth parameters from a changed configuration
    ///
    /// A ceiling below the current target pulls the target down with it.
    pub fn update_growth_params(&mut self, grow_step: u8, max_grow: u8) {
        self.grow_step = grow_step as usize;
        self.max_grow = (max_grow as usize).clamp(self.initial_target, self.capacity);
        if self.target > self.max_grow {
            self.target = self.max_grow;
        }
    }

    /// Push a chunk scheduled for `playout_ms` (0 = play immediately)
    ///
    /// Returns false on overflow; the new chunk is discarded, the refill
    /// target jumps to its ceiling and occupancy is trimmed back to it.
    pub fn push(&mut self, chunk: &[u8], playout_ms: u64, rtp_ts: u32, now_ms: u64) -> bool {
        self.push_with_skip(chunk, playout_ms, rtp_ts, 0, now_ms)
    }

    /// Push with a leading skip region (partial first chunk after a join)
    pub fn push_with_skip(
        &mut self,
        chunk: &[u8],
        playout_ms: u64,
        rtp_ts: u32,
        skip_bytes: usize,
        now_ms: u64,
    ) -> bool {
        if chunk.is_empty() || chunk.len() > PCM_CHUNK_SIZE {
            return false;
        }
        if self.size >= self.capacity {
            // Overflow: the stream is outrunning playout. Pin the refill
            // target at its ceiling and trim back to it.
            self.target = self.max_grow;
            self.size = self.size.min(self.target);
            return false;
        }

        let slot = (self.read_pos + self.size) % self.capacity;
        self.slots[slot][..chunk.len()].copy_from_slice(chunk);
        self.slots[slot][chunk.len()..].fill(0);

        let has_sync = playout_ms > 0 && playout_ms < MAX_SYNC_PLAYOUT_MS;
        self.meta[slot] = ChunkMeta {
            playout_time_ms: if has_sync { playout_ms } else { 0 },
            rtp_timestamp: rtp_ts,
            flags: if has_sync { ChunkMeta::FLAG_HAS_SYNC } else { 0 },
            skip_bytes: skip_bytes.min(PCM_CHUNK_SIZE) as u16,
        };
        self.size += 1;
        self.received_packets = self.received_packets.saturating_add(1);

        if self.is_underrun {
            let refilled = if has_sync {
                playout_ms >= now_ms + MIN_FUTURE_BUFFER_MS
            } else {
                self.received_packets as usize >= self.target
            };
            if refilled {
                self.is_underrun = false;
            }
        }
        true
    }

    /// Pop the head chunk if its deadline has arrived
    ///
    /// On `Ready` the chunk bytes are copied into `out` and the read
    /// position advances. Implausible deadlines (clock step, stale sync)
    /// are treated as immediate playout.
    pub fn pop_timed(&mut self, now_ms: u64, out: &mut AudioChunk) -> PopOutcome {
        if self.size == 0 {
            if !self.is_underrun {
                self.enter_underrun();
            }
            return PopOutcome::Empty;
        }
        if self.is_underrun {
            return PopOutcome::NotYet;
        }
        if self.read_pos >= self.capacity {
            // Position ran off the ring. Reset to known-good and start
            // re-accumulating rather than reading a stale slot.
            self.empty();
            return PopOutcome::Empty;
        }

        let meta = self.meta[self.read_pos];
        if meta.has_sync() && plausible(meta.playout_time_ms, now_ms) {
            let diff = meta.playout_time_ms as i64 - now_ms as i64;
            if diff > PLAYOUT_EARLY_GATE_MS {
                return PopOutcome::NotYet;
            }
            if diff < -(MAX_PLAYOUT_DELAY_MS as i64 / 2)
                && self.late_policy == LatePolicy::Strict
            {
                self.advance();
                return PopOutcome::NotYet;
            }
        }

        out.copy_from_slice(&self.slots[self.read_pos]);
        let popped = PoppedChunk {
            playout_time_ms: meta.playout_time_ms,
            skip_bytes: meta.skip_bytes as usize,
        };
        self.advance();
        PopOutcome::Ready(popped)
    }

    /// Discard all contents and re-enter underrun; the refill target keeps
    /// its current value
    pub fn empty(&mut self) {
        self.size = 0;
        self.read_pos = 0;
        self.received_packets = 0;
        self.meta = [ChunkMeta::default(); N];
        self.is_underrun = true;
    }

    /// Full reset: contents discarded and the refill target back to its
    /// configured initial value
    pub fn reset(&mut self) {
        self.empty();
        self.target = self.initial_target;
    }

    /// Current occupancy in chunks
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when no chunk is buffered
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current refill target in chunks
    pub fn target(&self) -> usize {
        self.target
    }

    /// Effective ring capacity in chunks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True while re-accumulating after an underrun
    pub fn is_underrun(&self) -> bool {
        self.is_underrun
    }

    /// Chunks pushed since the last underrun
    pub fn received_packets(&self) -> u32 {
        self.received_packets
    }

    fn advance(&mut self) {
        self.read_pos = (self.read_pos + 1) % self.capacity;
        self.size -= 1;
    }

    fn enter_underrun(&mut self) {
        self.is_underrun = true;
        self.received_packets = 0;
        self.target = (self.target + self.grow_step).min(self.max_grow);
    }
}

impl<const N: usize> Default for JitterBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

fn plausible(playout_ms: u64, now_ms: u64) -> bool {
    let diff = playout_ms as i64 - now_ms as i64;
    (-PLAYOUT_PLAUSIBLE_WINDOW_MS..=PLAYOUT_PLAUSIBLE_WINDOW_MS).contains(&diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn chunk(fill: u8) -> AudioChunk {
        [fill; PCM_CHUNK_SIZE]
    }

    /// A buffer past its initial refill so pops flow immediately
    fn flowing<const N: usize>(initial: u8, max_size: u8) -> JitterBuffer<N> {
        let mut buf = JitterBuffer::<N>::new();
        buf.configure(initial, 1, max_size, max_size, LatePolicy::Strict);
        for i in 0..initial {
            assert!(buf.push(&chunk(i), 0, 0, NOW));
        }
        assert!(!buf.is_underrun());
        buf
    }

    #[test]
    fn test_starts_in_underrun_until_target() {
        let mut buf = JitterBuffer::<8>::new();
        buf.configure(3, 1, 8, 6, LatePolicy::Strict);
        let mut out = chunk(0);

        assert!(buf.push(&chunk(1), 0, 0, NOW));
        assert_eq!(buf.pop_timed(NOW, &mut out), PopOutcome::NotYet);

        buf.push(&chunk(2), 0, 0, NOW);
        assert!(buf.is_underrun());
        buf.push(&chunk(3), 0, 0, NOW);
        assert!(!buf.is_underrun());

        assert!(matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Ready(_)));
        assert_eq!(out, chunk(1));
    }

    #[test]
    fn test_pop_order_matches_push_order() {
        let mut buf = flowing::<8>(1, 8);
        let mut out = chunk(0);
        assert!(matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Ready(_)));

        for i in 10..14 {
            buf.push(&chunk(i), 0, i as u32, NOW);
        }
        for i in 10..14u8 {
            assert!(matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Ready(_)));
            assert_eq!(out, chunk(i), "chunks must come back verbatim, in order");
        }
        assert_eq!(buf.pop_timed(NOW, &mut out), PopOutcome::Empty);
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut buf = JitterBuffer::<4>::new();
        buf.configure(2, 1, 4, 4, LatePolicy::Strict);
        for i in 0..40 {
            buf.push(&chunk(i), 0, 0, NOW);
            assert!(buf.len() <= buf.capacity());
        }
    }

    #[test]
    fn test_overflow_pins_target_and_rejects() {
        // max 4 slots, initial fill line 2.
        let mut buf = JitterBuffer::<4>::new();
        buf.configure(2, 1, 4, 4, LatePolicy::Strict);

        let mut accepted = 0;
        for i in 0..10 {
            if buf.push(&chunk(i), 0, 0, NOW) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4, "only the first four pushes fit");
        assert_eq!(buf.target(), 4, "target pinned at the grow ceiling");
        assert_eq!(buf.len(), buf.target());
    }

    #[test]
    fn test_overflow_trims_back_to_smaller_ceiling() {
        let mut buf = JitterBuffer::<8>::new();
        buf.configure(2, 1, 8, 5, LatePolicy::Strict);
        for i in 0..8 {
            buf.push(&chunk(i), 0, 0, NOW);
        }
        assert!(!buf.push(&chunk(99), 0, 0, NOW));
        assert_eq!(buf.target(), 5);
        assert_eq!(buf.len(), 5, "occupancy trimmed back to the target");

        // Oldest chunks survive the trim.
        let mut out = chunk(0);
        assert!(matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Ready(_)));
        assert_eq!(out, chunk(0));
    }

    #[test]
    fn test_underrun_grows_target_clamped() {
        let mut buf = flowing::<8>(2, 8);
        buf.update_growth_params(2, 5);
        let mut out = chunk(0);

        // Drain to empty: underrun entry grows the target by the step.
        while !matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Empty) {}
        assert_eq!(buf.target(), 4);
        assert!(buf.is_underrun());
        assert_eq!(buf.received_packets(), 0);

        // Another full cycle clamps at the ceiling.
        for i in 0..4 {
            buf.push(&chunk(i), 0, 0, NOW);
        }
        while !matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Empty) {}
        assert_eq!(buf.target(), 5);
    }

    #[test]
    fn test_legacy_underrun_exit_at_exact_target() {
        let mut buf = JitterBuffer::<8>::new();
        buf.configure(3, 1, 8, 6, LatePolicy::Strict);

        buf.push(&chunk(0), 0, 0, NOW);
        buf.push(&chunk(1), 0, 0, NOW);
        assert!(buf.is_underrun());
        buf.push(&chunk(2), 0, 0, NOW);
        assert!(!buf.is_underrun(), "exit fires exactly at received == target");
    }

    #[test]
    fn test_synced_underrun_exit_needs_future_audio() {
        let mut buf = JitterBuffer::<8>::new();
        buf.configure(4, 1, 8, 6, LatePolicy::Strict);

        // Deadlines barely ahead of now: not enough future coverage.
        buf.push(&chunk(0), NOW + 5, 100, NOW);
        assert!(buf.is_underrun());

        buf.push(&chunk(1), NOW + MIN_FUTURE_BUFFER_MS, 101, NOW);
        assert!(!buf.is_underrun());
    }

    #[test]
    fn test_future_chunk_is_not_yet() {
        let mut buf = flowing::<8>(1, 8);
        let mut out = chunk(0);
        let _ = buf.pop_timed(NOW, &mut out);

        buf.push(&chunk(7), NOW + 500, 0, NOW);
        assert_eq!(buf.pop_timed(NOW, &mut out), PopOutcome::NotYet);

        // Due within the early gate: plays now.
        assert!(matches!(
            buf.pop_timed(NOW + 495, &mut out),
            PopOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_late_chunk_strict_drops_adaptive_plays() {
        let late_by = MAX_PLAYOUT_DELAY_MS / 2 + 50;

        let mut buf = flowing::<8>(1, 8);
        let mut out = chunk(0);
        let _ = buf.pop_timed(NOW, &mut out);
        buf.push(&chunk(8), NOW - late_by, 0, NOW - late_by - 20);
        assert_eq!(buf.pop_timed(NOW, &mut out), PopOutcome::NotYet);
        assert_eq!(buf.len(), 0, "strict policy dropped the late chunk");

        let mut buf = JitterBuffer::<8>::new();
        buf.configure(1, 1, 8, 8, LatePolicy::Adaptive);
        buf.push(&chunk(3), 0, 0, NOW);
        let _ = buf.pop_timed(NOW, &mut out);
        buf.push(&chunk(9), NOW - late_by, 0, NOW - late_by - 20);
        assert!(matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Ready(_)));
        assert_eq!(out, chunk(9));
    }

    #[test]
    fn test_implausible_deadline_plays_immediately() {
        let mut buf = flowing::<8>(1, 8);
        let mut out = chunk(0);
        let _ = buf.pop_timed(NOW, &mut out);

        // Two hours in the future: sync data is garbage, play now.
        buf.push(&chunk(5), NOW + 7_200_000, 0, NOW);
        assert!(matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Ready(_)));
        assert_eq!(out, chunk(5));
    }

    #[test]
    fn test_empty_clears_counts_but_keeps_target() {
        let mut buf = flowing::<8>(2, 8);
        let mut out = chunk(0);
        while !matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Empty) {}
        let grown = buf.target();

        for i in 0..3 {
            buf.push(&chunk(i), 0, 0, NOW);
        }
        buf.empty();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.received_packets(), 0);
        assert!(buf.is_underrun());
        assert_eq!(buf.target(), grown);

        buf.reset();
        assert_eq!(buf.target(), 2);
    }

    #[test]
    fn test_skip_bytes_round_trip() {
        let mut buf = flowing::<8>(1, 8);
        let mut out = chunk(0);
        let _ = buf.pop_timed(NOW, &mut out);

        buf.push_with_skip(&chunk(6), 0, 0, 128, NOW);
        match buf.pop_timed(NOW, &mut out) {
            PopOutcome::Ready(popped) => assert_eq!(popped.skip_bytes, 128),
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_short_chunk_is_zero_padded() {
        let mut buf = flowing::<8>(1, 8);
        let mut out = chunk(0xFF);
        let _ = buf.pop_timed(NOW, &mut out);

        buf.push(&[0xAA; 100], 0, 0, NOW);
        assert!(matches!(buf.pop_timed(NOW, &mut out), PopOutcome::Ready(_)));
        assert_eq!(&out[..100], &[0xAA; 100][..]);
        assert_eq!(&out[100..], &SILENT[100..]);
    }

    const SILENT: AudioChunk = [0u8; PCM_CHUNK_SIZE];

    #[test]
    fn test_oversize_push_rejected() {
        let mut buf = flowing::<8>(1, 8);
        assert!(!buf.push(&[0u8; PCM_CHUNK_SIZE + 1], 0, 0, NOW));
        assert!(!buf.push(&[], 0, 0, NOW));
    }

    #[test]
    fn test_configured_capacity_clamps_to_slab() {
        let mut buf = JitterBuffer::<4>::new();
        let effective = buf.configure(2, 1, 200, 200, LatePolicy::Strict);
        assert_eq!(effective, 4);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Occupancy and target stay inside the ring under any
            /// interleaving of pushes, pops, flushes and parameter reloads.
            #[test]
            fn prop_bounds_hold_under_any_op_sequence(
                ops in proptest::collection::vec(0u8..=4, 1..200),
                shape in (1u8..=6, 0u8..=3, 1u8..=6, 1u8..=6),
            ) {
                let mut buf = JitterBuffer::<6>::new();
                buf.configure(shape.0, shape.1, shape.2, shape.3, LatePolicy::Strict);
                let mut out = chunk(0);
                let mut now = NOW;

                for op in ops {
                    match op {
                        0 => {
                            buf.push(&chunk(op), 0, 0, now);
                        }
                        1 => {
                            buf.push(&chunk(op), now + 20, 0, now);
                        }
                        2 => {
                            let _ = buf.pop_timed(now, &mut out);
                        }
                        3 => buf.empty(),
                        _ => buf.update_growth_params(2, 4),
                    }
                    now += 3;

                    prop_assert!(buf.len() <= buf.capacity());
                    prop_assert!(buf.target() >= 1);
                    prop_assert!(buf.target() <= buf.capacity());
                }
            }
        }
    }
}
