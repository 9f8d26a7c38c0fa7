//! Lock-free single-producer single-consumer ring of PCM chunks
//!
//! Carries captured audio from the I/O driver task to the egress pump in
//! sender modes. No heap allocation; all storage is pre-allocated so the
//! ring can live in a `static`.

use core::cell::UnsafeCell;
use portable_atomic::{AtomicUsize, Ordering};

use crate::{AudioChunk, PCM_CHUNK_SIZE};

/// SPSC chunk ring
///
/// # Safety
/// Safe only under the single-producer single-consumer pattern: the capture
/// task alone calls `produce`, the egress pump alone calls `consume`.
pub struct CaptureRing<const N: usize> {
    chunks: UnsafeCell<[AudioChunk; N]>,
    head: AtomicUsize, // write position (producer)
    tail: AtomicUsize, // read position (consumer)
}

// Safety: head/tail are atomics and the SPSC pattern keeps producer and
// consumer on disjoint slots.
unsafe impl<const N: usize> Sync for CaptureRing<N> {}
unsafe impl<const N: usize> Send for CaptureRing<N> {}

impl<const N: usize> CaptureRing<N> {
    /// Create an empty ring
    ///
    /// N must be a power of 2 for efficient index masking.
    pub const fn new() -> Self {
        assert!(N > 1, "Ring needs at least two slots");
        assert!(N.is_power_of_two(), "Ring size must be a power of 2");

        Self {
            chunks: UnsafeCell::new([[0u8; PCM_CHUNK_SIZE]; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Chunks ready for the consumer
    pub fn available(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Free slots for the producer (one slot stays empty as the sentinel)
    pub fn free(&self) -> usize {
        N - 1 - self.available()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Copy one chunk in (producer only); false when the ring is full
    pub fn produce(&self, chunk: &AudioChunk) -> bool {
        if self.free() == 0 {
            return false;
        }
        let head = self.head.load(Ordering::Relaxed);

        // Safety: sole producer; this slot is outside the readable window.
        let chunks = unsafe { &mut *self.chunks.get() };
        chunks[head & (N - 1)].copy_from_slice(chunk);

        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Copy one chunk out (consumer only); false when the ring is empty
    pub fn consume(&self, out: &mut AudioChunk) -> bool {
        if self.available() == 0 {
            return false;
        }
        let tail = self.tail.load(Ordering::Relaxed);

        // Safety: sole consumer; this slot was published by the producer.
        let chunks = unsafe { &*self.chunks.get() };
        out.copy_from_slice(&chunks[tail & (N - 1)]);

        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Drop everything buffered (both sides must be idle)
    pub fn clear(&self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }
}

impl<const N: usize> Default for CaptureRing<N> {
    fn default() -> Self {
        Self::new()
    }
}
