//! Lock-free single-producer multi-consumer ring
//!
//! Slot-stamped sequencing: the producer writes a slot then stamps it with
//! the publish sequence; each consumer owns a cursor and reads slots whose
//! stamp matches its next sequence. The producer gates on the slowest
//! cursor and drops (never blocks) when the ring is full.

use metrics::counter;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a non-blocking publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Event visible to all consumers
    Ok,
    /// Ring full relative to the slowest consumer; event discarded
    Dropped,
}

impl PublishOutcome {
    /// True when the event was published
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

struct Shared<T: Copy> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    stamps: Box<[AtomicU64]>,
    mask: u64,
    head: AtomicU64,
    cursors: Mutex<Vec<Arc<AtomicU64>>>,
}

// Slots are written by the single producer before the Release stamp store and
// only read by consumers after an Acquire stamp load.
unsafe impl<T: Copy + Send> Send for Shared<T> {}
unsafe impl<T: Copy + Send> Sync for Shared<T> {}

const EMPTY_STAMP: u64 = u64::MAX;

/// Single-producer side of the ring
///
/// `T: Copy` keeps reads alloc-free and lets several consumers observe the
/// same slot without ownership hand-off.
pub struct Ring<T: Copy> {
    shared: Arc<Shared<T>>,
    cached_gate: u64,
}

impl<T: Copy + Send> Ring<T> {
    /// Create a ring with `capacity` slots; capacity must be a power of two
    ///
    /// # Panics
    /// Panics when capacity is zero or not a power of two; capacities come
    /// from validated config.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "ring capacity must be a power of two"
        );
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let stamps = (0..capacity)
            .map(|_| AtomicU64::new(EMPTY_STAMP))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shared: Arc::new(Shared {
                buffer,
                stamps,
                mask: capacity as u64 - 1,
                head: AtomicU64::new(0),
                cursors: Mutex::new(Vec::new()),
            }),
            cached_gate: 0,
        }
    }

    /// Ring capacity in slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.mask as usize + 1
    }

    /// Register a new consumer starting at the current head
    ///
    /// Consumers registered after events were published do not see history.
    pub fn subscribe(&self) -> RingConsumer<T> {
        let cursor = Arc::new(AtomicU64::new(self.shared.head.load(Ordering::Acquire)));
        self.shared.cursors.lock().push(Arc::clone(&cursor));
        RingConsumer {
            shared: Arc::clone(&self.shared),
            cursor,
        }
    }

    /// Publish without blocking; drops and counts on overflow
    pub fn publish_nowait(&mut self, value: T) -> PublishOutcome {
        if self.free_slots(1) < 1 {
            counter!("bus_overflow_total").increment(1);
            return PublishOutcome::Dropped;
        }
        self.write(value);
        PublishOutcome::Ok
    }

    /// Publish a batch atomically: either every event fits or none is taken
    ///
    /// Used for paired publication (book event + derived stats) so consumers
    /// never observe one without the other.
    pub fn publish_many_nowait(&mut self, values: &[T]) -> PublishOutcome {
        let n = values.len() as u64;
        if n == 0 {
            return PublishOutcome::Ok;
        }
        if self.free_slots(n) < n {
            counter!("bus_overflow_total").increment(values.len() as u64);
            return PublishOutcome::Dropped;
        }
        for value in values {
            self.write(*value);
        }
        PublishOutcome::Ok
    }

    fn write(&self, value: T) {
        let shared = &self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let idx = (head & shared.mask) as usize;
        unsafe {
            (*shared.buffer[idx].get()).write(value);
        }
        shared.stamps[idx].store(head, Ordering::Release);
        shared.head.store(head + 1, Ordering::Release);
    }

    /// Free slots relative to the slowest consumer, scanning cursors only
    /// when the cached gate is insufficient
    fn free_slots(&mut self, needed: u64) -> u64 {
        let shared = &self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let capacity = shared.mask + 1;

        let mut free = capacity.saturating_sub(head - self.cached_gate);
        if free < needed {
            let cursors = shared.cursors.lock();
            let gate = cursors
                .iter()
                .map(|c| c.load(Ordering::Acquire))
                .min()
                .unwrap_or(head);
            drop(cursors);
            self.cached_gate = gate;
            free = capacity.saturating_sub(head - gate);
        }
        free
    }
}

/// One consumer's view of the ring
pub struct RingConsumer<T: Copy> {
    shared: Arc<Shared<T>>,
    cursor: Arc<AtomicU64>,
}

impl<T: Copy + Send> RingConsumer<T> {
    /// Next event, if one is available
    pub fn try_next(&mut self) -> Option<T> {
        let seq = self.cursor.load(Ordering::Relaxed);
        let shared = &self.shared;
        let idx = (seq & shared.mask) as usize;
        if shared.stamps[idx].load(Ordering::Acquire) != seq {
            return None;
        }
        let value = unsafe { (*shared.buffer[idx].get()).assume_init_read() };
        self.cursor.store(seq + 1, Ordering::Release);
        Some(value)
    }

    /// Drain up to `max` events into `out`; returns the number consumed
    pub fn consume_batch(&mut self, max: usize, out: &mut Vec<T>) -> usize {
        let mut n = 0;
        while n < max {
            match self.try_next() {
                Some(value) => {
                    out.push(value);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Events published but not yet consumed by this cursor
    #[must_use]
    pub fn lag(&self) -> u64 {
        let head = self.shared.head.load(Ordering::Acquire);
        head.saturating_sub(self.cursor.load(Ordering::Relaxed))
    }
}
