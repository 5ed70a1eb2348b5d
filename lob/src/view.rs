//! Version-guarded shared book views
//!
//! The writer publishes a `Copy` snapshot behind a seqlock: version goes odd
//! while the write is in flight, even when it is stable. Readers retry on a
//! torn or in-flight read; no locks on either side.

use crate::book::BookState;
use common::events::Ladder;
use common::{Px, Qty, Symbol, Ts};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable book snapshot handed to readers
#[derive(Debug, Clone, Copy, Default)]
pub struct BookSnapshot {
    /// Bid levels, best first
    pub bids: Ladder,
    /// Ask levels, best first
    pub asks: Ladder,
    /// Last trade price and volume
    pub last_trade: Option<(Px, Qty)>,
    /// Exchange timestamp
    pub exch_ts: Ts,
    /// Local timestamp
    pub local_ts: Ts,
    /// Writer version at publish time
    pub version: u64,
    /// Degraded flag
    pub degraded: bool,
}

/// Seqlock-guarded snapshot cell for one symbol
pub struct SharedBook {
    seq: AtomicU64,
    cell: UnsafeCell<BookSnapshot>,
}

// The seqlock protocol makes the UnsafeCell safe to share: readers validate
// the version before trusting the copied bytes.
unsafe impl Send for SharedBook {}
unsafe impl Sync for SharedBook {}

impl SharedBook {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            cell: UnsafeCell::new(BookSnapshot::default()),
        }
    }

    /// Publish a new snapshot; writer side, single-threaded
    pub fn store(&self, snapshot: BookSnapshot) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
        unsafe {
            *self.cell.get() = snapshot;
        }
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read a coherent snapshot, retrying through concurrent writes
    #[must_use]
    pub fn load(&self) -> BookSnapshot {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let snapshot = unsafe { *self.cell.get() };
            let after = self.seq.load(Ordering::Acquire);
            if before == after {
                return snapshot;
            }
            std::hint::spin_loop();
        }
    }
}

/// Registry of shared views, one per symbol
///
/// The engine writes; strategy contexts hold a clone and read.
#[derive(Clone, Default)]
pub struct BookViews {
    inner: Arc<RwLock<FxHashMap<Symbol, Arc<SharedBook>>>>,
}

impl BookViews {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// View for `symbol`, created on first use (writer side)
    pub fn entry(&self, symbol: Symbol) -> Arc<SharedBook> {
        if let Some(view) = self.inner.read().get(&symbol) {
            return Arc::clone(view);
        }
        Arc::clone(
            self.inner
                .write()
                .entry(symbol)
                .or_insert_with(|| Arc::new(SharedBook::new())),
        )
    }

    /// View for `symbol`, if the writer has published one
    #[must_use]
    pub fn get(&self, symbol: Symbol) -> Option<Arc<SharedBook>> {
        self.inner.read().get(&symbol).cloned()
    }

    /// Publish the current state of `book` to its view
    pub fn publish(&self, book: &BookState) {
        let (exch_ts, local_ts) = book.timestamps();
        let (bids, asks) = book.depth(usize::MAX);
        let snapshot = BookSnapshot {
            bids: bids.iter().copied().collect(),
            asks: asks.iter().copied().collect(),
            last_trade: book.last_trade(),
            exch_ts,
            local_ts,
            version: book.version(),
            degraded: book.is_degraded(),
        };
        self.entry(book.symbol).store(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::{BidAskEvent, BookLevel};

    #[test]
    fn test_store_load_round_trip() {
        let view = SharedBook::new();
        let mut snapshot = BookSnapshot::default();
        snapshot.version = 42;
        view.store(snapshot);
        assert_eq!(view.load().version, 42);
    }

    #[test]
    fn test_publish_reflects_book() {
        let sym = Symbol::new(7);
        let views = BookViews::new();
        let mut book = BookState::new(sym);

        let event = BidAskEvent {
            symbol: sym,
            bids: [BookLevel::new(Px::from_scaled(1_000_000), Qty::from_i64(10))]
                .into_iter()
                .collect(),
            asks: [BookLevel::new(Px::from_scaled(1_001_000), Qty::from_i64(8))]
                .into_iter()
                .collect(),
            is_snapshot: true,
            source_ts: Ts::from_nanos(1),
            local_ts: Ts::from_nanos(2),
            seq: 1,
        };
        book.apply_snapshot(&event);
        views.publish(&book);

        let snapshot = views.get(sym).unwrap().load();
        assert_eq!(snapshot.bids.as_slice()[0].price, Px::from_scaled(1_000_000));
        assert_eq!(snapshot.version, 1);
        assert!(!snapshot.degraded);
    }

    #[test]
    fn test_concurrent_reads_never_tear() {
        let view = Arc::new(SharedBook::new());
        let writer_view = Arc::clone(&view);

        let writer = std::thread::spawn(move || {
            for i in 0..50_000u64 {
                let mut snapshot = BookSnapshot::default();
                snapshot.version = i;
                snapshot.exch_ts = Ts::from_nanos(i as i64);
                writer_view.store(snapshot);
            }
        });

        let reader = std::thread::spawn(move || {
            for _ in 0..50_000 {
                let snapshot = view.load();
                // Version and timestamp are written together; a torn read
                // would break this equality
                assert_eq!(snapshot.exch_ts.as_nanos(), snapshot.version as i64);
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
