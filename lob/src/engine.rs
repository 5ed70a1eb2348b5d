//! Book engine: routes normalized events to per-symbol books

use crate::book::{BookState, L1View};
use crate::view::BookViews;
use common::events::{BidAskEvent, BookLevel, LobStats, TickEvent};
use common::Symbol;
use rustc_hash::FxHashMap;

/// Owns every [`BookState`] and the shared reader views
///
/// Single writer: only the market-data stage calls the apply methods.
pub struct LobEngine {
    books: FxHashMap<Symbol, BookState>,
    views: BookViews,
}

impl LobEngine {
    /// Create an engine publishing reader views into `views`
    #[must_use]
    pub fn new(views: BookViews) -> Self {
        Self {
            books: FxHashMap::default(),
            views,
        }
    }

    /// Apply a book update, snapshot or incremental
    ///
    /// Returns the derived stats when the update produced a clean two-sided
    /// book; crossed or degraded books yield None and nothing is published
    /// downstream.
    pub fn apply_bidask(&mut self, event: &BidAskEvent) -> Option<LobStats> {
        let book = self
            .books
            .entry(event.symbol)
            .or_insert_with(|| BookState::new(event.symbol));
        if event.is_snapshot {
            book.apply_snapshot(event);
        } else {
            book.apply_incremental(event);
        }
        self.views.publish(book);
        book.stats()
    }

    /// Apply a trade tick
    pub fn apply_tick(&mut self, event: &TickEvent) {
        let book = self
            .books
            .entry(event.symbol)
            .or_insert_with(|| BookState::new(event.symbol));
        book.apply_tick(event);
        self.views.publish(book);
    }

    /// O(1) top-of-book for `symbol`
    #[must_use]
    pub fn l1(&self, symbol: Symbol) -> Option<L1View> {
        self.books.get(&symbol).and_then(BookState::l1)
    }

    /// Up to `n` levels per side, no padding
    #[must_use]
    pub fn depth(&self, symbol: Symbol, n: usize) -> Option<(&[BookLevel], &[BookLevel])> {
        self.books.get(&symbol).map(|b| b.depth(n))
    }

    /// Book state for `symbol`
    #[must_use]
    pub fn book(&self, symbol: Symbol) -> Option<&BookState> {
        self.books.get(&symbol)
    }

    /// Number of tracked symbols
    #[must_use]
    pub fn len(&self) -> usize {
        self.books.len()
    }

    /// True when no symbol has been seen yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
