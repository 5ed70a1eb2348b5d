//! Integer-only position accounting
//!
//! Writers are serialized behind a mutex; readers take a copy-on-write
//! snapshot that is never locked. Realized PnL is computed at each opposing
//! fill, in price-scale units (scaled price difference times quantity).

use arc_swap::ArcSwap;
use common::events::PositionDelta;
use common::{Px, Qty, Side, StrategyId, Symbol, Ts};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One (strategy, symbol) position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionEntry {
    /// Net quantity, positive long
    pub net_qty: i64,
    /// Weighted average entry price, scaled
    pub avg_price: i64,
    /// Cumulative realized PnL, scaled
    pub realized_pnl: i64,
    /// Cumulative fees, scaled
    pub fees: i64,
}

/// Snapshot map handed to readers
pub type PositionBook = FxHashMap<(StrategyId, Symbol), PositionEntry>;

/// Thread-safe position store
pub struct PositionStore {
    inner: Mutex<PositionBook>,
    snapshot: ArcSwap<PositionBook>,
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PositionBook::default()),
            snapshot: ArcSwap::from_pointee(PositionBook::default()),
        }
    }

    /// Apply a fill and return the resulting delta
    pub fn apply_fill(
        &self,
        strategy: StrategyId,
        symbol: Symbol,
        side: Side,
        price: Px,
        qty: Qty,
        fee: i64,
        ts: Ts,
    ) -> PositionDelta {
        let mut book = self.inner.lock();
        let entry = book.entry((strategy, symbol)).or_default();

        let qty = qty.as_i64();
        let px = price.as_i64();

        match side {
            Side::Buy => {
                if entry.net_qty >= 0 {
                    // Adding to a long: weighted average entry
                    let total_cost = entry.avg_price * entry.net_qty + px * qty;
                    entry.net_qty += qty;
                    if entry.net_qty > 0 {
                        entry.avg_price = total_cost / entry.net_qty;
                    }
                } else {
                    // Covering a short: realize on the closed quantity
                    let closed = qty.min(-entry.net_qty);
                    entry.realized_pnl += closed * (entry.avg_price - px);
                    entry.net_qty += qty;
                    if entry.net_qty > 0 {
                        entry.avg_price = px;
                    } else if entry.net_qty == 0 {
                        entry.avg_price = 0;
                    }
                }
            }
            Side::Sell => {
                if entry.net_qty <= 0 {
                    let total_cost = entry.avg_price * (-entry.net_qty) + px * qty;
                    entry.net_qty -= qty;
                    if entry.net_qty < 0 {
                        entry.avg_price = total_cost / (-entry.net_qty);
                    }
                } else {
                    let closed = qty.min(entry.net_qty);
                    entry.realized_pnl += closed * (px - entry.avg_price);
                    entry.net_qty -= qty;
                    if entry.net_qty < 0 {
                        entry.avg_price = px;
                    } else if entry.net_qty == 0 {
                        entry.avg_price = 0;
                    }
                }
            }
        }
        entry.fees += fee;

        let delta = PositionDelta {
            strategy,
            symbol,
            net_qty: Qty::from_i64(entry.net_qty),
            avg_price: Px::from_scaled(entry.avg_price),
            realized_pnl: entry.realized_pnl,
            ts,
        };
        debug!(
            %strategy, %symbol,
            net = entry.net_qty, avg = entry.avg_price, pnl = entry.realized_pnl,
            "position updated"
        );

        self.snapshot.store(Arc::new(book.clone()));
        delta
    }

    /// Wait-free copy-on-write snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<PositionBook> {
        self.snapshot.load_full()
    }

    /// Position for one (strategy, symbol)
    #[must_use]
    pub fn get(&self, strategy: StrategyId, symbol: Symbol) -> Option<PositionEntry> {
        self.snapshot.load().get(&(strategy, symbol)).copied()
    }

    /// Net quantity for one (strategy, symbol), zero when absent
    #[must_use]
    pub fn net_qty(&self, strategy: StrategyId, symbol: Symbol) -> i64 {
        self.get(strategy, symbol).map_or(0, |e| e.net_qty)
    }

    /// Total realized PnL across all positions, scaled
    #[must_use]
    pub fn total_realized_pnl(&self) -> i64 {
        self.snapshot.load().values().map(|e| e.realized_pnl).sum()
    }

    /// Replace the whole book (startup reconciliation)
    pub fn rebuild(&self, entries: PositionBook) {
        let mut book = self.inner.lock();
        *book = entries;
        self.snapshot.store(Arc::new(book.clone()));
    }
}
