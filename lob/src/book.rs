//! Per-symbol book state

use crate::levels::SideBook;
use common::events::{BidAskEvent, BookLevel, LobStats, TickEvent};
use common::{Px, Qty, Symbol, Ts};
use metrics::counter;
use tracing::warn;

/// O(1) top-of-book view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1View {
    /// Book timestamp
    pub ts: Ts,
    /// Best bid
    pub best_bid: Px,
    /// Best ask
    pub best_ask: Px,
    /// Twice the mid price
    pub mid_x2: i64,
    /// Ask minus bid
    pub spread: i64,
    /// Bid volume over the top-N
    pub bid_depth: Qty,
    /// Ask volume over the top-N
    pub ask_depth: Qty,
}

/// Top-of-book state for one symbol
///
/// Owned by the market-data stage; never shared mutably. Readers observe
/// the [`crate::view::SharedBook`] the engine maintains.
#[derive(Debug, Clone)]
pub struct BookState {
    /// Symbol this book tracks
    pub symbol: Symbol,
    bids: SideBook,
    asks: SideBook,
    last_trade: Option<(Px, Qty)>,
    version: u64,
    exch_ts: Ts,
    local_ts: Ts,
    degraded: bool,
    last_seq: u64,
}

impl BookState {
    /// Create an empty book
    #[must_use]
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: SideBook::new(),
            asks: SideBook::new(),
            last_trade: None,
            version: 0,
            exch_ts: Ts::from_nanos(0),
            local_ts: Ts::from_nanos(0),
            degraded: false,
            last_seq: 0,
        }
    }

    /// Replace both ladders atomically from a snapshot
    ///
    /// A clean (non-crossed) snapshot is the only way a degraded book
    /// recovers; incrementals never clear the flag.
    pub fn apply_snapshot(&mut self, event: &BidAskEvent) {
        self.check_seq(event.seq);
        self.bids.replace(event.bids.as_slice());
        self.asks.replace(event.asks.as_slice());
        self.exch_ts = event.source_ts;
        self.local_ts = event.local_ts;
        self.version += 1;

        if self.is_crossed() {
            self.mark_crossed();
        } else {
            self.degraded = false;
        }
    }

    /// Update ladders from an incremental top-N; an empty side leaves the
    /// existing side untouched (one-sided updates are legal)
    pub fn apply_incremental(&mut self, event: &BidAskEvent) {
        self.check_seq(event.seq);
        if !event.bids.is_empty() {
            self.bids.replace(event.bids.as_slice());
        }
        if !event.asks.is_empty() {
            self.asks.replace(event.asks.as_slice());
        }
        self.exch_ts = event.source_ts;
        self.local_ts = event.local_ts;
        self.version += 1;

        if !self.bids.is_ordered(true) || !self.asks.is_ordered(false) {
            counter!("lob_unordered_total").increment(1);
            warn!(symbol = %self.symbol, "unordered ladder in incremental update");
            self.degraded = true;
        }
        if self.is_crossed() {
            self.mark_crossed();
        }
    }

    /// Record last-trade metadata
    pub fn apply_tick(&mut self, event: &TickEvent) {
        self.check_seq(event.seq);
        self.last_trade = Some((event.price, event.volume));
        self.exch_ts = event.source_ts;
        self.local_ts = event.local_ts;
        self.version += 1;
    }

    fn check_seq(&mut self, seq: u64) {
        if seq < self.last_seq {
            counter!("lob_seq_regression_total").increment(1);
            warn!(symbol = %self.symbol, seq, last = self.last_seq, "sequence regression");
            self.degraded = true;
        }
        self.last_seq = seq;
    }

    fn mark_crossed(&mut self) {
        self.degraded = true;
        counter!("lob_crossed_total").increment(1);
        warn!(
            symbol = %self.symbol,
            bid = ?self.bids.best().map(|l| l.price),
            ask = ?self.asks.best().map(|l| l.price),
            "crossed book, stats suppressed"
        );
    }

    /// True when best bid >= best ask
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.bids.best(), self.asks.best()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Degraded flag: crossed, unordered, or sequence-regressed
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Update version, bumped on every applied event
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Last trade, when one was seen
    #[must_use]
    pub const fn last_trade(&self) -> Option<(Px, Qty)> {
        self.last_trade
    }

    /// Bid ladder
    #[must_use]
    pub const fn bids(&self) -> &SideBook {
        &self.bids
    }

    /// Ask ladder
    #[must_use]
    pub const fn asks(&self) -> &SideBook {
        &self.asks
    }

    /// Book timestamp pair (exchange, local)
    #[must_use]
    pub const fn timestamps(&self) -> (Ts, Ts) {
        (self.exch_ts, self.local_ts)
    }

    /// O(1) L1 view; None when either side is empty
    #[must_use]
    pub fn l1(&self) -> Option<L1View> {
        let bid = self.bids.best()?;
        let ask = self.asks.best()?;
        Some(L1View {
            ts: self.exch_ts,
            best_bid: bid.price,
            best_ask: ask.price,
            mid_x2: bid.price.as_i64() + ask.price.as_i64(),
            spread: ask.price.as_i64() - bid.price.as_i64(),
            bid_depth: Qty::from_i64(self.bids.depth_qty(usize::MAX)),
            ask_depth: Qty::from_i64(self.asks.depth_qty(usize::MAX)),
        })
    }

    /// Up to `n` levels per side, no padding
    #[must_use]
    pub fn depth(&self, n: usize) -> (&[BookLevel], &[BookLevel]) {
        (self.bids.top(n), self.asks.top(n))
    }

    /// Derived statistics; None while degraded or one-sided so invalid
    /// prices never propagate downstream
    #[must_use]
    pub fn stats(&self) -> Option<LobStats> {
        if self.degraded {
            return None;
        }
        let l1 = self.l1()?;
        let bid_depth = l1.bid_depth.as_i64();
        let ask_depth = l1.ask_depth.as_i64();
        Some(LobStats {
            symbol: self.symbol,
            best_bid: l1.best_bid,
            best_ask: l1.best_ask,
            mid_x2: l1.mid_x2,
            spread: l1.spread,
            bid_depth: l1.bid_depth,
            ask_depth: l1.ask_depth,
            imbalance_num: bid_depth - ask_depth,
            imbalance_den: bid_depth + ask_depth,
            ts: self.exch_ts,
        })
    }

    /// Size-weighted mid, integer-only; falls back to plain mid on empty sizes
    #[must_use]
    pub fn microprice(&self) -> Option<Px> {
        let bid = self.bids.best()?;
        let ask = self.asks.best()?;
        let total = bid.qty.as_i64() + ask.qty.as_i64();
        if total > 0 {
            let weighted = bid.price.as_i64() * ask.qty.as_i64()
                + ask.price.as_i64() * bid.qty.as_i64();
            Some(Px::from_scaled(weighted / total))
        } else {
            Some(Px::from_scaled(
                (bid.price.as_i64() + ask.price.as_i64()) / 2,
            ))
        }
    }

    /// Deterministic hash of the ladder state, for replay verification
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hash = 0u64;
        for level in self.bids.as_slice().iter().chain(self.asks.as_slice()) {
            hash = hash
                .wrapping_mul(31)
                .wrapping_add(level.price.as_i64() as u64);
            hash = hash
                .wrapping_mul(31)
                .wrapping_add(level.qty.as_i64() as u64);
        }
        hash
    }
}
