//! Event and command types flowing through the pipeline

use crate::reason::ReasonCode;
use crate::types::{Px, Qty, Side, StrategyId, Symbol, Ts};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Book depth carried on events and in book state (top-N, N <= 5)
pub const DEPTH: usize = 5;

/// One price level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Scaled price
    pub price: Px,
    /// Resting volume
    pub qty: Qty,
}

impl BookLevel {
    /// Create a level from scaled price and volume
    #[must_use]
    pub const fn new(price: Px, qty: Qty) -> Self {
        Self { price, qty }
    }
}

/// Fixed-capacity ladder of up to [`DEPTH`] levels, no heap allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ladder {
    levels: [BookLevel; DEPTH],
    len: u8,
}

impl Ladder {
    /// Empty ladder
    #[must_use]
    pub const fn new() -> Self {
        Self {
            levels: [BookLevel {
                price: Px(0),
                qty: Qty(0),
            }; DEPTH],
            len: 0,
        }
    }

    /// Append a level; silently ignores pushes past [`DEPTH`]
    pub fn push(&mut self, level: BookLevel) {
        if (self.len as usize) < DEPTH {
            self.levels[self.len as usize] = level;
            self.len += 1;
        }
    }

    /// Populated levels
    #[must_use]
    pub fn as_slice(&self) -> &[BookLevel] {
        &self.levels[..self.len as usize]
    }

    /// Number of populated levels
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// True when no levels are populated
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl FromIterator<BookLevel> for Ladder {
    fn from_iter<I: IntoIterator<Item = BookLevel>>(iter: I) -> Self {
        let mut ladder = Self::new();
        for level in iter {
            ladder.push(level);
        }
        ladder
    }
}

/// Normalized trade tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    /// Symbol
    pub symbol: Symbol,
    /// Trade price, scaled
    pub price: Px,
    /// Trade volume
    pub volume: Qty,
    /// Exchange timestamp
    pub source_ts: Ts,
    /// Local ingest timestamp (monotonic)
    pub local_ts: Ts,
    /// Stream sequence number
    pub seq: u64,
}

/// Normalized top-of-book update; one-sided books are legal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidAskEvent {
    /// Symbol
    pub symbol: Symbol,
    /// Bid levels, best first
    pub bids: Ladder,
    /// Ask levels, best first
    pub asks: Ladder,
    /// True when this replaces the whole book
    pub is_snapshot: bool,
    /// Exchange timestamp
    pub source_ts: Ts,
    /// Local ingest timestamp (monotonic)
    pub local_ts: Ts,
    /// Stream sequence number
    pub seq: u64,
}

/// Derived book statistics, all scaled integers
///
/// `mid_x2 = best_bid + best_ask`; doubling sidesteps the half-tick loss of
/// an integer divide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobStats {
    /// Symbol
    pub symbol: Symbol,
    /// Best bid, scaled
    pub best_bid: Px,
    /// Best ask, scaled
    pub best_ask: Px,
    /// Twice the mid price
    pub mid_x2: i64,
    /// Ask minus bid, scaled
    pub spread: i64,
    /// Total bid volume over the top-N
    pub bid_depth: Qty,
    /// Total ask volume over the top-N
    pub ask_depth: Qty,
    /// Imbalance numerator: bid depth minus ask depth
    pub imbalance_num: i64,
    /// Imbalance denominator: bid depth plus ask depth
    pub imbalance_den: i64,
    /// Book timestamp
    pub ts: Ts,
}

/// Event published on the market-data bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketEvent {
    /// Trade tick
    Tick(TickEvent),
    /// Book update
    BidAsk(BidAskEvent),
    /// Derived statistics
    Stats(LobStats),
}

impl MarketEvent {
    /// Symbol the event refers to
    #[must_use]
    pub const fn symbol(&self) -> Symbol {
        match self {
            Self::Tick(e) => e.symbol,
            Self::BidAsk(e) => e.symbol,
            Self::Stats(e) => e.symbol,
        }
    }

    /// Metric label for `feed_events_total{type}`
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Tick(_) => "tick",
            Self::BidAsk(e) => {
                if e.is_snapshot {
                    "snapshot"
                } else {
                    "bidask"
                }
            }
            Self::Stats(_) => "stats",
        }
    }
}

/// Intent lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentType {
    /// Place a new order
    New,
    /// Amend a resting order
    Amend,
    /// Cancel a resting order
    Cancel,
}

/// Time-in-force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tif {
    /// Resting limit order
    Limit,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
}

/// StormGuard policy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StormState {
    /// Full trading
    Normal,
    /// Sizes and rates throttled
    Degraded,
    /// Cancel-only
    Halt,
}

impl fmt::Display for StormState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Halt => write!(f, "HALT"),
        }
    }
}

/// Shared, lock-free view of the current policy mode
///
/// StormGuard writes, everyone else reads.
#[derive(Debug)]
pub struct StormFlag(std::sync::atomic::AtomicU8);

impl StormFlag {
    /// Create a flag in the given mode
    #[must_use]
    pub fn new(state: StormState) -> Self {
        Self(std::sync::atomic::AtomicU8::new(Self::encode(state)))
    }

    /// Current mode
    #[must_use]
    pub fn get(&self) -> StormState {
        match self.0.load(std::sync::atomic::Ordering::Acquire) {
            0 => StormState::Normal,
            1 => StormState::Degraded,
            _ => StormState::Halt,
        }
    }

    /// Publish a new mode
    pub fn set(&self, state: StormState) {
        self.0
            .store(Self::encode(state), std::sync::atomic::Ordering::Release);
    }

    const fn encode(state: StormState) -> u8 {
        match state {
            StormState::Normal => 0,
            StormState::Degraded => 1,
            StormState::Halt => 2,
        }
    }
}

impl Default for StormFlag {
    fn default() -> Self {
        Self::new(StormState::Normal)
    }
}

/// Deterministic fingerprint of an intent; replays are detected by equality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub [u8; 16]);

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Order intent emitted by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Monotonically increasing per-runner id
    pub intent_id: u64,
    /// Emitting strategy
    pub strategy: StrategyId,
    /// Symbol
    pub symbol: Symbol,
    /// Lifecycle operation
    pub intent_type: IntentType,
    /// Side
    pub side: Side,
    /// Limit price, scaled
    pub price: Px,
    /// Quantity
    pub qty: Qty,
    /// Time-in-force
    pub tif: Tif,
    /// Resting order targeted by AMEND/CANCEL
    pub target_order_id: Option<u64>,
    /// Replay-detection fingerprint
    pub idempotency_key: IdempotencyKey,
    /// Relative validity window
    pub ttl_ns: i64,
    /// Correlation id for logs and audit
    pub trace_id: u128,
    /// Emission timestamp
    pub created: Ts,
}

impl OrderIntent {
    /// Signed quantity: positive for buys, negative for sells
    #[must_use]
    pub const fn signed_qty(&self) -> i64 {
        self.qty.as_i64() * self.side.sign()
    }
}

/// Approved intent on its way to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCommand {
    /// The approved intent
    pub intent: OrderIntent,
    /// Absolute drop-dead time; the adapter discards stale commands
    pub deadline: Ts,
    /// Policy mode at approval time
    pub storm_state: StormState,
}

/// Broker order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted locally, not yet at the broker
    Pending,
    /// Acknowledged by the broker
    Submitted,
    /// Partially filled
    Filling,
    /// Fully filled
    Filled,
    /// Cancelled
    Cancelled,
    /// Rejected
    Rejected,
}

impl OrderStatus {
    /// Terminal states admit no further transitions
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// Normalized broker order callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Broker-assigned order id
    pub broker_order_id: u64,
    /// Originating intent, when attributable
    pub intent_id: Option<u64>,
    /// New status
    pub status: OrderStatus,
    /// Reject/cancel reason when present
    pub reason: Option<ReasonCode>,
    /// Callback timestamp
    pub ts: Ts,
}

/// Normalized broker fill callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Broker-assigned fill id
    pub fill_id: u64,
    /// Broker-assigned order id
    pub broker_order_id: u64,
    /// Originating intent, when attributable
    pub intent_id: Option<u64>,
    /// Symbol
    pub symbol: Symbol,
    /// Side
    pub side: Side,
    /// Fill price, scaled
    pub price: Px,
    /// Fill quantity
    pub qty: Qty,
    /// Fee, scaled
    pub fee: i64,
    /// Match timestamp at the venue
    pub match_ts: Ts,
}

/// Position change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDelta {
    /// Strategy owning the position
    pub strategy: StrategyId,
    /// Symbol
    pub symbol: Symbol,
    /// Net quantity after the fill
    pub net_qty: Qty,
    /// Weighted average entry price, scaled
    pub avg_price: Px,
    /// Cumulative realized PnL, scaled
    pub realized_pnl: i64,
    /// Update timestamp
    pub ts: Ts,
}

/// Normalized execution-plane event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecEvent {
    /// Order status change
    Order(OrderEvent),
    /// Fill
    Fill(FillEvent),
}

/// Recorder topic, one per store table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Ticks, books and stats
    MarketData,
    /// Order lifecycle rows
    Orders,
    /// Fill rows
    Trades,
    /// Risk/audit decisions
    RiskLog,
    /// Per-stage latency spans
    LatencySpans,
}

impl Topic {
    /// All topics, iteration order is stable
    pub const ALL: [Self; 5] = [
        Self::MarketData,
        Self::Orders,
        Self::Trades,
        Self::RiskLog,
        Self::LatencySpans,
    ];

    /// Store table name / metric label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Orders => "orders",
            Self::Trades => "trades",
            Self::RiskLog => "risk_log",
            Self::LatencySpans => "latency_spans",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market-data row kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketDataKind {
    /// Trade tick
    Tick,
    /// Incremental book
    BidAsk,
    /// Full book snapshot
    Snapshot,
    /// Derived statistics
    Stats,
}

/// Row for the `market_data` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataRow {
    /// Symbol
    pub symbol: Symbol,
    /// Row kind
    pub kind: MarketDataKind,
    /// Exchange timestamp
    pub exch_ts: Ts,
    /// Ingest timestamp
    pub ingest_ts: Ts,
    /// Trade/mid price, scaled
    pub price: i64,
    /// Trade volume
    pub volume: i64,
    /// Bid prices, best first
    pub bids_price: Vec<i64>,
    /// Bid volumes
    pub bids_vol: Vec<i64>,
    /// Ask prices, best first
    pub asks_price: Vec<i64>,
    /// Ask volumes
    pub asks_vol: Vec<i64>,
    /// Stream sequence number
    pub seq_no: u64,
}

/// Row for the `orders` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRow {
    /// Order id (intent id until a broker id is known)
    pub order_id: u64,
    /// Strategy
    pub strategy: StrategyId,
    /// Symbol
    pub symbol: Symbol,
    /// Side
    pub side: Side,
    /// Price, scaled
    pub price: i64,
    /// Quantity
    pub qty: i64,
    /// Status
    pub status: OrderStatus,
    /// Ingest timestamp
    pub ingest_ts: Ts,
    /// Decision latency in microseconds
    pub latency_us: i64,
    /// Event sequence within the order's lifecycle
    pub event_seq: u32,
}

/// Row for the `trades` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRow {
    /// Fill id (business dedup key)
    pub fill_id: u64,
    /// Broker order id
    pub order_id: u64,
    /// Strategy
    pub strategy: StrategyId,
    /// Symbol
    pub symbol: Symbol,
    /// Side
    pub side: Side,
    /// Price, scaled
    pub price: i64,
    /// Quantity
    pub qty: i64,
    /// Fee, scaled
    pub fee: i64,
    /// Venue match timestamp
    pub match_ts: Ts,
}

/// Row for the `risk_log` table; every reject is auditable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLogRow {
    /// Decision timestamp
    pub ts: Ts,
    /// Strategy
    pub strategy: StrategyId,
    /// Symbol
    pub symbol: Symbol,
    /// Intent id
    pub intent_id: u64,
    /// Reason code
    pub reason: ReasonCode,
    /// Threshold that was evaluated
    pub threshold: i64,
    /// Observed value
    pub value: i64,
}

/// Row for the `latency_spans` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySpanRow {
    /// Span end timestamp
    pub ts: Ts,
    /// Pipeline stage name
    pub stage: String,
    /// Span duration in nanoseconds
    pub nanos: i64,
}

/// One recorder enqueue; topic-tagged row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordEvent {
    /// `market_data` row
    MarketData(MarketDataRow),
    /// `orders` row
    Order(OrderRow),
    /// `trades` row
    Trade(TradeRow),
    /// `risk_log` row
    Risk(RiskLogRow),
    /// `latency_spans` row
    Latency(LatencySpanRow),
}

impl RecordEvent {
    /// Topic this row belongs to
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::MarketData(_) => Topic::MarketData,
            Self::Order(_) => Topic::Orders,
            Self::Trade(_) => Topic::Trades,
            Self::Risk(_) => Topic::RiskLog,
            Self::Latency(_) => Topic::LatencySpans,
        }
    }

    /// Business dedup key for idempotent replay, when the topic has one
    #[must_use]
    pub fn business_key(&self) -> Option<u128> {
        match self {
            Self::Trade(row) => Some(u128::from(row.fill_id)),
            Self::Order(row) => {
                Some((u128::from(row.order_id) << 32) | u128::from(row.event_seq))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_caps_at_depth() {
        let mut ladder = Ladder::new();
        for i in 0..10 {
            ladder.push(BookLevel::new(Px::from_scaled(i), Qty::from_i64(1)));
        }
        assert_eq!(ladder.len(), DEPTH);
        assert_eq!(ladder.as_slice()[4].price, Px::from_scaled(4));
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Filling.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
    }

    #[test]
    fn test_record_event_business_keys() {
        let trade = RecordEvent::Trade(TradeRow {
            fill_id: 7,
            order_id: 1,
            strategy: StrategyId::new(1),
            symbol: Symbol::new(1),
            side: Side::Buy,
            price: 100,
            qty: 1,
            fee: 0,
            match_ts: Ts::from_nanos(0),
        });
        assert_eq!(trade.business_key(), Some(7));

        let order = RecordEvent::Order(OrderRow {
            order_id: 3,
            strategy: StrategyId::new(1),
            symbol: Symbol::new(1),
            side: Side::Sell,
            price: 100,
            qty: 1,
            status: OrderStatus::Submitted,
            ingest_ts: Ts::from_nanos(0),
            latency_us: 0,
            event_seq: 2,
        });
        assert_eq!(order.business_key(), Some((3u128 << 32) | 2));
    }

    #[test]
    fn test_market_event_kind_labels() {
        let snapshot = MarketEvent::BidAsk(BidAskEvent {
            symbol: Symbol::new(1),
            bids: Ladder::new(),
            asks: Ladder::new(),
            is_snapshot: true,
            source_ts: Ts::from_nanos(0),
            local_ts: Ts::from_nanos(0),
            seq: 0,
        });
        assert_eq!(snapshot.kind(), "snapshot");
    }

    #[test]
    fn test_event_serde_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let intent = OrderIntent {
            intent_id: 1,
            strategy: StrategyId::new(2),
            symbol: Symbol::new(3),
            intent_type: IntentType::New,
            side: Side::Buy,
            price: Px::from_scaled(1_000_100),
            qty: Qty::from_i64(10),
            tif: Tif::Limit,
            target_order_id: None,
            idempotency_key: IdempotencyKey([9; 16]),
            ttl_ns: 1_000_000,
            trace_id: 42,
            created: Ts::from_nanos(5),
        };
        let encoded = bincode::serialize(&intent)?;
        let decoded: OrderIntent = bincode::deserialize(&encoded)?;
        assert_eq!(intent, decoded);
        Ok(())
    }
}
