//! Raw broker payloads
//!
//! Wire structs mirror what brokers actually send, including the camelCase /
//! snake_case drift between venues; serde aliases absorb the variants.

use common::Ts;
use serde::Deserialize;

/// Payload kind, known at the callback site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// Trade tick
    Tick,
    /// Incremental top-N book
    BidAsk,
    /// Full book snapshot
    Snapshot,
}

/// Raw payload as enqueued by a broker callback
///
/// `recv_ts` is stamped on callback entry from the monotonic timebase; the
/// body is parsed later on the stage thread.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    /// Payload kind
    pub kind: RawKind,
    /// Unparsed payload bytes
    pub body: Vec<u8>,
    /// Monotonic receive timestamp
    pub recv_ts: Ts,
}

impl RawEnvelope {
    /// Wrap a payload, stamping the receive time now
    #[must_use]
    pub fn capture(kind: RawKind, body: Vec<u8>) -> Self {
        Self {
            kind,
            body,
            recv_ts: common::Timebase::global().now(),
        }
    }
}

/// One wire price level
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WireLevel {
    /// Decimal price
    #[serde(alias = "p")]
    pub price: f64,
    /// Volume at the level
    #[serde(alias = "v", alias = "vol", alias = "qty")]
    pub volume: i64,
}

/// Wire trade tick
#[derive(Debug, Clone, Deserialize)]
pub struct WireTick {
    /// Venue symbol code
    #[serde(alias = "instrumentId", alias = "instrument_id", alias = "code")]
    pub symbol: String,
    /// Trade price
    #[serde(alias = "lastPrice", alias = "last_price")]
    pub price: f64,
    /// Trade volume
    #[serde(default, alias = "lastVolume", alias = "last_volume", alias = "vol")]
    pub volume: i64,
    /// Venue timestamp, nanoseconds
    #[serde(default, alias = "exchTs", alias = "exch_ts", alias = "timestamp")]
    pub ts_ns: i64,
}

/// Wire book update (incremental or snapshot)
#[derive(Debug, Clone, Deserialize)]
pub struct WireBidAsk {
    /// Venue symbol code
    #[serde(alias = "instrumentId", alias = "instrument_id", alias = "code")]
    pub symbol: String,
    /// Bid levels, best first; may be absent for one-sided updates
    #[serde(default, alias = "bidLevels", alias = "bid_levels")]
    pub bids: Vec<WireLevel>,
    /// Ask levels, best first; may be absent for one-sided updates
    #[serde(default, alias = "askLevels", alias = "ask_levels")]
    pub asks: Vec<WireLevel>,
    /// Venue timestamp, nanoseconds
    #[serde(default, alias = "exchTs", alias = "exch_ts", alias = "timestamp")]
    pub ts_ns: i64,
}
