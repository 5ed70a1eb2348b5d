//! Payload normalization
//!
//! Fixed-point conversion happens here and nowhere else. Malformed payloads
//! are counted and dropped; nothing is ever raised into a callback thread.

use crate::payload::{RawEnvelope, RawKind, WireBidAsk, WireLevel, WireTick};
use common::events::{BidAskEvent, BookLevel, Ladder, MarketEvent, TickEvent};
use common::{Qty, SymbolDirectory, SymbolMeta, Ts};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::warn;

/// Why a payload could not be normalized
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// Body is not valid JSON for the declared kind
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Symbol code absent from the directory
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl NormalizeError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownSymbol(_) => "unknown_symbol",
        }
    }
}

/// Broker payloads to internal fixed-point events
pub struct Normalizer {
    directory: Arc<SymbolDirectory>,
    seq: AtomicU64,
    errors_seen: AtomicU64,
    last_event_ns: AtomicU64,
}

impl Normalizer {
    /// Log one in this many errors with a payload excerpt
    const LOG_SAMPLE: u64 = 128;

    /// Create a normalizer over the symbol directory
    #[must_use]
    pub fn new(directory: Arc<SymbolDirectory>) -> Self {
        Self {
            directory,
            seq: AtomicU64::new(0),
            errors_seen: AtomicU64::new(0),
            last_event_ns: AtomicU64::new(0),
        }
    }

    /// Normalize one envelope
    ///
    /// `Ok(None)` means the payload was legal but filtered (non-positive
    /// price); `Err` means it was malformed and has been counted.
    pub fn normalize(&self, envelope: &RawEnvelope) -> Result<Option<MarketEvent>, NormalizeError> {
        let result = match envelope.kind {
            RawKind::Tick => self.normalize_tick(envelope),
            RawKind::BidAsk => self.normalize_bidask(envelope, false).map(Some),
            RawKind::Snapshot => self.normalize_bidask(envelope, true).map(Some),
        };
        match &result {
            Ok(Some(event)) => {
                counter!("feed_events_total", "type" => event.kind()).increment(1);
                self.track_interarrival(envelope.recv_ts);
            }
            Ok(None) => {
                counter!("feed_filtered_total").increment(1);
            }
            Err(e) => {
                counter!("normalization_errors_total", "type" => e.kind()).increment(1);
                let n = self.errors_seen.fetch_add(1, Ordering::Relaxed);
                if n % Self::LOG_SAMPLE == 0 {
                    let excerpt = String::from_utf8_lossy(
                        &envelope.body[..envelope.body.len().min(96)],
                    )
                    .into_owned();
                    warn!(error = %e, %excerpt, "payload dropped");
                }
            }
        }
        result
    }

    /// Normalize a trade tick; non-positive prices are filtered together
    /// with their volumes
    pub fn normalize_tick(
        &self,
        envelope: &RawEnvelope,
    ) -> Result<Option<MarketEvent>, NormalizeError> {
        let wire: WireTick = serde_json::from_slice(&envelope.body)?;
        let meta = self.resolve(&wire.symbol)?;

        let price = meta.codec.scale_f64(wire.price);
        if !price.is_positive() {
            return Ok(None);
        }

        Ok(Some(MarketEvent::Tick(TickEvent {
            symbol: meta.symbol,
            price,
            volume: Qty::from_i64(wire.volume),
            source_ts: Ts::from_nanos(wire.ts_ns),
            local_ts: envelope.recv_ts,
            seq: self.next_seq(),
        })))
    }

    /// Normalize a book update; one-sided books never fail, non-positive
    /// price levels are dropped with their volumes
    pub fn normalize_bidask(
        &self,
        envelope: &RawEnvelope,
        is_snapshot: bool,
    ) -> Result<MarketEvent, NormalizeError> {
        let wire: WireBidAsk = serde_json::from_slice(&envelope.body)?;
        let meta = self.resolve(&wire.symbol)?;

        Ok(MarketEvent::BidAsk(BidAskEvent {
            symbol: meta.symbol,
            bids: Self::scale_levels(&meta, &wire.bids),
            asks: Self::scale_levels(&meta, &wire.asks),
            is_snapshot,
            source_ts: Ts::from_nanos(wire.ts_ns),
            local_ts: envelope.recv_ts,
            seq: self.next_seq(),
        }))
    }

    fn scale_levels(meta: &SymbolMeta, levels: &[WireLevel]) -> Ladder {
        let mut ladder = Ladder::new();
        for level in levels {
            let price = meta.codec.scale_f64(level.price);
            if price.is_positive() {
                ladder.push(BookLevel::new(price, Qty::from_i64(level.volume)));
            }
        }
        ladder
    }

    fn resolve(&self, code: &str) -> Result<Arc<SymbolMeta>, NormalizeError> {
        let symbol = self
            .directory
            .resolve(code)
            .ok_or_else(|| NormalizeError::UnknownSymbol(code.to_string()))?;
        self.directory
            .meta(symbol)
            .ok_or_else(|| NormalizeError::UnknownSymbol(code.to_string()))
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn track_interarrival(&self, recv_ts: Ts) {
        let now = recv_ts.as_nanos().max(0) as u64;
        let last = self.last_event_ns.swap(now, Ordering::Relaxed);
        if last > 0 && now > last {
            metrics::histogram!("feed_interarrival_ns").record((now - last) as f64);
        }
        gauge!("feed_last_event_ts").set(now as f64);
    }
}
