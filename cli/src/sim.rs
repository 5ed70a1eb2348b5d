//! Synthetic broker and feed for `run sim`
//!
//! Deterministic under a fixed seed: the feed walks each symbol's mid in
//! ticks and the broker acks and fills everything through the same raw
//! execution queue a live SDK would use.

use adapter::{BrokerClient, BrokerError};
use bus::StageSender;
use common::events::OrderCommand;
use common::{Px, Qty, SymbolDirectory};
use execution::{RawExecEnvelope, RawExecKind};
use feeds::{RawEnvelope, RawKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Broker facade that acknowledges and fully fills every order
pub struct SimBroker {
    next_order_id: u64,
    next_fill_id: u64,
    exec_tx: StageSender<RawExecEnvelope>,
}

impl SimBroker {
    /// Create a sim broker emitting callbacks into the raw execution queue
    #[must_use]
    pub fn new(exec_tx: StageSender<RawExecEnvelope>) -> Self {
        Self {
            next_order_id: 5_000,
            next_fill_id: 9_000,
            exec_tx,
        }
    }

    fn emit(&self, kind: RawExecKind, body: serde_json::Value) {
        let envelope = RawExecEnvelope::capture(kind, body.to_string().into_bytes());
        let _ = self.exec_tx.try_send(envelope);
    }
}

impl BrokerClient for SimBroker {
    fn place_order(&mut self, command: &OrderCommand) -> Result<u64, BrokerError> {
        self.next_order_id += 1;
        self.next_fill_id += 1;
        let order_id = self.next_order_id;
        let now_ns = common::Timebase::global().now().as_nanos();

        self.emit(
            RawExecKind::Order,
            serde_json::json!({
                "orderId": order_id,
                "opCode": 1,
                "exchTs": now_ns,
            }),
        );
        // Full fill at the limit price; the fill price reaches the router
        // as a decimal, the way a broker reports it
        self.emit(
            RawExecKind::Fill,
            serde_json::json!({
                "fillId": self.next_fill_id,
                "orderId": order_id,
                "lastPrice": command.intent.price.as_i64() as f64 / 10_000.0,
                "vol": command.intent.qty.as_i64(),
                "fee": 0.0,
                "matchTs": now_ns,
            }),
        );
        self.emit(
            RawExecKind::Order,
            serde_json::json!({
                "orderId": order_id,
                "opCode": 3,
                "exchTs": now_ns,
            }),
        );
        Ok(order_id)
    }

    fn amend_order(&mut self, broker_order_id: u64, _price: Px, _qty: Qty) -> Result<(), BrokerError> {
        let now_ns = common::Timebase::global().now().as_nanos();
        self.emit(
            RawExecKind::Order,
            serde_json::json!({
                "orderId": broker_order_id,
                "opCode": 1,
                "exchTs": now_ns,
            }),
        );
        Ok(())
    }

    fn cancel_order(&mut self, broker_order_id: u64) -> Result<(), BrokerError> {
        let now_ns = common::Timebase::global().now().as_nanos();
        self.emit(
            RawExecKind::Order,
            serde_json::json!({
                "orderId": broker_order_id,
                "opCode": 4,
                "exchTs": now_ns,
            }),
        );
        Ok(())
    }
}

/// Feed generator: per-symbol tick random walk, snapshots every so often
pub struct SimFeed {
    raw_tx: StageSender<RawEnvelope>,
    symbols: Arc<SymbolDirectory>,
    seed: u64,
}

impl SimFeed {
    /// Create a generator over every symbol in the directory
    #[must_use]
    pub fn new(raw_tx: StageSender<RawEnvelope>, symbols: Arc<SymbolDirectory>, seed: u64) -> Self {
        Self {
            raw_tx,
            symbols,
            seed,
        }
    }

    /// Pump payloads until the deadline or the stop flag
    pub fn run(&self, duration: Duration, stop: &AtomicBool) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let deadline = Instant::now() + duration;

        let mut universe: Vec<(String, f64, f64)> = Vec::new();
        let mut id = 0u32;
        while let Some(meta) = self.symbols.meta(common::Symbol::new(id)) {
            // Start each symbol's walk at a distinct level
            universe.push((meta.code.clone(), 100.0 + f64::from(id) * 25.0, 0.2));
            id += 1;
        }
        if universe.is_empty() {
            return;
        }
        info!(symbols = universe.len(), "sim feed started");

        let mut emitted = 0u64;
        while Instant::now() < deadline && !stop.load(Ordering::Acquire) {
            let idx = rng.gen_range(0..universe.len());
            let (code, mid, tick) = &mut universe[idx];
            *mid += f64::from(rng.gen_range(-2i32..=2)) * *tick;

            let body = if emitted % 50 == 0 {
                Self::snapshot_body(code, *mid, *tick, &mut rng)
            } else if emitted % 7 == 0 {
                serde_json::json!({
                    "symbol": code,
                    "lastPrice": *mid,
                    "vol": rng.gen_range(1..20),
                    "exchTs": common::Timebase::global().now().as_nanos(),
                })
            } else {
                Self::bidask_body(code, *mid, *tick, &mut rng)
            };

            let kind = if emitted % 50 == 0 {
                RawKind::Snapshot
            } else if emitted % 7 == 0 {
                RawKind::Tick
            } else {
                RawKind::BidAsk
            };

            let envelope = RawEnvelope::capture(kind, body.to_string().into_bytes());
            if self.raw_tx.try_send(envelope).is_err() {
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }
            emitted += 1;
            if emitted % 64 == 0 {
                std::thread::sleep(Duration::from_micros(500));
            }
        }
        info!(emitted, "sim feed stopped");
    }

    fn snapshot_body(
        code: &str,
        mid: f64,
        tick: f64,
        rng: &mut StdRng,
    ) -> serde_json::Value {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for level in 0..5 {
            let offset = tick * (f64::from(level) + 0.5);
            bids.push(serde_json::json!({"p": mid - offset, "v": rng.gen_range(1..50)}));
            asks.push(serde_json::json!({"p": mid + offset, "v": rng.gen_range(1..50)}));
        }
        serde_json::json!({
            "symbol": code,
            "bids": bids,
            "asks": asks,
            "exchTs": common::Timebase::global().now().as_nanos(),
        })
    }

    fn bidask_body(code: &str, mid: f64, tick: f64, rng: &mut StdRng) -> serde_json::Value {
        // Skewed sizes make the imbalance strategy fire
        let bid_vol = rng.gen_range(1..100);
        let ask_vol = rng.gen_range(1..100);
        serde_json::json!({
            "symbol": code,
            "bids": [{"p": mid - tick * 0.5, "v": bid_vol}],
            "asks": [{"p": mid + tick * 0.5, "v": ask_vol}],
            "exchTs": common::Timebase::global().now().as_nanos(),
        })
    }
}
