//! Execution router: broker callbacks to normalized events
//!
//! Consumes the raw execution queue, attributes callbacks through the order
//! directory, updates positions, and forwards normalized events to the
//! strategy runner and the recorder.

use crate::orders::OrderDirectory;
use crate::positions::PositionStore;
use bus::{StageReceiver, StageSender};
use common::events::{
    ExecEvent, FillEvent, OrderEvent, OrderRow, OrderStatus, RecordEvent, TradeRow,
};
use common::{SymbolDirectory, Ts};
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Execution payload kind, known at the callback site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawExecKind {
    /// Order lifecycle update
    Order,
    /// Fill / deal
    Fill,
}

/// Raw execution payload as enqueued by a broker callback
#[derive(Debug, Clone)]
pub struct RawExecEnvelope {
    /// Payload kind
    pub kind: RawExecKind,
    /// Unparsed payload bytes
    pub body: Vec<u8>,
    /// Monotonic receive timestamp
    pub recv_ts: Ts,
}

impl RawExecEnvelope {
    /// Wrap a payload, stamping the receive time now
    #[must_use]
    pub fn capture(kind: RawExecKind, body: Vec<u8>) -> Self {
        Self {
            kind,
            body,
            recv_ts: common::Timebase::global().now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireOrderUpdate {
    #[serde(alias = "orderId", alias = "order_id")]
    broker_order_id: u64,
    /// Broker lifecycle op code
    #[serde(alias = "opCode", alias = "op_code")]
    status: u8,
    #[serde(default, alias = "exchTs", alias = "exch_ts", alias = "timestamp")]
    ts_ns: i64,
}

#[derive(Debug, Deserialize)]
struct WireFill {
    #[serde(alias = "fillId", alias = "fill_id", alias = "dealId", alias = "deal_id")]
    fill_id: u64,
    #[serde(alias = "orderId", alias = "order_id")]
    broker_order_id: u64,
    #[serde(alias = "lastPrice", alias = "last_price")]
    price: f64,
    #[serde(alias = "lastVolume", alias = "last_volume", alias = "vol")]
    qty: i64,
    #[serde(default)]
    fee: f64,
    #[serde(default, alias = "matchTs", alias = "match_ts", alias = "timestamp")]
    ts_ns: i64,
}

fn status_from_op(op: u8) -> OrderStatus {
    match op {
        0 => OrderStatus::Pending,
        1 => OrderStatus::Submitted,
        2 => OrderStatus::Filling,
        3 => OrderStatus::Filled,
        4 => OrderStatus::Cancelled,
        _ => OrderStatus::Rejected,
    }
}

/// The execution stage loop
pub struct ExecutionRouter {
    exec_rx: StageReceiver<RawExecEnvelope>,
    directory: Arc<OrderDirectory>,
    symbols: Arc<SymbolDirectory>,
    positions: Arc<PositionStore>,
    exec_tx: StageSender<ExecEvent>,
    recorder_tx: StageSender<RecordEvent>,
    shutdown: Arc<AtomicBool>,
    event_seq: AtomicU64,
}

impl ExecutionRouter {
    /// Assemble the router
    #[must_use]
    pub fn new(
        exec_rx: StageReceiver<RawExecEnvelope>,
        directory: Arc<OrderDirectory>,
        symbols: Arc<SymbolDirectory>,
        positions: Arc<PositionStore>,
        exec_tx: StageSender<ExecEvent>,
        recorder_tx: StageSender<RecordEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            exec_rx,
            directory,
            symbols,
            positions,
            exec_tx,
            recorder_tx,
            shutdown,
            event_seq: AtomicU64::new(0),
        }
    }

    /// Consume the raw execution queue until shutdown, then drain
    pub fn run(self) {
        info!("execution router started");
        loop {
            match self.exec_rx.recv_timeout(Duration::from_millis(1)) {
                Some(envelope) => self.handle(&envelope),
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
        while let Some(envelope) = self.exec_rx.try_recv() {
            self.handle(&envelope);
        }
        info!("execution router stopped");
    }

    fn handle(&self, envelope: &RawExecEnvelope) {
        match envelope.kind {
            RawExecKind::Order => self.handle_order(envelope),
            RawExecKind::Fill => self.handle_fill(envelope),
        }
    }

    fn handle_order(&self, envelope: &RawExecEnvelope) {
        let wire: WireOrderUpdate = match serde_json::from_slice(&envelope.body) {
            Ok(w) => w,
            Err(e) => {
                counter!("execution_errors_total", "type" => "malformed").increment(1);
                warn!(error = %e, "order callback dropped");
                return;
            }
        };
        counter!("execution_events_total", "type" => "order").increment(1);

        let status = status_from_op(wire.status);
        let attribution = self.directory.update_status(wire.broker_order_id, status);
        if attribution.is_none() {
            counter!("execution_errors_total", "type" => "unattributed").increment(1);
            warn!(broker_order_id = wire.broker_order_id, "order callback without attribution");
        }

        let event = OrderEvent {
            broker_order_id: wire.broker_order_id,
            intent_id: attribution.map(|a| a.intent_id),
            status,
            reason: None,
            ts: Ts::from_nanos(wire.ts_ns),
        };
        let _ = self.exec_tx.try_send(ExecEvent::Order(event));

        if let Some(attribution) = attribution {
            let row = OrderRow {
                order_id: wire.broker_order_id,
                strategy: attribution.strategy,
                symbol: attribution.symbol,
                side: attribution.side,
                price: attribution.price.as_i64(),
                qty: attribution.qty.as_i64(),
                status,
                ingest_ts: envelope.recv_ts,
                latency_us: 0,
                event_seq: self.next_event_seq(),
            };
            let _ = self.recorder_tx.try_send(RecordEvent::Order(row));
        }
    }

    fn handle_fill(&self, envelope: &RawExecEnvelope) {
        let wire: WireFill = match serde_json::from_slice(&envelope.body) {
            Ok(w) => w,
            Err(e) => {
                counter!("execution_errors_total", "type" => "malformed").increment(1);
                warn!(error = %e, "fill callback dropped");
                return;
            }
        };
        counter!("execution_events_total", "type" => "fill").increment(1);

        let Some(attribution) = self.directory.get(wire.broker_order_id) else {
            counter!("execution_errors_total", "type" => "unattributed").increment(1);
            warn!(broker_order_id = wire.broker_order_id, "fill without attribution");
            return;
        };

        let Some(meta) = self.symbols.meta(attribution.symbol) else {
            counter!("execution_errors_total", "type" => "unknown_symbol").increment(1);
            return;
        };
        let price = meta.codec.scale_f64(wire.price);
        let fee = meta.codec.scale_f64(wire.fee).as_i64();
        let match_ts = Ts::from_nanos(wire.ts_ns);

        let fill = FillEvent {
            fill_id: wire.fill_id,
            broker_order_id: wire.broker_order_id,
            intent_id: Some(attribution.intent_id),
            symbol: attribution.symbol,
            side: attribution.side,
            price,
            qty: common::Qty::from_i64(wire.qty),
            fee,
            match_ts,
        };

        let _delta = self.positions.apply_fill(
            attribution.strategy,
            attribution.symbol,
            attribution.side,
            price,
            fill.qty,
            fee,
            match_ts,
        );

        let _ = self.exec_tx.try_send(ExecEvent::Fill(fill));

        // orders/fills overflow policy is halt-on-loss; losing a trade row
        // poisons downstream accounting
        if self
            .recorder_tx
            .try_send(RecordEvent::Trade(TradeRow {
                fill_id: wire.fill_id,
                order_id: wire.broker_order_id,
                strategy: attribution.strategy,
                symbol: attribution.symbol,
                side: attribution.side,
                price: price.as_i64(),
                qty: wire.qty,
                fee,
                match_ts,
            }))
            .is_err()
        {
            counter!("recorder_failures_total").increment(1);
            warn!(fill_id = wire.fill_id, "trade row lost: recorder queue full");
        }
    }

    fn next_event_seq(&self) -> u32 {
        (self.event_seq.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::OrderAttribution;
    use common::{Px, Qty, Side, StrategyId, Symbol};

    fn setup() -> (
        StageSender<RawExecEnvelope>,
        Arc<OrderDirectory>,
        Arc<PositionStore>,
        StageReceiver<ExecEvent>,
        StageReceiver<RecordEvent>,
        Arc<AtomicBool>,
        ExecutionRouter,
    ) {
        let (raw_tx, raw_rx) = bus::bounded("raw_exec", 64);
        let (exec_tx, exec_rx) = bus::bounded("exec_events", 64);
        let (rec_tx, rec_rx) = bus::bounded("recorder", 64);
        let directory = Arc::new(OrderDirectory::new());
        let positions = Arc::new(PositionStore::new());
        let symbols = SymbolDirectory::empty();
        symbols.register("IF2409", "CFFEX", 4, 2000);
        let shutdown = Arc::new(AtomicBool::new(false));

        let router = ExecutionRouter::new(
            raw_rx,
            Arc::clone(&directory),
            Arc::new(symbols),
            Arc::clone(&positions),
            exec_tx,
            rec_tx,
            Arc::clone(&shutdown),
        );
        (raw_tx, directory, positions, exec_rx, rec_rx, shutdown, router)
    }

    fn attribution() -> OrderAttribution {
        OrderAttribution {
            intent_id: 7,
            strategy: StrategyId::new(1),
            symbol: Symbol::new(0),
            side: Side::Buy,
            price: Px::from_scaled(1_000_000),
            qty: Qty::from_i64(5),
            status: OrderStatus::Submitted,
        }
    }

    #[test]
    fn test_fill_updates_positions_and_emits() {
        let (raw_tx, directory, positions, exec_rx, rec_rx, shutdown, router) = setup();
        directory.register(1001, attribution());

        raw_tx
            .try_send(RawExecEnvelope {
                kind: RawExecKind::Fill,
                body: br#"{"fillId":55,"orderId":1001,"lastPrice":100.5,"vol":5,"matchTs":9}"#
                    .to_vec(),
                recv_ts: Ts::from_nanos(10),
            })
            .unwrap();
        shutdown.store(true, Ordering::Release);
        router.run();

        assert_eq!(positions.net_qty(StrategyId::new(1), Symbol::new(0)), 5);

        let ExecEvent::Fill(fill) = exec_rx.try_recv().unwrap() else {
            panic!("expected fill");
        };
        assert_eq!(fill.fill_id, 55);
        assert_eq!(fill.price, Px::from_scaled(1_005_000));
        assert_eq!(fill.intent_id, Some(7));

        let RecordEvent::Trade(row) = rec_rx.try_recv().unwrap() else {
            panic!("expected trade row");
        };
        assert_eq!(row.fill_id, 55);
    }

    #[test]
    fn test_order_update_transitions_directory() {
        let (raw_tx, directory, _positions, exec_rx, _rec_rx, shutdown, router) = setup();
        directory.register(1001, attribution());

        raw_tx
            .try_send(RawExecEnvelope {
                kind: RawExecKind::Order,
                body: br#"{"orderId":1001,"opCode":3,"exchTs":12}"#.to_vec(),
                recv_ts: Ts::from_nanos(10),
            })
            .unwrap();
        shutdown.store(true, Ordering::Release);
        router.run();

        assert!(directory.is_terminal(1001));
        let ExecEvent::Order(event) = exec_rx.try_recv().unwrap() else {
            panic!("expected order event");
        };
        assert_eq!(event.status, OrderStatus::Filled);
        assert_eq!(event.intent_id, Some(7));
    }

    #[test]
    fn test_unattributed_fill_dropped() {
        let (raw_tx, _directory, positions, exec_rx, _rec_rx, shutdown, router) = setup();

        raw_tx
            .try_send(RawExecEnvelope {
                kind: RawExecKind::Fill,
                body: br#"{"fillId":55,"orderId":4242,"lastPrice":100.5,"vol":5}"#.to_vec(),
                recv_ts: Ts::from_nanos(10),
            })
            .unwrap();
        shutdown.store(true, Ordering::Release);
        router.run();

        assert!(positions.snapshot().is_empty());
        assert!(exec_rx.try_recv().is_none());
    }
}
