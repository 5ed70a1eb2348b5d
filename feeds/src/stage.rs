//! Market-data stage: raw queue -> normalizer -> book engine -> bus
//!
//! Runs on its own thread. Stats are published paired with the event that
//! produced them so bus consumers never see one without the other.

use crate::normalize::Normalizer;
use crate::payload::RawEnvelope;
use bus::{Ring, StageReceiver, StageSender};
use common::events::{LatencySpanRow, MarketDataKind, MarketDataRow, MarketEvent, RecordEvent};
use common::Timebase;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// One handled payload in this many feeds the `latency_spans` topic
const LATENCY_SAMPLE: u64 = 64;

/// The feed stage loop
pub struct MarketDataStage {
    raw_rx: StageReceiver<RawEnvelope>,
    normalizer: Normalizer,
    engine: lob::LobEngine,
    ring: Ring<MarketEvent>,
    recorder_tx: StageSender<RecordEvent>,
    shutdown: Arc<AtomicBool>,
    /// Last receive timestamp, readable by StormGuard as a feed heartbeat
    pulse: Arc<AtomicI64>,
    handled: u64,
}

impl MarketDataStage {
    /// Assemble the stage
    #[must_use]
    pub fn new(
        raw_rx: StageReceiver<RawEnvelope>,
        normalizer: Normalizer,
        engine: lob::LobEngine,
        ring: Ring<MarketEvent>,
        recorder_tx: StageSender<RecordEvent>,
        shutdown: Arc<AtomicBool>,
        pulse: Arc<AtomicI64>,
    ) -> Self {
        Self {
            raw_rx,
            normalizer,
            engine,
            ring,
            recorder_tx,
            shutdown,
            pulse,
            handled: 0,
        }
    }

    /// Consume the raw queue until shutdown, then drain what is left
    pub fn run(mut self) {
        info!("market-data stage started");
        loop {
            match self.raw_rx.recv_timeout(Duration::from_millis(1)) {
                Some(envelope) => self.handle(&envelope),
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
        // Drain whatever the callbacks enqueued before the flag flipped
        while let Some(envelope) = self.raw_rx.try_recv() {
            self.handle(&envelope);
        }
        info!("market-data stage stopped");
    }

    fn handle(&mut self, envelope: &RawEnvelope) {
        let started = Instant::now();
        self.pulse
            .store(envelope.recv_ts.as_nanos(), Ordering::Release);
        let Ok(Some(event)) = self.normalizer.normalize(envelope) else {
            return;
        };

        let stats = match &event {
            MarketEvent::Tick(tick) => {
                self.engine.apply_tick(tick);
                None
            }
            MarketEvent::BidAsk(bidask) => self.engine.apply_bidask(bidask),
            MarketEvent::Stats(_) => None,
        };

        match stats {
            Some(stats) => {
                self.ring
                    .publish_many_nowait(&[event, MarketEvent::Stats(stats)]);
            }
            None => {
                self.ring.publish_nowait(event);
            }
        }

        // market_data overflow policy is drop: the row is lost, the counter moves
        let _ = self.recorder_tx.try_send(RecordEvent::MarketData(to_row(&event)));
        if let Some(stats) = stats {
            let _ = self
                .recorder_tx
                .try_send(RecordEvent::MarketData(to_row(&MarketEvent::Stats(stats))));
        }

        self.handled += 1;
        if self.handled % LATENCY_SAMPLE == 0 {
            let _ = self.recorder_tx.try_send(RecordEvent::Latency(LatencySpanRow {
                ts: envelope.recv_ts,
                stage: "feed".to_string(),
                nanos: started.elapsed().as_nanos() as i64,
            }));
        }
    }
}

/// Flatten a market event into its store row
#[must_use]
pub fn to_row(event: &MarketEvent) -> MarketDataRow {
    match event {
        MarketEvent::Tick(tick) => MarketDataRow {
            symbol: tick.symbol,
            kind: MarketDataKind::Tick,
            exch_ts: tick.source_ts,
            ingest_ts: tick.local_ts,
            price: tick.price.as_i64(),
            volume: tick.volume.as_i64(),
            bids_price: Vec::new(),
            bids_vol: Vec::new(),
            asks_price: Vec::new(),
            asks_vol: Vec::new(),
            seq_no: tick.seq,
        },
        MarketEvent::BidAsk(bidask) => MarketDataRow {
            symbol: bidask.symbol,
            kind: if bidask.is_snapshot {
                MarketDataKind::Snapshot
            } else {
                MarketDataKind::BidAsk
            },
            exch_ts: bidask.source_ts,
            ingest_ts: bidask.local_ts,
            price: 0,
            volume: 0,
            bids_price: bidask.bids.as_slice().iter().map(|l| l.price.as_i64()).collect(),
            bids_vol: bidask.bids.as_slice().iter().map(|l| l.qty.as_i64()).collect(),
            asks_price: bidask.asks.as_slice().iter().map(|l| l.price.as_i64()).collect(),
            asks_vol: bidask.asks.as_slice().iter().map(|l| l.qty.as_i64()).collect(),
            seq_no: bidask.seq,
        },
        MarketEvent::Stats(stats) => MarketDataRow {
            symbol: stats.symbol,
            kind: MarketDataKind::Stats,
            exch_ts: stats.ts,
            ingest_ts: Timebase::global().now(),
            price: stats.mid_x2 / 2,
            volume: 0,
            bids_price: vec![stats.best_bid.as_i64()],
            bids_vol: vec![stats.bid_depth.as_i64()],
            asks_price: vec![stats.best_ask.as_i64()],
            asks_vol: vec![stats.ask_depth.as_i64()],
            seq_no: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::RawKind;
    use common::{SymbolDirectory, Ts};
    use lob::BookViews;

    #[test]
    fn test_stage_pairs_event_with_stats() {
        let dir = SymbolDirectory::empty();
        dir.register("IF2409", "CFFEX", 4, 2000);
        let directory = Arc::new(dir);

        let (raw_tx, raw_rx) = bus::bounded("raw", 64);
        let (rec_tx, rec_rx) = bus::bounded("recorder", 64);
        let ring = Ring::<MarketEvent>::with_capacity(64);
        let mut consumer = ring.subscribe();
        let shutdown = Arc::new(AtomicBool::new(false));

        let stage = MarketDataStage::new(
            raw_rx,
            Normalizer::new(directory),
            lob::LobEngine::new(BookViews::new()),
            ring,
            rec_tx,
            Arc::clone(&shutdown),
            Arc::new(AtomicI64::new(0)),
        );

        raw_tx
            .try_send(RawEnvelope {
                kind: RawKind::Snapshot,
                body: br#"{"symbol":"IF2409","bids":[{"p":100.0,"v":10}],"asks":[{"p":100.1,"v":8}]}"#
                    .to_vec(),
                recv_ts: Ts::from_nanos(1),
            })
            .unwrap();
        shutdown.store(true, Ordering::Release);
        stage.run();

        let mut events = Vec::new();
        consumer.consume_batch(16, &mut events);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], MarketEvent::BidAsk(_)));
        let MarketEvent::Stats(stats) = events[1] else {
            panic!("expected paired stats");
        };
        assert_eq!(stats.spread, 1000);

        // Recorder saw the book row and the stats row
        let mut rows = Vec::new();
        rec_rx.drain_into(16, &mut rows);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_stage_suppresses_stats_for_crossed_book() {
        let dir = SymbolDirectory::empty();
        dir.register("IF2409", "CFFEX", 4, 2000);
        let directory = Arc::new(dir);

        let (raw_tx, raw_rx) = bus::bounded("raw", 64);
        let (rec_tx, _rec_rx) = bus::bounded("recorder", 64);
        let ring = Ring::<MarketEvent>::with_capacity(64);
        let mut consumer = ring.subscribe();
        let shutdown = Arc::new(AtomicBool::new(false));

        let stage = MarketDataStage::new(
            raw_rx,
            Normalizer::new(directory),
            lob::LobEngine::new(BookViews::new()),
            ring,
            rec_tx,
            Arc::clone(&shutdown),
            Arc::new(AtomicI64::new(0)),
        );

        // Crossed: bid 100.2 >= ask 100.1
        raw_tx
            .try_send(RawEnvelope {
                kind: RawKind::Snapshot,
                body: br#"{"symbol":"IF2409","bids":[{"p":100.2,"v":10}],"asks":[{"p":100.1,"v":8}]}"#
                    .to_vec(),
                recv_ts: Ts::from_nanos(1),
            })
            .unwrap();
        shutdown.store(true, Ordering::Release);
        stage.run();

        let mut events = Vec::new();
        consumer.consume_batch(16, &mut events);
        // The book event itself is published; no stats follow it
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], MarketEvent::BidAsk(_)));
    }

    #[test]
    fn test_stage_emits_sampled_latency_spans() {
        let dir = SymbolDirectory::empty();
        dir.register("IF2409", "CFFEX", 4, 2000);
        let directory = Arc::new(dir);

        let (raw_tx, raw_rx) = bus::bounded("raw", 256);
        let (rec_tx, rec_rx) = bus::bounded("recorder", 512);
        let ring = Ring::<MarketEvent>::with_capacity(256);
        let _consumer = ring.subscribe();
        let shutdown = Arc::new(AtomicBool::new(false));

        let stage = MarketDataStage::new(
            raw_rx,
            Normalizer::new(directory),
            lob::LobEngine::new(BookViews::new()),
            ring,
            rec_tx,
            Arc::clone(&shutdown),
            Arc::new(AtomicI64::new(0)),
        );

        // Enough payloads to cross the sampling boundary
        for seq in 0..LATENCY_SAMPLE {
            raw_tx
                .try_send(RawEnvelope {
                    kind: RawKind::Snapshot,
                    body: br#"{"symbol":"IF2409","bids":[{"p":100.0,"v":10}],"asks":[{"p":100.1,"v":8}]}"#
                        .to_vec(),
                    recv_ts: Ts::from_nanos(seq as i64 + 1),
                })
                .unwrap();
        }
        shutdown.store(true, Ordering::Release);
        stage.run();

        let mut rows = Vec::new();
        rec_rx.drain_into(usize::MAX, &mut rows);
        let spans: Vec<_> = rows
            .iter()
            .filter_map(|r| match r {
                RecordEvent::Latency(row) => Some(row),
                _ => None,
            })
            .collect();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].stage, "feed");
        assert!(spans[0].nanos >= 0);
    }
}
