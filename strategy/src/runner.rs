//! Deterministic sequential strategy runner
//!
//! One cooperative worker drains the bus in batches and walks the registered
//! strategies in a stable order. Per-strategy latency is measured on every
//! dispatch; budget overruns and caught panics strike the strategy's
//! breaker.

use crate::breaker::StrategyBreaker;
use crate::context::StrategyContext;
use crate::Strategy;
use bus::{RingConsumer, StageReceiver, StageSender};
use common::config::RunnerConfig;
use common::events::{ExecEvent, IntentType, MarketEvent, OrderIntent, StormFlag};
use common::{ReasonCode, StrategyId, SymbolDirectory, Timebase};
use execution::PositionStore;
use lob::BookViews;
use metrics::{counter, histogram, Counter, Histogram};
use rustc_hash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

struct Entry {
    strategy: Box<dyn Strategy>,
    breaker: StrategyBreaker,
    enabled: bool,
    latency: Histogram,
    intents: Counter,
}

/// The strategy dispatch loop
pub struct StrategyRunner {
    consumer: RingConsumer<MarketEvent>,
    exec_rx: StageReceiver<ExecEvent>,
    intent_tx: StageSender<OrderIntent>,
    books: BookViews,
    positions: Arc<PositionStore>,
    symbols: Arc<SymbolDirectory>,
    storm: Arc<StormFlag>,
    config: RunnerConfig,
    shutdown: Arc<AtomicBool>,
    entries: Vec<Entry>,
    intent_owner: FxHashMap<u64, StrategyId>,
    intent_seq: u64,
    last_intent_id: u64,
}

impl StrategyRunner {
    /// Assemble a runner with no strategies registered
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        consumer: RingConsumer<MarketEvent>,
        exec_rx: StageReceiver<ExecEvent>,
        intent_tx: StageSender<OrderIntent>,
        books: BookViews,
        positions: Arc<PositionStore>,
        symbols: Arc<SymbolDirectory>,
        storm: Arc<StormFlag>,
        config: RunnerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            consumer,
            exec_rx,
            intent_tx,
            books,
            positions,
            symbols,
            storm,
            config,
            shutdown,
            entries: Vec::new(),
            intent_owner: FxHashMap::default(),
            intent_seq: 0,
            last_intent_id: 0,
        }
    }

    /// Register a strategy; dispatch order is registration order
    pub fn register(&mut self, strategy: Box<dyn Strategy>) {
        let name = strategy.name();
        self.entries.push(Entry {
            breaker: StrategyBreaker::new(
                self.config.breaker_degrade_after,
                self.config.breaker_halt_after,
            ),
            enabled: true,
            latency: histogram!("strategy_latency_ns", "strategy" => name),
            intents: counter!("strategy_intents_total", "strategy" => name),
            strategy,
        });
    }

    /// Run until shutdown
    pub fn run(mut self) {
        info!(strategies = self.entries.len(), "strategy runner started");
        let mut events: Vec<MarketEvent> = Vec::with_capacity(self.config.consume_batch);
        let mut execs: Vec<ExecEvent> = Vec::with_capacity(64);

        loop {
            events.clear();
            execs.clear();
            let n = self.consumer.consume_batch(self.config.consume_batch, &mut events);
            self.exec_rx.drain_into(64, &mut execs);

            if n == 0 && execs.is_empty() {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(Duration::from_micros(50));
                continue;
            }

            for event in &events {
                self.dispatch_event(event);
            }
            for exec in &execs {
                self.dispatch_exec(exec);
            }
        }
        info!("strategy runner stopped");
    }

    fn dispatch_event(&mut self, event: &MarketEvent) {
        let positions = self.positions.snapshot();
        let storm = self.storm.get();
        let now = Timebase::global().now();
        let mut out: Vec<OrderIntent> = Vec::new();

        for entry in &mut self.entries {
            if !entry.enabled || !entry.breaker.allows_dispatch() {
                continue;
            }
            let mut ctx = StrategyContext::new(
                &self.books,
                &positions,
                &self.symbols,
                storm,
                entry.strategy.id(),
                now,
                self.config.epoch_bucket_ns,
                &mut self.intent_seq,
                self.config.intent_ttl_ns,
                &mut out,
            );

            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| {
                entry.strategy.on_event(&mut ctx, event);
            }));
            let elapsed = started.elapsed().as_nanos() as i64;
            entry.latency.record(elapsed as f64);

            match result {
                Ok(()) if elapsed > self.config.strategy_budget_ns => {
                    counter!("strategy_budget_overruns_total").increment(1);
                    entry.breaker.on_strike(entry.strategy.name());
                }
                Ok(()) => entry.breaker.on_ok(),
                Err(_) => {
                    counter!("strategy_failures_total").increment(1);
                    warn!(strategy = entry.strategy.name(), "strategy panicked, isolated");
                    entry.breaker.on_strike(entry.strategy.name());
                }
            }
        }

        for intent in out.drain(..) {
            self.forward(intent);
        }
    }

    fn dispatch_exec(&mut self, exec: &ExecEvent) {
        match exec {
            ExecEvent::Fill(fill) => {
                let Some(owner) = fill.intent_id.and_then(|id| self.intent_owner.get(&id)).copied()
                else {
                    return;
                };
                let positions = self.positions.snapshot();
                let storm = self.storm.get();
                let now = Timebase::global().now();
                let mut out: Vec<OrderIntent> = Vec::new();

                if let Some(entry) = self
                    .entries
                    .iter_mut()
                    .find(|e| e.strategy.id() == owner)
                {
                    if !entry.enabled || !entry.breaker.allows_dispatch() {
                        return;
                    }
                    let mut ctx = StrategyContext::new(
                        &self.books,
                        &positions,
                        &self.symbols,
                        storm,
                        owner,
                        now,
                        self.config.epoch_bucket_ns,
                        &mut self.intent_seq,
                        self.config.intent_ttl_ns,
                        &mut out,
                    );
                    if catch_unwind(AssertUnwindSafe(|| {
                        entry.strategy.on_fill(&mut ctx, fill);
                    }))
                    .is_err()
                    {
                        counter!("strategy_failures_total").increment(1);
                        entry.breaker.on_strike(entry.strategy.name());
                    }
                }
                for intent in out.drain(..) {
                    self.forward(intent);
                }
            }
            ExecEvent::Order(order) => {
                if order.status.is_terminal() {
                    if let Some(intent_id) = order.intent_id {
                        self.intent_owner.remove(&intent_id);
                    }
                }
            }
        }
    }

    /// Validate and push to the intent channel; never blocks
    fn forward(&mut self, intent: OrderIntent) {
        if let Err(reason) = self.validate(&intent) {
            counter!("strategy_intent_invalid_total", "reason" => reason.as_str()).increment(1);
            warn!(
                intent_id = intent.intent_id,
                trace_id = intent.trace_id,
                %reason,
                "intent rejected by runner validation"
            );
            return;
        }
        self.last_intent_id = intent.intent_id;
        self.intent_owner.insert(intent.intent_id, intent.strategy);

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.strategy.id() == intent.strategy)
        {
            entry.intents.increment(1);
        }

        if self.intent_tx.try_send(intent).is_err() {
            // Queue full: the send already counted the drop; surface the
            // backpressure to the operator
            warn!("intent channel full, backpressure on strategy runner");
        }
    }

    fn validate(&self, intent: &OrderIntent) -> Result<(), ReasonCode> {
        if self.symbols.meta(intent.symbol).is_none() {
            return Err(ReasonCode::UnknownSymbol);
        }
        if intent.intent_id <= self.last_intent_id {
            return Err(ReasonCode::InvalidIntent);
        }
        match intent.intent_type {
            IntentType::New => {
                if intent.qty.as_i64() <= 0 || !intent.price.is_positive() {
                    return Err(ReasonCode::InvalidIntent);
                }
            }
            IntentType::Amend => {
                if intent.qty.as_i64() <= 0
                    || !intent.price.is_positive()
                    || intent.target_order_id.is_none()
                {
                    return Err(ReasonCode::InvalidIntent);
                }
            }
            IntentType::Cancel => {
                if intent.target_order_id.is_none() {
                    return Err(ReasonCode::InvalidIntent);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::{BidAskEvent, BookLevel, Ladder, StormState, Tif};
    use common::{Px, Qty, Side, Symbol, Ts};

    /// Buys one lot at the bid whenever it sees a book update
    struct OneShotBuyer {
        id: StrategyId,
        fired: bool,
    }

    impl Strategy for OneShotBuyer {
        fn id(&self) -> StrategyId {
            self.id
        }
        fn name(&self) -> &'static str {
            "one_shot_buyer"
        }
        fn on_event(&mut self, ctx: &mut StrategyContext<'_>, event: &MarketEvent) {
            if self.fired {
                return;
            }
            if let MarketEvent::BidAsk(bidask) = event {
                if let Some(best) = bidask.bids.as_slice().first() {
                    ctx.place_order(
                        bidask.symbol,
                        Side::Buy,
                        best.price,
                        1,
                        Tif::Limit,
                        IntentType::New,
                        None,
                    );
                    self.fired = true;
                }
            }
        }
    }

    /// Always panics; must be isolated and eventually halted
    struct Panicker {
        id: StrategyId,
    }

    impl Strategy for Panicker {
        fn id(&self) -> StrategyId {
            self.id
        }
        fn name(&self) -> &'static str {
            "panicker"
        }
        fn on_event(&mut self, _ctx: &mut StrategyContext<'_>, _event: &MarketEvent) {
            panic!("boom");
        }
    }

    fn bidask_event(symbol: Symbol, seq: u64) -> MarketEvent {
        MarketEvent::BidAsk(BidAskEvent {
            symbol,
            bids: [BookLevel::new(Px::from_scaled(1_000_000), Qty::from_i64(10))]
                .into_iter()
                .collect::<Ladder>(),
            asks: [BookLevel::new(Px::from_scaled(1_001_000), Qty::from_i64(8))]
                .into_iter()
                .collect::<Ladder>(),
            is_snapshot: false,
            source_ts: Ts::from_nanos(seq as i64),
            local_ts: Ts::from_nanos(seq as i64),
            seq,
        })
    }

    struct Harness {
        runner: StrategyRunner,
        ring: bus::Ring<MarketEvent>,
        intent_rx: StageReceiver<OrderIntent>,
        shutdown: Arc<AtomicBool>,
        symbol: Symbol,
    }

    fn harness() -> Harness {
        let symbols = SymbolDirectory::empty();
        let symbol = symbols.register("IF2409", "CFFEX", 4, 2000);
        let ring = bus::Ring::<MarketEvent>::with_capacity(256);
        let consumer = ring.subscribe();
        let (_exec_tx, exec_rx) = bus::bounded::<ExecEvent>("exec", 16);
        let (intent_tx, intent_rx) = bus::bounded::<OrderIntent>("intent", 16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let runner = StrategyRunner::new(
            consumer,
            exec_rx,
            intent_tx,
            BookViews::new(),
            Arc::new(PositionStore::new()),
            Arc::new(symbols),
            Arc::new(StormFlag::new(StormState::Normal)),
            RunnerConfig::default(),
            Arc::clone(&shutdown),
        );
        Harness {
            runner,
            ring,
            intent_rx,
            shutdown,
            symbol,
        }
    }

    #[test]
    fn test_runner_emits_validated_intents() {
        let mut h = harness();
        h.runner.register(Box::new(OneShotBuyer {
            id: StrategyId::new(1),
            fired: false,
        }));

        h.ring.publish_nowait(bidask_event(h.symbol, 1));
        h.shutdown.store(true, Ordering::Release);
        h.runner.run();

        let intent = h.intent_rx.try_recv().expect("one intent");
        assert_eq!(intent.strategy, StrategyId::new(1));
        assert_eq!(intent.intent_type, IntentType::New);
        assert_eq!(intent.qty, Qty::from_i64(1));
        assert!(h.intent_rx.try_recv().is_none());
    }

    #[test]
    fn test_panicking_strategy_is_halted_not_fatal() {
        let mut h = harness();
        h.runner.register(Box::new(Panicker {
            id: StrategyId::new(2),
        }));
        h.runner.register(Box::new(OneShotBuyer {
            id: StrategyId::new(1),
            fired: false,
        }));

        // Enough events to walk the panicker through degrade and halt
        for seq in 0..20 {
            h.ring.publish_nowait(bidask_event(h.symbol, seq));
        }
        h.shutdown.store(true, Ordering::Release);
        h.runner.run();

        // The healthy strategy still produced its intent
        assert!(h.intent_rx.try_recv().is_some());
    }

    #[test]
    fn test_deterministic_dispatch_order() {
        // Two identical runs over the same events produce the same intents
        let run = || {
            let mut h = harness();
            h.runner.register(Box::new(OneShotBuyer {
                id: StrategyId::new(1),
                fired: false,
            }));
            h.runner.register(Box::new(OneShotBuyer {
                id: StrategyId::new(2),
                fired: false,
            }));
            for seq in 0..4 {
                h.ring.publish_nowait(bidask_event(h.symbol, seq));
            }
            h.shutdown.store(true, Ordering::Release);
            h.runner.run();

            let mut got = Vec::new();
            while let Some(intent) = h.intent_rx.try_recv() {
                got.push((intent.strategy, intent.intent_type, intent.price, intent.qty));
            }
            got
        };

        assert_eq!(run(), run());
    }
}
