//! The serialized dispatch loop
//!
//! Single consumer of the intent channel. Seven steps, CPU-only, in a fixed
//! order: dedup reserve, policy gate, exposure check-and-update, risk
//! validators, command materialization, dedup commit, non-blocking dispatch.
//! Nothing in here awaits; dispatch latency stays deterministic.

use crate::dedup::{Decision, IdempotencyStore};
use crate::exposure::{ExposureKey, ExposureStore};
use crate::policy::StormGuard;
use crate::risk::{RiskEngine, RiskVerdict};
use bus::{StageReceiver, StageSender};
use common::config::GatewayConfig;
use common::events::{
    IntentType, LatencySpanRow, OrderCommand, OrderIntent, OrderRow, OrderStatus, RecordEvent,
    RiskLogRow, StormState,
};
use common::{AccountId, ReasonCode, Timebase, Ts};
use execution::PositionStore;
use metrics::{counter, histogram};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One dispatch in this many feeds the `latency_spans` topic
const LATENCY_SAMPLE: u64 = 32;

/// An exposure delta applied at step 3, undone when a later step rejects
struct AppliedExposure {
    key: ExposureKey,
    signed_qty: i64,
    signed_notional: i64,
}

/// The gateway service
pub struct Gateway {
    intent_rx: StageReceiver<OrderIntent>,
    order_tx: StageSender<OrderCommand>,
    recorder_tx: StageSender<RecordEvent>,
    dedup: IdempotencyStore,
    dedup_path: PathBuf,
    exposure: Arc<ExposureStore>,
    risk: RiskEngine,
    guard: StormGuard,
    positions: Arc<PositionStore>,
    config: GatewayConfig,
    account: AccountId,
    feed_pulse: Arc<AtomicI64>,
    adapter_pressure: Arc<AtomicBool>,
    kill_switch: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    dispatched: u64,
}

impl Gateway {
    /// Assemble the gateway, restoring the persisted idempotency window
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        intent_rx: StageReceiver<OrderIntent>,
        order_tx: StageSender<OrderCommand>,
        recorder_tx: StageSender<RecordEvent>,
        exposure: Arc<ExposureStore>,
        risk: RiskEngine,
        guard: StormGuard,
        positions: Arc<PositionStore>,
        config: GatewayConfig,
        account: AccountId,
        feed_pulse: Arc<AtomicI64>,
        adapter_pressure: Arc<AtomicBool>,
        kill_switch: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let now = Timebase::global().now();
        let dedup = IdempotencyStore::load(
            &config.dedup_path,
            config.dedup_capacity,
            config.dedup_ttl_ns,
            now,
        );
        let dedup_path = config.dedup_path.clone();
        Self {
            intent_rx,
            order_tx,
            recorder_tx,
            dedup,
            dedup_path,
            exposure,
            risk,
            guard,
            positions,
            config,
            account,
            feed_pulse,
            adapter_pressure,
            kill_switch,
            shutdown,
            dispatched: 0,
        }
    }

    /// Run until shutdown; persists the idempotency window on the way out
    pub fn run(mut self) {
        info!("gateway started");
        self.housekeeping();
        let mut last_tick = Instant::now();

        loop {
            match self.intent_rx.recv_timeout(Duration::from_millis(1)) {
                Some(intent) => self.process(&intent),
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
            if last_tick.elapsed() >= Duration::from_millis(100) {
                self.housekeeping();
                last_tick = Instant::now();
            }
        }
        while let Some(intent) = self.intent_rx.try_recv() {
            self.process(&intent);
        }

        if let Err(e) = self.dedup.persist(&self.dedup_path) {
            error!(error = %e, "idempotency window persist failed");
        }
        info!("gateway stopped");
    }

    fn housekeeping(&mut self) {
        let now = Timebase::global().now();
        if self.kill_switch.load(Ordering::Acquire) && self.guard.state() != StormState::Halt {
            self.guard.operator_halt();
        }
        self.guard.on_pnl(self.positions.total_realized_pnl());
        let pulse = self.feed_pulse.load(Ordering::Acquire);
        if pulse > 0 {
            self.guard.heartbeat(Ts::from_nanos(pulse));
        }
        self.guard.tick(now);
    }

    /// The seven steps; any uncaught failure drops the envelope, never the loop
    fn process(&mut self, intent: &OrderIntent) {
        let started = Instant::now();
        let now = Timebase::global().now();
        let key = intent.idempotency_key;

        // 1. Dedup check/reserve: a replay returns the cached decision
        //    without re-processing
        if let Some(prior) = self.dedup.lookup(&key, now) {
            counter!("gateway_dedup_hits_total").increment(1);
            debug!(
                intent_id = intent.intent_id,
                trace_id = intent.trace_id,
                decision = ?prior,
                "dedup replay"
            );
            return;
        }
        self.dedup.reserve(key, now);

        // 2. Policy gate
        if let Err(reason) = self.guard.allows(intent.intent_type) {
            self.reject(intent, reason, 0, 0, now, None);
            return;
        }
        if self.guard.state() == StormState::Degraded && intent.intent_type == IntentType::New {
            let throttle = self.guard.throttled_max_qty(self.config.degraded_qty_divisor);
            if intent.qty.as_i64() > throttle {
                self.reject(
                    intent,
                    ReasonCode::PolicyThrottle,
                    throttle,
                    intent.qty.as_i64(),
                    now,
                    None,
                );
                return;
            }
        }

        // 3. Exposure check-and-update, atomic per leaf
        let mut applied = None;
        if intent.intent_type == IntentType::New {
            let exposure_key = (self.account, intent.strategy, intent.symbol);
            let signed_qty = intent.signed_qty();
            let signed_notional = intent
                .price
                .as_i64()
                .saturating_mul(intent.qty.as_i64())
                .saturating_mul(intent.side.sign());
            match self.exposure.try_apply(exposure_key, signed_qty, signed_notional) {
                Ok(_) => {
                    applied = Some(AppliedExposure {
                        key: exposure_key,
                        signed_qty,
                        signed_notional,
                    });
                }
                Err(e) => {
                    let (threshold, value) = e.audit_pair();
                    self.reject(intent, e.reason(), threshold, value, now, None);
                    return;
                }
            }
        }

        // 4. Risk validators
        match self.risk.evaluate(intent, now) {
            RiskVerdict::Reject(v) => {
                self.reject(intent, v.reason, v.threshold, v.value, now, applied);
                return;
            }
            RiskVerdict::PassDegraded => self.guard.set_rate_pressure(true),
            RiskVerdict::Pass => {
                // Adapter-side soft-cap proximity keeps the pressure on even
                // when the strategy-side rate is fine
                let adapter = self.adapter_pressure.load(Ordering::Acquire);
                self.guard.set_rate_pressure(adapter);
            }
        }

        // 5. Materialize the command
        let deadline_ns = if intent.ttl_ns > 0 {
            self.config.command_deadline_ns.min(intent.ttl_ns)
        } else {
            self.config.command_deadline_ns
        };
        let command = OrderCommand {
            intent: *intent,
            deadline: Ts::from_nanos(now.as_nanos() + deadline_ns),
            storm_state: self.guard.state(),
        };

        // 6. Commit the decision before dispatch so a replay observed
        //    mid-flight still resolves
        self.dedup.commit(key, Decision::Approved, now);

        // 7. Non-blocking dispatch; a full order queue rejects rather than
        //    leaving the key approved with nothing in flight
        if self.order_tx.try_send(command).is_err() {
            if let Some(applied) = applied {
                self.exposure
                    .revert(applied.key, applied.signed_qty, applied.signed_notional);
            }
            self.dedup
                .commit(key, Decision::Rejected(ReasonCode::QueueFull), now);
            counter!("gateway_reject_total", "reason" => ReasonCode::QueueFull.as_str())
                .increment(1);
            self.guard.on_decision(true);
            warn!(intent_id = intent.intent_id, "order queue full, intent rejected");
            return;
        }

        self.guard.on_decision(false);
        let elapsed = started.elapsed();
        histogram!("gateway_dispatch_latency_ns").record(elapsed.as_nanos() as f64);
        self.dispatched += 1;
        if self.dispatched % LATENCY_SAMPLE == 0 {
            let _ = self.recorder_tx.try_send(RecordEvent::Latency(LatencySpanRow {
                ts: now,
                stage: "gateway".to_string(),
                nanos: elapsed.as_nanos() as i64,
            }));
        }

        let _ = self.recorder_tx.try_send(RecordEvent::Order(OrderRow {
            order_id: intent.intent_id,
            strategy: intent.strategy,
            symbol: intent.symbol,
            side: intent.side,
            price: intent.price.as_i64(),
            qty: intent.qty.as_i64(),
            status: OrderStatus::Pending,
            ingest_ts: now,
            latency_us: elapsed.as_micros() as i64,
            event_seq: 0,
        }));
    }

    fn reject(
        &mut self,
        intent: &OrderIntent,
        reason: ReasonCode,
        threshold: i64,
        value: i64,
        now: Ts,
        applied: Option<AppliedExposure>,
    ) {
        if let Some(applied) = applied {
            self.exposure
                .revert(applied.key, applied.signed_qty, applied.signed_notional);
        }
        self.dedup.commit(intent.idempotency_key, Decision::Rejected(reason), now);
        counter!("gateway_reject_total", "reason" => reason.as_str()).increment(1);
        self.guard.on_decision(true);

        // Every rejection is an audit row
        let _ = self.recorder_tx.try_send(RecordEvent::Risk(RiskLogRow {
            ts: now,
            strategy: intent.strategy,
            symbol: intent.symbol,
            intent_id: intent.intent_id,
            reason,
            threshold,
            value,
        }));
        debug!(
            intent_id = intent.intent_id,
            trace_id = intent.trace_id,
            %reason,
            threshold,
            value,
            "intent rejected"
        );
    }
}
