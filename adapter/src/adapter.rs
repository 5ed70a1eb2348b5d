//! The order adapter loop

use crate::breaker::CircuitBreaker;
use crate::dlq::DeadLetterQueue;
use crate::rate::{AcquireOutcome, SlidingWindowLimiter};
use bus::StageReceiver;
use common::config::AdapterConfig;
use common::events::{IntentType, OrderCommand, OrderStatus};
use common::{Px, Qty, ReasonCode, Timebase, Ts};
use execution::{OrderAttribution, OrderDirectory};
use metrics::counter;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Broker call failure
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker refused the action
    #[error("broker rejected: {0}")]
    Rejected(String),
    /// The broker could not be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Facade over the broker SDK's order entry surface
///
/// Implementations are opaque to the core; the sim broker and the live
/// connector both live behind this.
pub trait BrokerClient: Send {
    /// Place a new order; returns the broker order id
    fn place_order(&mut self, command: &OrderCommand) -> Result<u64, BrokerError>;
    /// Amend a resting order
    fn amend_order(&mut self, broker_order_id: u64, price: Px, qty: Qty)
    -> Result<(), BrokerError>;
    /// Cancel a resting order
    fn cancel_order(&mut self, broker_order_id: u64) -> Result<(), BrokerError>;
}

const PLACE_ATTEMPTS: u32 = 3;

/// The adapter stage
pub struct OrderAdapter {
    order_rx: StageReceiver<OrderCommand>,
    broker: Box<dyn BrokerClient>,
    directory: Arc<OrderDirectory>,
    limiter: SlidingWindowLimiter,
    breaker: CircuitBreaker,
    dlq: Arc<DeadLetterQueue>,
    /// Soft-cap proximity, read by the gateway
    pressure: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    /// Broker ids with an action sent and no callback observed since
    unacked: FxHashMap<u64, OrderStatus>,
    /// Latest coalesced AMEND per broker id, waiting for the ack barrier
    pending_amends: FxHashMap<u64, OrderCommand>,
}

impl OrderAdapter {
    /// Assemble the adapter
    #[must_use]
    pub fn new(
        order_rx: StageReceiver<OrderCommand>,
        broker: Box<dyn BrokerClient>,
        directory: Arc<OrderDirectory>,
        config: &AdapterConfig,
        dlq: Arc<DeadLetterQueue>,
        pressure: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            order_rx,
            broker,
            directory,
            limiter: SlidingWindowLimiter::new(
                config.rate_window_ns,
                config.rate_soft,
                config.rate_hard,
            ),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_timeout_ms),
            dlq,
            pressure,
            shutdown,
            unacked: FxHashMap::default(),
            pending_amends: FxHashMap::default(),
        }
    }

    /// Consume the order queue until shutdown, then drain
    pub fn run(mut self) {
        info!("order adapter started");
        loop {
            match self.order_rx.recv_timeout(Duration::from_millis(1)) {
                Some(command) => self.process(command),
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
            self.poll_acks();
        }
        while let Some(command) = self.order_rx.try_recv() {
            self.process(command);
        }
        self.poll_acks();
        info!("order adapter stopped");
    }

    /// Handle one approved command
    pub fn process(&mut self, command: OrderCommand) {
        let now = Timebase::global().now();
        if now > command.deadline {
            counter!("order_reject_total").increment(1);
            counter!("order_expired_total").increment(1);
            warn!(
                intent_id = command.intent.intent_id,
                deadline = %command.deadline,
                "command expired before dispatch"
            );
            return;
        }

        match command.intent.intent_type {
            IntentType::New => self.place(command, now),
            IntentType::Amend => self.amend(command, now),
            IntentType::Cancel => self.cancel(command, now),
        }
    }

    /// Observe broker acks: a status change on an unacked order is the
    /// barrier that releases its coalesced AMEND
    pub fn poll_acks(&mut self) {
        let acked: Vec<u64> = self
            .unacked
            .iter()
            .filter_map(|(id, sent_status)| {
                let current = self.directory.get(*id)?.status;
                (current != *sent_status).then_some(*id)
            })
            .collect();

        for broker_order_id in acked {
            self.unacked.remove(&broker_order_id);
            if let Some(pending) = self.pending_amends.remove(&broker_order_id) {
                let now = Timebase::global().now();
                if now > pending.deadline {
                    counter!("order_expired_total").increment(1);
                    continue;
                }
                self.amend(pending, now);
            }
        }
    }

    fn place(&mut self, command: OrderCommand, now: Ts) {
        if !self.breaker.allows_action() {
            counter!("order_reject_total").increment(1);
            self.dlq.push(command, ReasonCode::CircuitOpen, now);
            return;
        }
        if !self.acquire_slot(command.deadline) {
            counter!("order_expired_total").increment(1);
            return;
        }

        for attempt in 1..=PLACE_ATTEMPTS {
            match self.broker.place_order(&command) {
                Ok(broker_order_id) => {
                    self.breaker.record_success();
                    self.directory.register(
                        broker_order_id,
                        OrderAttribution {
                            intent_id: command.intent.intent_id,
                            strategy: command.intent.strategy,
                            symbol: command.intent.symbol,
                            side: command.intent.side,
                            price: command.intent.price,
                            qty: command.intent.qty,
                            status: OrderStatus::Pending,
                        },
                    );
                    self.unacked.insert(broker_order_id, OrderStatus::Pending);
                    counter!("order_actions_total", "type" => "place").increment(1);
                    return;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(
                        intent_id = command.intent.intent_id,
                        attempt,
                        error = %e,
                        "place failed"
                    );
                    if !self.breaker.allows_action() {
                        break;
                    }
                }
            }
        }
        counter!("order_reject_total").increment(1);
        self.dlq.push(command, ReasonCode::DeadLetter, now);
    }

    fn amend(&mut self, command: OrderCommand, now: Ts) {
        let Some(target) = command.intent.target_order_id else {
            counter!("order_reject_total").increment(1);
            return;
        };
        if self.directory.is_terminal(target) {
            counter!("order_suppressed_total").increment(1);
            return;
        }
        // Coalesce while the previous action on this order is unacked; only
        // the latest parameters survive
        if self.unacked.contains_key(&target) {
            if self.pending_amends.insert(target, command).is_some() {
                counter!("order_coalesced_total").increment(1);
            }
            return;
        }
        if !self.breaker.allows_action() {
            counter!("order_reject_total").increment(1);
            self.dlq.push(command, ReasonCode::CircuitOpen, now);
            return;
        }
        if !self.acquire_slot(command.deadline) {
            counter!("order_expired_total").increment(1);
            return;
        }

        match self
            .broker
            .amend_order(target, command.intent.price, command.intent.qty)
        {
            Ok(()) => {
                self.breaker.record_success();
                let sent_status = self
                    .directory
                    .get(target)
                    .map_or(OrderStatus::Submitted, |a| a.status);
                self.unacked.insert(target, sent_status);
                counter!("order_actions_total", "type" => "amend").increment(1);
            }
            Err(e) => {
                self.breaker.record_failure();
                counter!("order_reject_total").increment(1);
                warn!(target, error = %e, "amend failed");
                self.dlq.push(command, ReasonCode::BrokerReject, now);
            }
        }
    }

    fn cancel(&mut self, command: OrderCommand, now: Ts) {
        let Some(target) = command.intent.target_order_id else {
            counter!("order_reject_total").increment(1);
            return;
        };
        if self.directory.is_terminal(target) {
            counter!("order_suppressed_total").increment(1);
            return;
        }
        // Cancels pass an open breaker but still respect the broker budget
        if !self.acquire_slot(command.deadline) {
            counter!("order_expired_total").increment(1);
            return;
        }

        match self.broker.cancel_order(target) {
            Ok(()) => {
                self.breaker.record_success();
                // A pending amend on a cancelled order is moot
                self.pending_amends.remove(&target);
                counter!("order_actions_total", "type" => "cancel").increment(1);
            }
            Err(e) => {
                self.breaker.record_failure();
                counter!("order_reject_total").increment(1);
                warn!(target, error = %e, "cancel failed");
                self.dlq.push(command, ReasonCode::BrokerReject, now);
            }
        }
    }

    /// Block inside the adapter (never upstream) until the window grants a
    /// slot or the command's deadline passes
    fn acquire_slot(&mut self, deadline: Ts) -> bool {
        loop {
            let now = Timebase::global().now();
            if now > deadline {
                return false;
            }
            match self.limiter.acquire(now) {
                AcquireOutcome::Ready => {
                    self.pressure.store(false, Ordering::Release);
                    return true;
                }
                AcquireOutcome::SoftReady => {
                    self.pressure.store(true, Ordering::Release);
                    return true;
                }
                AcquireOutcome::NotReady { retry_after_ns } => {
                    self.pressure.store(true, Ordering::Release);
                    let nap = Duration::from_nanos(retry_after_ns.clamp(1, 1_000_000) as u64);
                    std::thread::sleep(nap);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::{IdempotencyKey, OrderIntent, StormState, Tif};
    use common::{Side, StrategyId, Symbol};
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Place(u64),
        Amend(u64, i64, i64),
        Cancel(u64),
    }

    struct ScriptedBroker {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_places: u32,
        next_id: u64,
    }

    impl BrokerClient for ScriptedBroker {
        fn place_order(&mut self, command: &OrderCommand) -> Result<u64, BrokerError> {
            if self.fail_places > 0 {
                self.fail_places -= 1;
                return Err(BrokerError::Unavailable("down".into()));
            }
            self.next_id += 1;
            self.calls
                .lock()
                .push(Call::Place(command.intent.intent_id));
            Ok(self.next_id)
        }

        fn amend_order(&mut self, id: u64, price: Px, qty: Qty) -> Result<(), BrokerError> {
            self.calls
                .lock()
                .push(Call::Amend(id, price.as_i64(), qty.as_i64()));
            Ok(())
        }

        fn cancel_order(&mut self, id: u64) -> Result<(), BrokerError> {
            self.calls.lock().push(Call::Cancel(id));
            Ok(())
        }
    }

    fn command(intent_type: IntentType, id: u64, target: Option<u64>, price: i64) -> OrderCommand {
        OrderCommand {
            intent: OrderIntent {
                intent_id: id,
                strategy: StrategyId::new(1),
                symbol: Symbol::new(1),
                intent_type,
                side: Side::Buy,
                price: Px::from_scaled(price),
                qty: Qty::from_i64(1),
                tif: Tif::Limit,
                target_order_id: target,
                idempotency_key: IdempotencyKey([id as u8; 16]),
                ttl_ns: 0,
                trace_id: 0,
                created: Ts::from_nanos(0),
            },
            deadline: Ts::from_nanos(i64::MAX),
            storm_state: StormState::Normal,
        }
    }

    fn adapter(
        fail_places: u32,
        config: AdapterConfig,
    ) -> (OrderAdapter, Arc<Mutex<Vec<Call>>>, Arc<OrderDirectory>, Arc<DeadLetterQueue>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let broker = ScriptedBroker {
            calls: Arc::clone(&calls),
            fail_places,
            next_id: 1000,
        };
        let directory = Arc::new(OrderDirectory::new());
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let (_tx, order_rx) = bus::bounded("order", 16);
        let adapter = OrderAdapter::new(
            order_rx,
            Box::new(broker),
            Arc::clone(&directory),
            &config,
            Arc::clone(&dlq),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        );
        (adapter, calls, directory, dlq)
    }

    #[test]
    fn test_place_registers_broker_mapping() {
        let (mut adapter, calls, directory, _dlq) = adapter(0, AdapterConfig::default());
        adapter.process(command(IntentType::New, 7, None, 1_000_000));

        assert_eq!(calls.lock().as_slice(), &[Call::Place(7)]);
        let attribution = directory.get(1001).unwrap();
        assert_eq!(attribution.intent_id, 7);
        assert_eq!(attribution.status, OrderStatus::Pending);
    }

    #[test]
    fn test_expired_command_dropped() {
        let (mut adapter, calls, _directory, _dlq) = adapter(0, AdapterConfig::default());
        let mut cmd = command(IntentType::New, 7, None, 1_000_000);
        cmd.deadline = Ts::from_nanos(1);
        adapter.process(cmd);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_amend_coalescing_with_ack_barrier() {
        let (mut adapter, calls, directory, _dlq) = adapter(0, AdapterConfig::default());

        // Place: broker id 1001, unacked
        adapter.process(command(IntentType::New, 1, None, 1_000_000));
        // Two amends while unacked: only the latest survives
        adapter.process(command(IntentType::Amend, 2, Some(1001), 1_000_100));
        adapter.process(command(IntentType::Amend, 3, Some(1001), 1_000_200));
        assert_eq!(calls.lock().len(), 1);

        // No ack yet: nothing flushes
        adapter.poll_acks();
        assert_eq!(calls.lock().len(), 1);

        // Router observes the broker ack; the barrier releases the coalesced amend
        directory.update_status(1001, OrderStatus::Submitted);
        adapter.poll_acks();

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], Call::Amend(1001, 1_000_200, 1));
    }

    #[test]
    fn test_cancel_suppressed_on_terminal_order() {
        let (mut adapter, calls, directory, _dlq) = adapter(0, AdapterConfig::default());
        adapter.process(command(IntentType::New, 1, None, 1_000_000));
        directory.update_status(1001, OrderStatus::Filled);

        adapter.process(command(IntentType::Cancel, 2, Some(1001), 0));
        // Only the place reached the broker
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn test_breaker_opens_and_dead_letters() {
        let config = AdapterConfig {
            breaker_threshold: 3,
            breaker_timeout_ms: 60_000,
            ..AdapterConfig::default()
        };
        let (mut adapter, calls, _directory, dlq) = adapter(10, config);

        // All attempts fail; breaker opens mid-retry, command parks
        adapter.process(command(IntentType::New, 1, None, 1_000_000));
        assert_eq!(dlq.len(), 1);
        assert!(calls.lock().is_empty());

        // Breaker now open: next NEW parks without a broker call
        adapter.process(command(IntentType::New, 2, None, 1_000_000));
        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.list()[1].reason, ReasonCode::CircuitOpen);

        // CANCEL still passes the open breaker
        adapter.process(command(IntentType::Cancel, 3, Some(424_242), 0));
        assert_eq!(calls.lock().as_slice(), &[Call::Cancel(424_242)]);
    }
}
