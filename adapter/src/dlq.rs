//! Dead-letter queue
//!
//! Bounded, in-memory. Commands land here when the broker keeps refusing
//! them or the breaker blocks them; the CLI exposes the contents for
//! operator inspection.

use common::events::OrderCommand;
use common::{ReasonCode, Ts};
use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A parked command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The command that could not be dispatched
    pub command: OrderCommand,
    /// Why it ended up here
    pub reason: ReasonCode,
    /// When it was parked
    pub parked_at: Ts,
}

/// Bounded dead-letter queue; oldest entries are evicted on overflow
pub struct DeadLetterQueue {
    inner: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterQueue {
    /// Create a queue bounded at `capacity`
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    /// Park a command
    pub fn push(&self, command: OrderCommand, reason: ReasonCode, now: Ts) {
        let mut queue = self.inner.lock();
        if queue.len() == self.capacity {
            queue.pop_front();
            metrics::counter!("dlq_evicted_total").increment(1);
        }
        queue.push_back(DeadLetter {
            command,
            reason,
            parked_at: now,
        });
        gauge!("dlq_depth").set(queue.len() as f64);
    }

    /// Copy of the current contents, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<DeadLetter> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Entries currently parked
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is parked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::{
        IdempotencyKey, IntentType, OrderIntent, StormState, Tif,
    };
    use common::{Px, Qty, Side, StrategyId, Symbol};

    fn command(id: u64) -> OrderCommand {
        OrderCommand {
            intent: OrderIntent {
                intent_id: id,
                strategy: StrategyId::new(1),
                symbol: Symbol::new(1),
                intent_type: IntentType::New,
                side: Side::Buy,
                price: Px::from_scaled(1_000_000),
                qty: Qty::from_i64(1),
                tif: Tif::Limit,
                target_order_id: None,
                idempotency_key: IdempotencyKey([0; 16]),
                ttl_ns: 0,
                trace_id: 0,
                created: Ts::from_nanos(0),
            },
            deadline: Ts::from_nanos(0),
            storm_state: StormState::Normal,
        }
    }

    #[test]
    fn test_bounded_eviction() {
        let dlq = DeadLetterQueue::new(2);
        dlq.push(command(1), ReasonCode::BrokerReject, Ts::from_nanos(1));
        dlq.push(command(2), ReasonCode::BrokerReject, Ts::from_nanos(2));
        dlq.push(command(3), ReasonCode::CircuitOpen, Ts::from_nanos(3));

        let entries = dlq.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command.intent.intent_id, 2);
        assert_eq!(entries[1].command.intent.intent_id, 3);
        assert_eq!(entries[1].reason, ReasonCode::CircuitOpen);
    }
}
