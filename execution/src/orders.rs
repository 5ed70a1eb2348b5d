//! Broker order id to intent attribution

use common::events::OrderStatus;
use common::{Px, Qty, Side, StrategyId, Symbol};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// What we know about an order we sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderAttribution {
    /// Intent that produced the order
    pub intent_id: u64,
    /// Emitting strategy
    pub strategy: StrategyId,
    /// Symbol
    pub symbol: Symbol,
    /// Side
    pub side: Side,
    /// Limit price, scaled
    pub price: Px,
    /// Quantity
    pub qty: Qty,
    /// Last observed status
    pub status: OrderStatus,
}

/// Map from broker order id to attribution
///
/// The adapter registers entries when the broker acks a placement; the
/// execution router reads them to attribute callbacks. Terminal orders are
/// retained until pruned so late fills still attribute.
#[derive(Default)]
pub struct OrderDirectory {
    inner: RwLock<FxHashMap<u64, OrderAttribution>>,
}

impl OrderDirectory {
    /// Empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a broker order id for an intent
    pub fn register(&self, broker_order_id: u64, attribution: OrderAttribution) {
        self.inner.write().insert(broker_order_id, attribution);
    }

    /// Attribution for a broker order id
    #[must_use]
    pub fn get(&self, broker_order_id: u64) -> Option<OrderAttribution> {
        self.inner.read().get(&broker_order_id).copied()
    }

    /// Record a status transition; returns the updated attribution
    pub fn update_status(
        &self,
        broker_order_id: u64,
        status: OrderStatus,
    ) -> Option<OrderAttribution> {
        let mut inner = self.inner.write();
        let entry = inner.get_mut(&broker_order_id)?;
        entry.status = status;
        Some(*entry)
    }

    /// True when the order is known and terminal
    #[must_use]
    pub fn is_terminal(&self, broker_order_id: u64) -> bool {
        self.inner
            .read()
            .get(&broker_order_id)
            .is_some_and(|e| e.status.is_terminal())
    }

    /// Broker ids of orders not yet terminal
    #[must_use]
    pub fn outstanding(&self) -> Vec<u64> {
        self.inner
            .read()
            .iter()
            .filter(|(_, e)| !e.status.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop terminal entries; returns how many were removed
    pub fn prune_terminal(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|_, e| !e.status.is_terminal());
        before - inner.len()
    }

    /// Number of tracked orders
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when no orders are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribution(intent_id: u64) -> OrderAttribution {
        OrderAttribution {
            intent_id,
            strategy: StrategyId::new(1),
            symbol: Symbol::new(2),
            side: Side::Buy,
            price: Px::from_scaled(1_000_000),
            qty: Qty::from_i64(5),
            status: OrderStatus::Submitted,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let directory = OrderDirectory::new();
        directory.register(1001, attribution(7));
        assert_eq!(directory.get(1001).unwrap().intent_id, 7);
        assert!(directory.get(9999).is_none());
    }

    #[test]
    fn test_status_transitions_and_pruning() {
        let directory = OrderDirectory::new();
        directory.register(1001, attribution(7));
        directory.register(1002, attribution(8));

        directory.update_status(1001, OrderStatus::Filled);
        assert!(directory.is_terminal(1001));
        assert!(!directory.is_terminal(1002));
        assert_eq!(directory.outstanding(), vec![1002]);

        assert_eq!(directory.prune_terminal(), 1);
        assert_eq!(directory.len(), 1);
    }
}
