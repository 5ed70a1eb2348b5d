//! Startup reconciliation against a broker snapshot
//!
//! The decision plane stays disabled until the local position book and the
//! outstanding-order map agree with what the broker reports.

use crate::orders::{OrderAttribution, OrderDirectory};
use crate::positions::{PositionBook, PositionEntry, PositionStore};
use common::{StrategyId, Symbol};
use metrics::counter;
use tracing::{info, warn};

/// Source of broker-side truth
///
/// Startup reconciliation always pulls one snapshot; at runtime, callback
/// heartbeat loss triggers a targeted re-poll through the same interface.
/// Connectors implement this next to their `BrokerClient`.
pub trait SnapshotSource: Send {
    /// Fetch the broker's current positions and open orders
    fn fetch(&mut self) -> anyhow::Result<BrokerSnapshot>;
}

/// What the broker reports at startup
#[derive(Debug, Clone, Default)]
pub struct BrokerSnapshot {
    /// Positions keyed by (strategy, symbol)
    pub positions: Vec<(StrategyId, Symbol, PositionEntry)>,
    /// Orders still working at the broker
    pub open_orders: Vec<(u64, OrderAttribution)>,
}

/// One local/broker disagreement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Strategy
    pub strategy: StrategyId,
    /// Symbol
    pub symbol: Symbol,
    /// Net quantity we held locally
    pub local_net: i64,
    /// Net quantity the broker reports
    pub broker_net: i64,
}

/// Reconciliation outcome
#[derive(Debug, Clone, Default)]
pub struct ReconReport {
    /// Positions adopted from the broker
    pub positions_adopted: usize,
    /// Orders adopted into the directory
    pub orders_adopted: usize,
    /// Disagreements with prior local state
    pub divergences: Vec<Divergence>,
}

impl ReconReport {
    /// True when local state matched the broker everywhere
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty()
    }
}

/// Rebuild local state from the broker snapshot, flagging divergence
///
/// The broker is authoritative: its numbers are adopted even when they
/// diverge, and the divergence is surfaced for the operator.
pub fn reconcile(
    positions: &PositionStore,
    directory: &OrderDirectory,
    snapshot: &BrokerSnapshot,
) -> ReconReport {
    let mut report = ReconReport::default();
    let local = positions.snapshot();

    let mut book = PositionBook::default();
    for (strategy, symbol, entry) in &snapshot.positions {
        let local_net = local.get(&(*strategy, *symbol)).map_or(0, |e| e.net_qty);
        if local_net != entry.net_qty {
            report.divergences.push(Divergence {
                strategy: *strategy,
                symbol: *symbol,
                local_net,
                broker_net: entry.net_qty,
            });
        }
        book.insert((*strategy, *symbol), *entry);
    }
    // Positions we hold locally that the broker does not know are divergences too
    for ((strategy, symbol), entry) in local.iter() {
        if entry.net_qty != 0
            && !snapshot
                .positions
                .iter()
                .any(|(s, sym, _)| s == strategy && sym == symbol)
        {
            report.divergences.push(Divergence {
                strategy: *strategy,
                symbol: *symbol,
                local_net: entry.net_qty,
                broker_net: 0,
            });
        }
    }

    report.positions_adopted = book.len();
    positions.rebuild(book);

    for (broker_order_id, attribution) in &snapshot.open_orders {
        directory.register(*broker_order_id, *attribution);
        report.orders_adopted += 1;
    }

    if report.is_clean() {
        info!(
            positions = report.positions_adopted,
            orders = report.orders_adopted,
            "reconciliation clean"
        );
    } else {
        counter!("reconciliation_divergence_total").increment(report.divergences.len() as u64);
        for d in &report.divergences {
            warn!(
                strategy = %d.strategy, symbol = %d.symbol,
                local = d.local_net, broker = d.broker_net,
                "position divergence, broker adopted"
            );
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::OrderStatus;
    use common::{Px, Qty, Side, Ts};

    #[test]
    fn test_clean_reconcile_adopts_broker_state() {
        let positions = PositionStore::new();
        let directory = OrderDirectory::new();

        let snapshot = BrokerSnapshot {
            positions: vec![(
                StrategyId::new(1),
                Symbol::new(2),
                PositionEntry {
                    net_qty: 10,
                    avg_price: 1_000_000,
                    realized_pnl: 0,
                    fees: 0,
                },
            )],
            open_orders: vec![(
                5001,
                OrderAttribution {
                    intent_id: 1,
                    strategy: StrategyId::new(1),
                    symbol: Symbol::new(2),
                    side: Side::Buy,
                    price: Px::from_scaled(1_000_000),
                    qty: Qty::from_i64(5),
                    status: OrderStatus::Submitted,
                },
            )],
        };

        let report = reconcile(&positions, &directory, &snapshot);
        assert!(report.is_clean());
        assert_eq!(positions.net_qty(StrategyId::new(1), Symbol::new(2)), 10);
        assert_eq!(directory.outstanding(), vec![5001]);
    }

    #[test]
    fn test_divergence_flagged_and_broker_adopted() {
        let positions = PositionStore::new();
        positions.apply_fill(
            StrategyId::new(1),
            Symbol::new(2),
            Side::Buy,
            Px::from_scaled(1_000_000),
            Qty::from_i64(3),
            0,
            Ts::from_nanos(0),
        );
        let directory = OrderDirectory::new();

        let snapshot = BrokerSnapshot {
            positions: vec![(
                StrategyId::new(1),
                Symbol::new(2),
                PositionEntry {
                    net_qty: 5,
                    avg_price: 1_000_000,
                    realized_pnl: 0,
                    fees: 0,
                },
            )],
            open_orders: Vec::new(),
        };

        let report = reconcile(&positions, &directory, &snapshot);
        assert_eq!(report.divergences.len(), 1);
        assert_eq!(report.divergences[0].local_net, 3);
        assert_eq!(report.divergences[0].broker_net, 5);
        assert_eq!(positions.net_qty(StrategyId::new(1), Symbol::new(2)), 5);
    }

    #[test]
    fn test_local_only_position_is_divergence() {
        let positions = PositionStore::new();
        positions.apply_fill(
            StrategyId::new(1),
            Symbol::new(9),
            Side::Sell,
            Px::from_scaled(1_000_000),
            Qty::from_i64(2),
            0,
            Ts::from_nanos(0),
        );
        let directory = OrderDirectory::new();

        let report = reconcile(&positions, &directory, &BrokerSnapshot::default());
        assert_eq!(report.divergences.len(), 1);
        assert_eq!(report.divergences[0].broker_net, 0);
        // Broker is authoritative: local phantom position is gone
        assert_eq!(positions.net_qty(StrategyId::new(1), Symbol::new(9)), 0);
    }
}
