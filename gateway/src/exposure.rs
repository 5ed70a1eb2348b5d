//! Exposure accounting
//!
//! Nested integer map keyed (account, strategy, symbol). Check-and-update is
//! atomic under one short lock: the new totals are computed, compared to the
//! caps, and either committed or abandoned in a single critical section.
//! Leaf cardinality is bounded; zero-balance leaves are evicted to make room.

use common::config::ExposureConfig;
use common::{AccountId, ReasonCode, StrategyId, Symbol};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::warn;

/// Exposure leaf key
pub type ExposureKey = (AccountId, StrategyId, Symbol);

/// One exposure leaf
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExposureEntry {
    /// Signed pending-plus-live quantity
    pub net_qty: i64,
    /// Signed notional, scaled
    pub notional: i64,
}

impl ExposureEntry {
    /// True when the leaf holds no exposure and can be evicted
    #[must_use]
    pub const fn is_flat(&self) -> bool {
        self.net_qty == 0
    }
}

/// Cap breach or store exhaustion
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExposureError {
    /// A per-leaf cap would be exceeded
    #[error("exposure cap breached for {account}/{strategy}/{symbol}: |{value}| > {threshold}")]
    CapBreached {
        /// Account
        account: AccountId,
        /// Strategy
        strategy: StrategyId,
        /// Symbol
        symbol: Symbol,
        /// Cap that was evaluated
        threshold: i64,
        /// Value that breached it
        value: i64,
    },
    /// Store is at max_symbols and no zero-balance leaf could be evicted
    #[error("exposure store full for {account}/{strategy}/{symbol}: {leaves} leaves")]
    StoreFull {
        /// Account
        account: AccountId,
        /// Strategy
        strategy: StrategyId,
        /// Symbol
        symbol: Symbol,
        /// Current leaf count
        leaves: usize,
    },
}

impl ExposureError {
    /// Reason code for metrics and audit
    #[must_use]
    pub const fn reason(&self) -> ReasonCode {
        ReasonCode::ExposureCap
    }

    /// (threshold, value) pair for the audit row
    #[must_use]
    pub const fn audit_pair(&self) -> (i64, i64) {
        match self {
            Self::CapBreached {
                threshold, value, ..
            } => (*threshold, *value),
            Self::StoreFull { leaves, .. } => (0, *leaves as i64),
        }
    }
}

/// Bounded exposure store
pub struct ExposureStore {
    inner: Mutex<FxHashMap<ExposureKey, ExposureEntry>>,
    config: ExposureConfig,
}

impl ExposureStore {
    /// Create a store with the given caps
    #[must_use]
    pub fn new(config: ExposureConfig) -> Self {
        Self {
            inner: Mutex::new(FxHashMap::default()),
            config,
        }
    }

    /// Atomically apply `(signed_qty, signed_notional)` to a leaf
    ///
    /// The cap is inclusive: landing exactly on it is accepted, one past it
    /// is rejected. On rejection the leaf is unchanged.
    pub fn try_apply(
        &self,
        key: ExposureKey,
        signed_qty: i64,
        signed_notional: i64,
    ) -> Result<ExposureEntry, ExposureError> {
        let (account, strategy, symbol) = key;
        let mut map = self.inner.lock();

        if !map.contains_key(&key) && map.len() >= self.config.max_symbols {
            // Evict one flat leaf to make room
            let flat = map.iter().find(|(_, e)| e.is_flat()).map(|(k, _)| *k);
            match flat {
                Some(victim) => {
                    map.remove(&victim);
                }
                None => {
                    warn!(%account, %strategy, %symbol, leaves = map.len(), "exposure store full");
                    return Err(ExposureError::StoreFull {
                        account,
                        strategy,
                        symbol,
                        leaves: map.len(),
                    });
                }
            }
        }

        let entry = map.entry(key).or_default();
        let new_qty = entry.net_qty + signed_qty;
        let new_notional = entry.notional + signed_notional;

        if new_qty.abs() > self.config.max_net_qty {
            return Err(ExposureError::CapBreached {
                account,
                strategy,
                symbol,
                threshold: self.config.max_net_qty,
                value: new_qty,
            });
        }
        if new_notional.abs() > self.config.max_notional {
            return Err(ExposureError::CapBreached {
                account,
                strategy,
                symbol,
                threshold: self.config.max_notional,
                value: new_notional,
            });
        }

        entry.net_qty = new_qty;
        entry.notional = new_notional;
        Ok(*entry)
    }

    /// Undo a previously applied delta (risk reject after exposure commit,
    /// dispatch-queue overflow)
    pub fn revert(&self, key: ExposureKey, signed_qty: i64, signed_notional: i64) {
        let mut map = self.inner.lock();
        if let Some(entry) = map.get_mut(&key) {
            entry.net_qty -= signed_qty;
            entry.notional -= signed_notional;
        }
    }

    /// Current leaf value
    #[must_use]
    pub fn get(&self, key: &ExposureKey) -> Option<ExposureEntry> {
        self.inner.lock().get(key).copied()
    }

    /// Number of leaves
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no leaves exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_symbols: usize, max_net_qty: i64) -> ExposureConfig {
        ExposureConfig {
            max_symbols,
            max_net_qty,
            max_notional: 1_000_000_000,
        }
    }

    fn key(symbol: u32) -> ExposureKey {
        (AccountId::new(1), StrategyId::new(1), Symbol::new(symbol))
    }

    #[test]
    fn test_cap_exactly_reached_accepted_cap_plus_one_rejected() {
        let store = ExposureStore::new(config(10, 100));

        let entry = store.try_apply(key(1), 100, 100).unwrap();
        assert_eq!(entry.net_qty, 100);

        let err = store.try_apply(key(1), 1, 1).unwrap_err();
        assert!(matches!(
            err,
            ExposureError::CapBreached {
                threshold: 100,
                value: 101,
                ..
            }
        ));
        // Rejected apply leaves the entry untouched
        assert_eq!(store.get(&key(1)).unwrap().net_qty, 100);
    }

    #[test]
    fn test_short_side_cap() {
        let store = ExposureStore::new(config(10, 50));
        store.try_apply(key(1), -50, -50).unwrap();
        assert!(store.try_apply(key(1), -1, -1).is_err());
        // Reducing exposure is always fine
        store.try_apply(key(1), 10, 10).unwrap();
    }

    #[test]
    fn test_store_full_with_flat_leaf_evicts() {
        let store = ExposureStore::new(config(2, 100));
        store.try_apply(key(1), 10, 10).unwrap();
        store.try_apply(key(2), 10, 10).unwrap();

        // Flatten leaf 1, then a third symbol fits by evicting it
        store.try_apply(key(1), -10, -10).unwrap();
        store.try_apply(key(3), 5, 5).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get(&key(1)).is_none());
    }

    #[test]
    fn test_store_full_without_candidates_errors() {
        let store = ExposureStore::new(config(2, 100));
        store.try_apply(key(1), 10, 10).unwrap();
        store.try_apply(key(2), 10, 10).unwrap();

        let err = store.try_apply(key(3), 5, 5).unwrap_err();
        assert!(matches!(err, ExposureError::StoreFull { leaves: 2, .. }));
    }

    #[test]
    fn test_revert_restores_leaf() {
        let store = ExposureStore::new(config(10, 100));
        store.try_apply(key(1), 40, 400).unwrap();
        store.revert(key(1), 40, 400);
        assert!(store.get(&key(1)).unwrap().is_flat());
    }
}
