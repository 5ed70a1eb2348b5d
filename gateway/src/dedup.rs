//! Idempotency window
//!
//! Fixed-capacity map from intent fingerprint to the decision it received.
//! A replay within TTL returns the cached decision without touching the
//! rest of the pipeline. Persisted on clean shutdown and reloaded at start
//! so restarts do not double-dispatch.

use common::events::IdempotencyKey;
use common::{ReasonCode, Ts};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Final decision recorded for an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Dispatched to the adapter
    Approved,
    /// Refused with a reason
    Rejected(ReasonCode),
}

/// Persistence failure
#[derive(Debug, Error)]
pub enum DedupPersistError {
    /// Filesystem error
    #[error("dedup persistence io: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding error
    #[error("dedup persistence encoding: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Entry {
    decision: Option<Decision>,
    ts: Ts,
}

/// Fixed-capacity idempotency store
pub struct IdempotencyStore {
    map: FxHashMap<IdempotencyKey, Entry>,
    order: VecDeque<(IdempotencyKey, Ts)>,
    capacity: usize,
    ttl_ns: i64,
}

impl IdempotencyStore {
    /// Create an empty window
    #[must_use]
    pub fn new(capacity: usize, ttl_ns: i64) -> Self {
        Self {
            map: FxHashMap::default(),
            order: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            ttl_ns,
        }
    }

    /// Cached decision for `key`, dropping the entry when stale
    ///
    /// A reserved-but-uncommitted entry reads as a hit with no decision;
    /// the single-threaded gateway never observes that state across calls
    /// unless a prior dispatch crashed mid-pipeline.
    pub fn lookup(&mut self, key: &IdempotencyKey, now: Ts) -> Option<Option<Decision>> {
        let entry = self.map.get(key)?;
        if now.as_nanos() - entry.ts.as_nanos() > self.ttl_ns {
            self.map.remove(key);
            return None;
        }
        Some(entry.decision)
    }

    /// Reserve `key` before processing starts
    pub fn reserve(&mut self, key: IdempotencyKey, now: Ts) {
        self.evict_for(now);
        self.map.insert(
            key,
            Entry {
                decision: None,
                ts: now,
            },
        );
        self.order.push_back((key, now));
    }

    /// Record the final decision under a previously reserved key
    ///
    /// The reservation timestamp is kept: TTL runs from first sight of the
    /// key, and the eviction deque stays linked to the map entry.
    pub fn commit(&mut self, key: IdempotencyKey, decision: Decision, now: Ts) {
        match self.map.get_mut(&key) {
            Some(entry) => {
                entry.decision = Some(decision);
            }
            None => {
                // Reservation was evicted between reserve and commit; rare,
                // but the decision must still be replay-visible
                self.reserve(key, now);
                if let Some(entry) = self.map.get_mut(&key) {
                    entry.decision = Some(decision);
                }
            }
        }
    }

    /// Entries currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no entries are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_for(&mut self, now: Ts) {
        // TTL expiry first, then capacity
        while let Some((key, ts)) = self.order.front().copied() {
            let stale = now.as_nanos() - ts.as_nanos() > self.ttl_ns;
            if !stale && self.map.len() < self.capacity {
                break;
            }
            self.order.pop_front();
            // Only drop the map entry if it still belongs to this window slot
            if let Some(entry) = self.map.get(&key) {
                if entry.ts == ts || stale {
                    self.map.remove(&key);
                }
            }
        }
    }

    /// Persist the window (temp + rename)
    pub fn persist(&self, path: &Path) -> Result<(), DedupPersistError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rows: Vec<(IdempotencyKey, Option<Decision>, Ts)> = self
            .order
            .iter()
            .filter_map(|(key, _)| self.map.get(key).map(|e| (*key, e.decision, e.ts)))
            .collect();
        let bytes = bincode::serialize(&rows)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        info!(entries = rows.len(), path = %path.display(), "idempotency window persisted");
        Ok(())
    }

    /// Load a persisted window, dropping entries stale at `now`
    #[must_use]
    pub fn load(path: &Path, capacity: usize, ttl_ns: i64, now: Ts) -> Self {
        let mut store = Self::new(capacity, ttl_ns);
        let Ok(bytes) = std::fs::read(path) else {
            return store;
        };
        match bincode::deserialize::<Vec<(IdempotencyKey, Option<Decision>, Ts)>>(&bytes) {
            Ok(rows) => {
                let total = rows.len();
                for (key, decision, ts) in rows {
                    if now.as_nanos() - ts.as_nanos() > ttl_ns {
                        continue;
                    }
                    store.map.insert(key, Entry { decision, ts });
                    store.order.push_back((key, ts));
                }
                info!(
                    loaded = store.map.len(),
                    dropped = total - store.map.len(),
                    "idempotency window restored"
                );
            }
            Err(e) => warn!(error = %e, "idempotency window unreadable, starting empty"),
        }
        store
    }
}
