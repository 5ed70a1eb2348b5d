//! Column store interface
//!
//! The real columnar store is an external collaborator; the core only
//! needs inserts with business-key dedup. The in-memory implementation
//! backs sim runs and tests, including simulated outages.

use common::events::{RecordEvent, Topic};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Batch insert surface of the columnar store
pub trait ColumnStore: Send + Sync {
    /// Insert a batch; rows whose business key was already seen are
    /// skipped. Returns the number of rows actually inserted.
    fn insert_batch(&self, topic: Topic, rows: &[RecordEvent]) -> anyhow::Result<usize>;
}

#[derive(Default)]
struct MemStoreInner {
    tables: FxHashMap<Topic, Vec<RecordEvent>>,
    seen_keys: FxHashMap<Topic, FxHashSet<u128>>,
}

/// In-memory store with business-key dedup and a fault switch
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
    down: AtomicBool,
}

impl MemStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (true) or recovery (false)
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Release);
    }

    /// Rows in a table
    #[must_use]
    pub fn table_len(&self, topic: Topic) -> usize {
        self.inner
            .lock()
            .tables
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Copy of a table's rows
    #[must_use]
    pub fn table(&self, topic: Topic) -> Vec<RecordEvent> {
        self.inner
            .lock()
            .tables
            .get(&topic)
            .cloned()
            .unwrap_or_default()
    }
}

impl ColumnStore for MemStore {
    fn insert_batch(&self, topic: Topic, rows: &[RecordEvent]) -> anyhow::Result<usize> {
        if self.down.load(Ordering::Acquire) {
            anyhow::bail!("store unavailable");
        }
        let mut inner = self.inner.lock();
        let MemStoreInner { tables, seen_keys } = &mut *inner;
        let table = tables.entry(topic).or_default();
        let seen = seen_keys.entry(topic).or_default();

        let mut inserted = 0;
        for row in rows {
            if let Some(key) = row.business_key() {
                if !seen.insert(key) {
                    continue;
                }
            }
            table.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}
