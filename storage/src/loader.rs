//! WAL drain: closed segments into the column store
//!
//! Several loader workers can point at the same directory; a file-lock
//! claim (`.lock` created with `create_new`) gives each segment exactly
//! one owner, so no row is loaded twice even across processes.

use crate::segment::SegmentReader;
use crate::store::ColumnStore;
use crate::wal::Wal;
use common::events::Topic;
use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drains closed WAL segments into the store
pub struct Loader {
    dir: PathBuf,
    store: Arc<dyn ColumnStore>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Loader {
    /// Create a loader over a WAL directory
    #[must_use]
    pub fn new(
        dir: PathBuf,
        store: Arc<dyn ColumnStore>,
        poll_interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            dir,
            store,
            poll_interval,
            shutdown,
        }
    }

    /// Poll until shutdown, then make a final pass
    pub fn run(&self) {
        info!(dir = %self.dir.display(), "loader started");
        while !self.shutdown.load(Ordering::Acquire) {
            self.drain_once();
            std::thread::sleep(self.poll_interval);
        }
        self.drain_once();
        info!("loader stopped");
    }

    /// One pass over the directory; returns rows loaded
    pub fn drain_once(&self) -> usize {
        let Ok(segments) = Wal::list_segments(&self.dir) else {
            return 0;
        };
        let mut loaded = 0;
        for segment in segments {
            loaded += self.drain_segment(&segment);
        }
        loaded
    }

    fn drain_segment(&self, segment: &Path) -> usize {
        let Some(_claim) = ShardClaim::try_claim(segment) else {
            return 0;
        };
        // The claim may have raced with a worker that finished and deleted
        // the segment before our lock landed
        if !segment.exists() {
            return 0;
        }

        let mut reader = match SegmentReader::open(segment) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(path = %segment.display(), error = %e, "unreadable segment skipped");
                return 0;
            }
        };
        let Some(topic) = Topic::ALL.iter().find(|t| t.as_str() == reader.topic).copied() else {
            warn!(path = %segment.display(), topic = %reader.topic, "unknown topic, skipped");
            return 0;
        };
        let rows = reader.read_all();

        match self.store.insert_batch(topic, &rows) {
            Ok(inserted) => {
                counter!("loader_segments_drained_total").increment(1);
                counter!("loader_rows_drained_total", "table" => topic.as_str())
                    .increment(rows.len() as u64);
                debug!(
                    path = %segment.display(),
                    rows = rows.len(),
                    inserted,
                    "segment drained"
                );
                if let Err(e) = std::fs::remove_file(segment) {
                    warn!(path = %segment.display(), error = %e, "drained segment not removed");
                }
                rows.len()
            }
            Err(e) => {
                // Store outage: leave the segment for a later pass
                counter!("recorder_failures_total").increment(1);
                warn!(path = %segment.display(), error = %e, "store insert failed, will retry");
                0
            }
        }
    }

    /// Backlog of closed segments not yet drained
    #[must_use]
    pub fn backlog(&self) -> usize {
        Wal::list_segments(&self.dir).map_or(0, |s| s.len())
    }
}

/// Exclusive ownership of one segment, released on drop
struct ShardClaim {
    lock_path: PathBuf,
}

impl ShardClaim {
    fn try_claim(segment: &Path) -> Option<Self> {
        let lock_path = segment.with_extension("lock");
        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lock_path)
        {
            Ok(_) => Some(Self { lock_path }),
            Err(_) => None,
        }
    }
}

impl Drop for ShardClaim {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::wal::{RotationPolicy, Wal};
    use common::events::{RecordEvent, TradeRow};
    use common::{Side, StrategyId, Symbol, Ts};

    fn trade(fill_id: u64) -> RecordEvent {
        RecordEvent::Trade(TradeRow {
            fill_id,
            order_id: 1,
            strategy: StrategyId::new(1),
            symbol: Symbol::new(1),
            side: Side::Buy,
            price: 1,
            qty: 1,
            fee: 0,
            match_ts: Ts::from_nanos(0),
        })
    }

    fn write_segments(dir: &Path, fills: std::ops::Range<u64>) {
        let mut wal = Wal::new(
            dir,
            RotationPolicy {
                max_bytes: 1024 * 1024,
                max_age_ms: 60_000,
            },
        )
        .unwrap();
        let rows: Vec<RecordEvent> = fills.map(trade).collect();
        wal.append_batch(Topic::Trades, &rows).unwrap();
        wal.close_all().unwrap();
    }

    fn loader(dir: &Path, store: Arc<MemStore>) -> Loader {
        Loader::new(
            dir.to_path_buf(),
            store,
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_drain_moves_rows_and_removes_segments() {
        let tmp = tempfile::tempdir().unwrap();
        write_segments(tmp.path(), 0..10);

        let store = Arc::new(MemStore::new());
        let loader = loader(tmp.path(), Arc::clone(&store));
        assert_eq!(loader.drain_once(), 10);
        assert_eq!(store.table_len(Topic::Trades), 10);
        assert_eq!(loader.backlog(), 0);
    }

    #[test]
    fn test_outage_leaves_segment_then_drains() {
        let tmp = tempfile::tempdir().unwrap();
        write_segments(tmp.path(), 0..5);

        let store = Arc::new(MemStore::new());
        store.set_down(true);
        let loader = loader(tmp.path(), Arc::clone(&store));

        assert_eq!(loader.drain_once(), 0);
        assert_eq!(loader.backlog(), 1);

        store.set_down(false);
        assert_eq!(loader.drain_once(), 5);
        assert_eq!(loader.backlog(), 0);
        assert_eq!(store.table_len(Topic::Trades), 5);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        write_segments(tmp.path(), 0..5);
        // Same fills written again in a second segment (double capture)
        write_segments(tmp.path(), 0..5);

        let store = Arc::new(MemStore::new());
        let loader = loader(tmp.path(), Arc::clone(&store));
        loader.drain_once();

        // Business-key dedup keeps exactly one row per fill
        assert_eq!(store.table_len(Topic::Trades), 5);
    }

    #[test]
    fn test_claimed_segment_is_skipped_by_second_worker() {
        let tmp = tempfile::tempdir().unwrap();
        write_segments(tmp.path(), 0..3);
        let segment = Wal::list_segments(tmp.path()).unwrap().pop().unwrap();

        // A competing worker holds the claim
        let _claim = ShardClaim::try_claim(&segment).unwrap();

        let store = Arc::new(MemStore::new());
        let loader = loader(tmp.path(), Arc::clone(&store));
        assert_eq!(loader.drain_once(), 0);
        assert_eq!(store.table_len(Topic::Trades), 0);
    }
}
