//! The recorder stage
//!
//! Consumes the recorder queue, batches per topic, and flushes either
//! straight to the store (`direct`) or to WAL segments (`wal_first`).
//! Disk pressure applies per-topic policies; HALT trips the global kill
//! switch so the decision plane stops too.

use crate::batcher::{BatchPolicy, BatcherSet};
use crate::disk::{DiskLevel, DiskLevelHandle};
use crate::store::ColumnStore;
use crate::wal::{RotationPolicy, Wal};
use bus::StageReceiver;
use common::config::{RecorderConfig, RecorderMode, TopicPolicy};
use common::events::{RecordEvent, Topic};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// The recorder stage loop
pub struct Recorder {
    rx: StageReceiver<RecordEvent>,
    mode: RecorderMode,
    batchers: BatcherSet,
    wal: Wal,
    store: Arc<dyn ColumnStore>,
    disk: DiskLevelHandle,
    config: RecorderConfig,
    kill_switch: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Recorder {
    /// Assemble the recorder
    pub fn new(
        rx: StageReceiver<RecordEvent>,
        config: RecorderConfig,
        store: Arc<dyn ColumnStore>,
        disk: DiskLevelHandle,
        kill_switch: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, crate::segment::SegmentError> {
        let wal = Wal::new(
            &config.wal_dir,
            RotationPolicy {
                max_bytes: config.segment_max_bytes,
                max_age_ms: config.segment_max_age_ms,
            },
        )?;
        let batchers = BatcherSet::new(BatchPolicy {
            max_rows: config.batch_max_rows,
            max_age_ms: config.batch_max_age_ms,
            memory_guard_rows: config.memory_guard_rows,
        });
        gauge!("wal_mode").set(match config.mode {
            RecorderMode::Direct => 0.0,
            RecorderMode::WalFirst => 1.0,
        });
        Ok(Self {
            rx,
            mode: config.mode,
            batchers,
            wal,
            store,
            disk,
            config,
            kill_switch,
            shutdown,
        })
    }

    /// Run until shutdown; flushes everything on the way out
    pub fn run(mut self) {
        info!(mode = ?self.mode, "recorder started");
        let mut incoming: Vec<RecordEvent> = Vec::with_capacity(512);

        loop {
            incoming.clear();
            let n = self.rx.drain_into(512, &mut incoming);
            if n == 0 {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                match self.rx.recv_timeout(Duration::from_millis(1)) {
                    Some(row) => self.accept(row),
                    None => {}
                }
            } else {
                for row in incoming.drain(..) {
                    self.accept(row);
                }
            }
            self.flush_due();
        }

        // Shutdown: drain the queue, then flush every batch
        while let Some(row) = self.rx.try_recv() {
            self.accept(row);
        }
        let remaining = self.batchers.take_all();
        self.flush_batches(remaining);
        if let Err(e) = self.wal.close_all() {
            error!(error = %e, "failed to close WAL on shutdown");
        }
        info!("recorder stopped");
    }

    fn accept(&mut self, row: RecordEvent) {
        let level = self.disk.get();
        if level == DiskLevel::Halt {
            // All writes stop; the kill switch pushes StormGuard to HALT
            if !self.kill_switch.swap(true, Ordering::AcqRel) {
                error!("disk HALT, recorder dropping writes and tripping kill switch");
            }
            counter!("recorder_rows_dropped_total", "table" => row.topic().as_str())
                .increment(1);
            return;
        }
        if level == DiskLevel::Critical {
            match self.topic_policy(row.topic()) {
                TopicPolicy::Write => {}
                TopicPolicy::Drop => {
                    counter!("recorder_rows_dropped_total", "table" => row.topic().as_str())
                        .increment(1);
                    return;
                }
                TopicPolicy::Halt => {
                    if !self.kill_switch.swap(true, Ordering::AcqRel) {
                        error!(
                            topic = row.topic().as_str(),
                            "disk CRITICAL with halt policy, tripping kill switch"
                        );
                    }
                    counter!("recorder_rows_dropped_total", "table" => row.topic().as_str())
                        .increment(1);
                    return;
                }
            }
        }
        self.batchers.push(row);
    }

    const fn topic_policy(&self, topic: Topic) -> TopicPolicy {
        match topic {
            Topic::MarketData | Topic::LatencySpans => self.config.market_data_policy,
            Topic::Orders | Topic::Trades | Topic::RiskLog => self.config.orders_policy,
        }
    }

    fn flush_due(&mut self) {
        if self.batchers.over_memory_guard() {
            let all = self.batchers.take_all();
            self.flush_batches(all);
            return;
        }
        for topic in self.batchers.due_topics() {
            let rows = self.batchers.take(topic);
            self.flush_one(topic, rows);
        }
    }

    fn flush_batches(&mut self, batches: Vec<(Topic, Vec<RecordEvent>)>) {
        for (topic, rows) in batches {
            self.flush_one(topic, rows);
        }
    }

    fn flush_one(&mut self, topic: Topic, rows: Vec<RecordEvent>) {
        if rows.is_empty() {
            return;
        }
        let count = rows.len() as u64;
        let result = match self.mode {
            RecorderMode::WalFirst => self
                .wal
                .append_batch(topic, &rows)
                .map_err(anyhow::Error::from),
            RecorderMode::Direct => self
                .store
                .insert_batch(topic, &rows)
                .map(|_| ()),
        };
        match result {
            Ok(()) => {
                counter!("recorder_batches_flushed_total", "table" => topic.as_str())
                    .increment(1);
                counter!("recorder_rows_flushed_total", "table" => topic.as_str())
                    .increment(count);
            }
            Err(e) => {
                counter!("recorder_failures_total").increment(1);
                warn!(topic = topic.as_str(), rows = count, error = %e, "flush failed, batch lost");
            }
        }
    }
}
