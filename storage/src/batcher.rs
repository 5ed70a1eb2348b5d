//! Per-topic row batching
//!
//! Rows accumulate per topic and flush on `(rows >= N) || (age >= Δt)`.
//! A cross-batcher row guard forces everything out before memory runs away.

use common::events::{RecordEvent, Topic};
use metrics::counter;
use std::time::Instant;
use tracing::warn;

/// Flush policy
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    /// Flush at this many rows
    pub max_rows: usize,
    /// Flush at this age
    pub max_age_ms: u64,
    /// Force-flush everything past this many rows across all topics
    pub memory_guard_rows: usize,
}

struct TopicBatch {
    rows: Vec<RecordEvent>,
    oldest: Option<Instant>,
}

impl TopicBatch {
    const fn new() -> Self {
        Self {
            rows: Vec::new(),
            oldest: None,
        }
    }
}

/// All topic batchers plus the global row guard
pub struct BatcherSet {
    batches: [TopicBatch; Topic::ALL.len()],
    policy: BatchPolicy,
    total_rows: usize,
}

impl BatcherSet {
    /// Create an empty set
    #[must_use]
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            batches: [
                TopicBatch::new(),
                TopicBatch::new(),
                TopicBatch::new(),
                TopicBatch::new(),
                TopicBatch::new(),
            ],
            policy,
            total_rows: 0,
        }
    }

    fn index(topic: Topic) -> usize {
        Topic::ALL
            .iter()
            .position(|t| *t == topic)
            .expect("topic in ALL")
    }

    /// Add one row to its topic's batch
    pub fn push(&mut self, row: RecordEvent) {
        let batch = &mut self.batches[Self::index(row.topic())];
        if batch.oldest.is_none() {
            batch.oldest = Some(Instant::now());
        }
        batch.rows.push(row);
        self.total_rows += 1;
    }

    /// True when the cross-batcher guard demands a full flush
    #[must_use]
    pub fn over_memory_guard(&self) -> bool {
        self.total_rows >= self.policy.memory_guard_rows
    }

    /// Topics whose batch is due by rows or age
    pub fn due_topics(&self) -> Vec<Topic> {
        Topic::ALL
            .iter()
            .copied()
            .filter(|topic| {
                let batch = &self.batches[Self::index(*topic)];
                !batch.rows.is_empty()
                    && (batch.rows.len() >= self.policy.max_rows
                        || batch
                            .oldest
                            .is_some_and(|t| t.elapsed().as_millis() as u64
                                >= self.policy.max_age_ms))
            })
            .collect()
    }

    /// Take the topic's batch, empty or not
    pub fn take(&mut self, topic: Topic) -> Vec<RecordEvent> {
        let batch = &mut self.batches[Self::index(topic)];
        self.total_rows -= batch.rows.len();
        batch.oldest = None;
        std::mem::take(&mut batch.rows)
    }

    /// Take every non-empty batch (shutdown, memory guard)
    pub fn take_all(&mut self) -> Vec<(Topic, Vec<RecordEvent>)> {
        if self.over_memory_guard() {
            counter!("recorder_forced_flush_total").increment(1);
            warn!(rows = self.total_rows, "memory guard forced flush");
        }
        Topic::ALL
            .iter()
            .copied()
            .filter_map(|topic| {
                let rows = self.take(topic);
                (!rows.is_empty()).then_some((topic, rows))
            })
            .collect()
    }

    /// Rows currently buffered across all topics
    #[must_use]
    pub const fn buffered_rows(&self) -> usize {
        self.total_rows
    }
}
