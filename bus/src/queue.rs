//! Bounded stage queues
//!
//! Every hand-off between pipeline stages goes through one of these. The
//! send side is non-blocking by default; overflow policy belongs to the
//! caller, the queue only counts.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use metrics::{counter, gauge};
use std::time::Duration;

/// Error returned when a non-blocking enqueue finds the queue full
pub struct QueueFull<T> {
    /// Queue name
    pub queue: &'static str,
    /// The rejected item, returned to the caller
    pub item: T,
}

impl<T> std::fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueFull").field("queue", &self.queue).finish()
    }
}

impl<T> std::fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue {} full", self.queue)
    }
}

impl<T> std::error::Error for QueueFull<T> {}

/// Create a named bounded queue
#[must_use]
pub fn bounded<T>(name: &'static str, capacity: usize) -> (StageSender<T>, StageReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (
        StageSender { name, tx },
        StageReceiver { name, rx },
    )
}

/// Producer side of a stage queue
#[derive(Clone)]
pub struct StageSender<T> {
    name: &'static str,
    tx: Sender<T>,
}

impl<T> StageSender<T> {
    /// Non-blocking enqueue; on overflow the item comes back to the caller
    /// and the per-queue drop counter advances by exactly one
    pub fn try_send(&self, item: T) -> Result<(), QueueFull<T>> {
        match self.tx.try_send(item) {
            Ok(()) => {
                gauge!("queue_depth", "queue" => self.name).set(self.tx.len() as f64);
                Ok(())
            }
            Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => {
                counter!("queue_dropped_total", "queue" => self.name).increment(1);
                Err(QueueFull {
                    queue: self.name,
                    item,
                })
            }
        }
    }

    /// Queue name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current depth
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// True when the queue holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer side of a stage queue
pub struct StageReceiver<T> {
    name: &'static str,
    rx: Receiver<T>,
}

impl<T> StageReceiver<T> {
    /// Blocking receive with a timeout; the stage's idle tick
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                gauge!("queue_depth", "queue" => self.name).set(self.rx.len() as f64);
                Some(item)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain up to `max` items into `out`; returns the number drained
    pub fn drain_into(&self, max: usize, out: &mut Vec<T>) -> usize {
        let mut n = 0;
        while n < max {
            match self.rx.try_recv() {
                Ok(item) => {
                    out.push(item);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        if n > 0 {
            gauge!("queue_depth", "queue" => self.name).set(self.rx.len() as f64);
        }
        n
    }

    /// Queue name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current depth
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when the queue holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_send_and_drain() {
        let (tx, rx) = bounded::<u32>("test", 4);
        for i in 0..4 {
            tx.try_send(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.drain_into(10, &mut out), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_full_queue_returns_item() {
        let (tx, _rx) = bounded::<u32>("test_full", 2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        let err = tx.try_send(3).unwrap_err();
        assert_eq!(err.item, 3);
        assert_eq!(err.queue, "test_full");
    }

    #[test]
    fn test_recv_timeout_times_out_empty() {
        let (_tx, rx) = bounded::<u32>("test_timeout", 2);
        assert!(rx.recv_timeout(Duration::from_millis(5)).is_none());
    }
}
