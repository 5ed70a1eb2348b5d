//! Sliding-window action rate limiter
//!
//! Counts broker actions over a rolling window of monotonic timestamps.
//! The soft cap signals backpressure upstream; the hard cap is the broker's
//! limit and is never crossed.

use common::Ts;
use std::collections::VecDeque;

/// Result of asking for one action slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Slot granted
    Ready,
    /// Slot granted, but the soft cap is breached; signal backpressure
    SoftReady,
    /// Hard cap reached; retry after the window frees up
    NotReady {
        /// Nanoseconds until the oldest action leaves the window
        retry_after_ns: i64,
    },
}

/// Rolling-window limiter
pub struct SlidingWindowLimiter {
    window_ns: i64,
    soft_cap: usize,
    hard_cap: usize,
    actions: VecDeque<i64>,
}

impl SlidingWindowLimiter {
    /// Create a limiter; `soft_cap <= hard_cap` is validated by config
    #[must_use]
    pub fn new(window_ns: i64, soft_cap: usize, hard_cap: usize) -> Self {
        Self {
            window_ns,
            soft_cap,
            hard_cap,
            actions: VecDeque::with_capacity(hard_cap),
        }
    }

    /// Try to take a slot at `now`
    pub fn acquire(&mut self, now: Ts) -> AcquireOutcome {
        let now = now.as_nanos();
        let cutoff = now - self.window_ns;
        while self.actions.front().is_some_and(|ts| *ts < cutoff) {
            self.actions.pop_front();
        }

        if self.actions.len() >= self.hard_cap {
            let oldest = self.actions.front().copied().unwrap_or(now);
            return AcquireOutcome::NotReady {
                retry_after_ns: (oldest + self.window_ns - now).max(1),
            };
        }

        self.actions.push_back(now);
        if self.actions.len() >= self.soft_cap {
            AcquireOutcome::SoftReady
        } else {
            AcquireOutcome::Ready
        }
    }

    /// Actions currently inside the window
    #[must_use]
    pub fn in_window(&self) -> usize {
        self.actions.len()
    }
}
