//! Broker circuit breaker
//!
//! Closed -> Open after N consecutive failures; Open -> HalfOpen after a
//! dwell; HalfOpen closes on one success or reopens on the next failure.
//! While open, only CANCELs may pass.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tracing::{info, warn};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPosition {
    /// Actions flow
    Closed,
    /// Only cancels flow
    Open,
    /// One probe action is allowed through
    HalfOpen,
}

/// Three-state circuit breaker
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU64,
    opened_at_ms: AtomicU64,
    threshold: u64,
    timeout_ms: u64,
}

impl CircuitBreaker {
    /// Create a breaker opening after `threshold` consecutive failures and
    /// probing after `timeout_ms`
    #[must_use]
    pub fn new(threshold: u64, timeout_ms: u64) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            threshold,
            timeout_ms,
        }
    }

    /// Current position; Open decays to HalfOpen once the dwell elapses
    pub fn position(&self) -> BreakerPosition {
        match self.state.load(Ordering::Acquire) {
            OPEN => {
                let now = wall_ms();
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if now > opened + self.timeout_ms {
                    self.state.store(HALF_OPEN, Ordering::Release);
                    info!("circuit breaker half-open, probing");
                    BreakerPosition::HalfOpen
                } else {
                    BreakerPosition::Open
                }
            }
            HALF_OPEN => BreakerPosition::HalfOpen,
            _ => BreakerPosition::Closed,
        }
    }

    /// True when a non-cancel action may be attempted
    pub fn allows_action(&self) -> bool {
        self.position() != BreakerPosition::Open
    }

    /// Record a successful broker call; closes from any position
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            info!("circuit breaker closed");
        }
    }

    /// Record a failed broker call
    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        let position = self.state.load(Ordering::Acquire);
        if position == HALF_OPEN || (position == CLOSED && count >= self.threshold) {
            self.state.store(OPEN, Ordering::Release);
            self.opened_at_ms.store(wall_ms(), Ordering::Release);
            warn!(consecutive = count, "circuit breaker open");
        }
    }
}

fn wall_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, 60_000);
        assert_eq!(breaker.position(), BreakerPosition::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.position(), BreakerPosition::Closed);

        breaker.record_failure();
        assert_eq!(breaker.position(), BreakerPosition::Open);
        assert!(!breaker.allows_action());
    }

    #[test]
    fn test_success_resets_count_and_closes() {
        let breaker = CircuitBreaker::new(2, 60_000);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.position(), BreakerPosition::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes_on_success() {
        let breaker = CircuitBreaker::new(1, 0);
        breaker.record_failure();
        // timeout_ms = 0: immediately eligible for a probe
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(breaker.position(), BreakerPosition::HalfOpen);
        assert!(breaker.allows_action());

        breaker.record_success();
        assert_eq!(breaker.position(), BreakerPosition::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new(1, 0);
        breaker.record_failure();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(breaker.position(), BreakerPosition::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.position(), BreakerPosition::Open);
    }
}
