//! Per-strategy circuit breaker
//!
//! Normal -> Degraded on repeated budget overruns or failures, Degraded ->
//! Halted when they keep coming. Halted strategies are excluded from
//! dispatch until an operator resets them.

use tracing::warn;

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Dispatching normally
    Normal,
    /// Dispatching, but flagged; one clean call recovers
    Degraded,
    /// Excluded from dispatch until manual reset
    Halted,
}

/// Three-state breaker guarding one strategy
#[derive(Debug)]
pub struct StrategyBreaker {
    state: BreakerState,
    consecutive: u32,
    degrade_after: u32,
    halt_after: u32,
}

impl StrategyBreaker {
    /// Create a breaker with the given strike thresholds
    #[must_use]
    pub fn new(degrade_after: u32, halt_after: u32) -> Self {
        Self {
            state: BreakerState::Normal,
            consecutive: 0,
            degrade_after,
            halt_after,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> BreakerState {
        self.state
    }

    /// True when the strategy may be dispatched
    #[must_use]
    pub const fn allows_dispatch(&self) -> bool {
        !matches!(self.state, BreakerState::Halted)
    }

    /// Record a clean call; recovers Degraded to Normal
    pub fn on_ok(&mut self) {
        self.consecutive = 0;
        if self.state == BreakerState::Degraded {
            self.state = BreakerState::Normal;
        }
    }

    /// Record a budget overrun or caught failure
    pub fn on_strike(&mut self, strategy: &str) {
        self.consecutive += 1;
        let next = if self.consecutive >= self.halt_after {
            BreakerState::Halted
        } else if self.consecutive >= self.degrade_after {
            BreakerState::Degraded
        } else {
            self.state
        };
        if next != self.state {
            warn!(
                strategy,
                from = ?self.state,
                to = ?next,
                strikes = self.consecutive,
                "strategy breaker transition"
            );
            self.state = next;
        }
    }

    /// Manual re-enable
    pub fn reset(&mut self) {
        self.state = BreakerState::Normal;
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_then_halts() {
        let mut breaker = StrategyBreaker::new(3, 5);
        assert_eq!(breaker.state(), BreakerState::Normal);

        for _ in 0..3 {
            breaker.on_strike("s");
        }
        assert_eq!(breaker.state(), BreakerState::Degraded);
        assert!(breaker.allows_dispatch());

        for _ in 0..2 {
            breaker.on_strike("s");
        }
        assert_eq!(breaker.state(), BreakerState::Halted);
        assert!(!breaker.allows_dispatch());
    }

    #[test]
    fn test_clean_call_recovers_degraded() {
        let mut breaker = StrategyBreaker::new(2, 10);
        breaker.on_strike("s");
        breaker.on_strike("s");
        assert_eq!(breaker.state(), BreakerState::Degraded);

        breaker.on_ok();
        assert_eq!(breaker.state(), BreakerState::Normal);
    }

    #[test]
    fn test_halted_is_sticky_until_reset() {
        let mut breaker = StrategyBreaker::new(1, 2);
        breaker.on_strike("s");
        breaker.on_strike("s");
        assert_eq!(breaker.state(), BreakerState::Halted);

        breaker.on_ok();
        assert_eq!(breaker.state(), BreakerState::Halted);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Normal);
    }
}
