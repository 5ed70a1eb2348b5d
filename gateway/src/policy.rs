//! StormGuard policy FSM
//!
//! NORMAL -> DEGRADED -> HALT, driven by realized drawdown, reject rate and
//! heartbeat loss, or forced by the operator. CANCEL passes in every
//! non-terminal state; HALT is sticky until an operator resumes.

use common::config::RiskConfig;
use common::events::{IntentType, StormFlag, StormState};
use common::{ReasonCode, Ts};
use metrics::gauge;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

const REJECT_WINDOW: usize = 256;
const REJECT_RATE_DEGRADE_PCT: u64 = 50;
const HEARTBEAT_TIMEOUT_NS: i64 = 5_000_000_000;

/// The safety FSM
pub struct StormGuard {
    flag: Arc<StormFlag>,
    config: RiskConfig,
    peak_pnl: i64,
    drawdown: i64,
    recent: VecDeque<bool>,
    rejects_in_window: usize,
    last_heartbeat: Ts,
    operator_halted: bool,
    halt_latched: bool,
    rate_pressure: bool,
}

impl StormGuard {
    /// Create a guard publishing its mode through `flag`
    #[must_use]
    pub fn new(config: RiskConfig, flag: Arc<StormFlag>, now: Ts) -> Self {
        let guard = Self {
            flag,
            config,
            peak_pnl: 0,
            drawdown: 0,
            recent: VecDeque::with_capacity(REJECT_WINDOW),
            rejects_in_window: 0,
            last_heartbeat: now,
            operator_halted: false,
            halt_latched: false,
            rate_pressure: false,
        };
        guard.publish(StormState::Normal);
        guard
    }

    /// Current mode
    #[must_use]
    pub fn state(&self) -> StormState {
        self.flag.get()
    }

    /// Gate an intent against the current mode
    ///
    /// HALT blocks NEW and AMEND, never CANCEL.
    pub fn allows(&self, intent_type: IntentType) -> Result<(), ReasonCode> {
        match self.state() {
            StormState::Halt if intent_type != IntentType::Cancel => Err(ReasonCode::PolicyHalt),
            _ => Ok(()),
        }
    }

    /// Feed the running realized PnL; drawdown from the high-water mark
    /// drives WARM/STORM transitions
    pub fn on_pnl(&mut self, realized_pnl: i64) {
        self.peak_pnl = self.peak_pnl.max(realized_pnl);
        self.drawdown = self.peak_pnl - realized_pnl;
        if self.drawdown >= self.config.storm_halt_drawdown && self.state() != StormState::Halt {
            warn!(
                drawdown = self.drawdown,
                threshold = self.config.storm_halt_drawdown,
                "drawdown past halt threshold"
            );
        }
        self.reevaluate();
    }

    /// Record a gateway decision for the reject-rate window
    pub fn on_decision(&mut self, rejected: bool) {
        if self.recent.len() == REJECT_WINDOW {
            if self.recent.pop_front() == Some(true) {
                self.rejects_in_window -= 1;
            }
        }
        self.recent.push_back(rejected);
        if rejected {
            self.rejects_in_window += 1;
        }
        self.reevaluate();
    }

    /// Broker/feed heartbeat
    pub fn heartbeat(&mut self, now: Ts) {
        self.last_heartbeat = now;
    }

    /// Periodic check; heartbeat loss degrades
    pub fn tick(&mut self, now: Ts) {
        if now.as_nanos() - self.last_heartbeat.as_nanos() > HEARTBEAT_TIMEOUT_NS {
            if self.state() == StormState::Normal {
                warn!("heartbeat lost, degrading");
            }
        }
        self.reevaluate_at(now);
    }

    /// Soft order-rate pressure from the risk engine
    pub fn set_rate_pressure(&mut self, pressure: bool) {
        self.rate_pressure = pressure;
        self.reevaluate();
    }

    /// Operator kill switch: HALT, cancel-only
    pub fn operator_halt(&mut self) {
        self.operator_halted = true;
        info!("operator halt");
        self.reevaluate();
    }

    /// Operator resume; clears the halt latch and recomputes the mode
    ///
    /// Also resets the drawdown high-water mark: resuming means the
    /// operator accepts the current PnL as the new baseline.
    pub fn operator_resume(&mut self) {
        self.operator_halted = false;
        self.halt_latched = false;
        self.peak_pnl -= self.drawdown;
        self.drawdown = 0;
        info!("operator resume");
        self.reevaluate();
    }

    /// DEGRADED-mode throttle check for NEW intents
    #[must_use]
    pub fn throttled_max_qty(&self, divisor: i64) -> i64 {
        (self.config.max_qty / divisor.max(1)).max(1)
    }

    fn reevaluate(&mut self) {
        self.reevaluate_at(self.last_heartbeat);
    }

    fn reevaluate_at(&mut self, now: Ts) {
        let heartbeat_lost =
            now.as_nanos() - self.last_heartbeat.as_nanos() > HEARTBEAT_TIMEOUT_NS;
        let reject_pressure = self.recent.len() >= REJECT_WINDOW / 4
            && (self.rejects_in_window as u64 * 100)
                >= (self.recent.len() as u64 * REJECT_RATE_DEGRADE_PCT);

        if self.drawdown >= self.config.storm_halt_drawdown {
            // Latched: PnL recovery alone never leaves HALT
            self.halt_latched = true;
        }
        let next = if self.operator_halted || self.halt_latched {
            StormState::Halt
        } else if self.drawdown >= self.config.storm_warm_drawdown
            || heartbeat_lost
            || reject_pressure
            || self.rate_pressure
        {
            StormState::Degraded
        } else {
            StormState::Normal
        };

        if next != self.state() {
            info!(from = %self.state(), to = %next, drawdown = self.drawdown, "stormguard transition");
            self.publish(next);
        }
    }

    fn publish(&self, state: StormState) {
        self.flag.set(state);
        gauge!("stormguard_mode").set(match state {
            StormState::Normal => 0.0,
            StormState::Degraded => 1.0,
            StormState::Halt => 2.0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> StormGuard {
        let config = RiskConfig {
            storm_warm_drawdown: 1_000,
            storm_halt_drawdown: 5_000,
            ..RiskConfig::default()
        };
        StormGuard::new(config, Arc::new(StormFlag::default()), Ts::from_nanos(0))
    }

    #[test]
    fn test_drawdown_walks_the_fsm() {
        let mut guard = guard();
        assert_eq!(guard.state(), StormState::Normal);

        guard.on_pnl(10_000); // high-water
        assert_eq!(guard.state(), StormState::Normal);

        guard.on_pnl(8_500); // drawdown 1500 >= warm
        assert_eq!(guard.state(), StormState::Degraded);

        guard.on_pnl(4_000); // drawdown 6000 >= halt
        assert_eq!(guard.state(), StormState::Halt);
    }

    #[test]
    fn test_halt_blocks_new_allows_cancel() {
        let mut guard = guard();
        guard.on_pnl(10_000);
        guard.on_pnl(0);
        assert_eq!(guard.state(), StormState::Halt);

        assert_eq!(guard.allows(IntentType::New), Err(ReasonCode::PolicyHalt));
        assert_eq!(guard.allows(IntentType::Amend), Err(ReasonCode::PolicyHalt));
        assert!(guard.allows(IntentType::Cancel).is_ok());
    }

    #[test]
    fn test_halt_sticky_until_operator_resume() {
        let mut guard = guard();
        guard.on_pnl(10_000);
        guard.on_pnl(0);
        assert_eq!(guard.state(), StormState::Halt);

        // PnL recovers, still halted
        guard.on_pnl(10_000);
        assert_eq!(guard.state(), StormState::Halt);

        guard.operator_resume();
        assert_eq!(guard.state(), StormState::Normal);
    }

    #[test]
    fn test_operator_halt_and_resume() {
        let mut guard = guard();
        guard.operator_halt();
        assert_eq!(guard.state(), StormState::Halt);
        guard.operator_resume();
        assert_eq!(guard.state(), StormState::Normal);
    }

    #[test]
    fn test_reject_rate_degrades() {
        let mut guard = guard();
        for _ in 0..64 {
            guard.on_decision(true);
        }
        assert_eq!(guard.state(), StormState::Degraded);

        // A run of accepts clears the pressure
        for _ in 0..256 {
            guard.on_decision(false);
        }
        assert_eq!(guard.state(), StormState::Normal);
    }

    #[test]
    fn test_heartbeat_loss_degrades() {
        let mut guard = guard();
        guard.heartbeat(Ts::from_nanos(0));
        guard.tick(Ts::from_nanos(10_000_000_000));
        assert_eq!(guard.state(), StormState::Degraded);

        guard.heartbeat(Ts::from_nanos(10_000_000_001));
        guard.tick(Ts::from_nanos(10_000_000_002));
        assert_eq!(guard.state(), StormState::Normal);
    }
}
