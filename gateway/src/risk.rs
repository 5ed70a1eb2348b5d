//! Pre-trade risk validators
//!
//! All scaled-integer arithmetic, no suspension points. Every rejection
//! carries the threshold and the observed value so the decision is
//! auditable after the fact.

use common::config::RiskConfig;
use common::events::{IntentType, OrderIntent};
use common::{ReasonCode, Side, StrategyId, SymbolDirectory, Ts};
use execution::PositionStore;
use lob::BookViews;
use metrics::counter;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// A failed validator, with audit context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskViolation {
    /// Why
    pub reason: ReasonCode,
    /// Threshold that was evaluated
    pub threshold: i64,
    /// Observed value
    pub value: i64,
}

/// Validator outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    /// All validators passed
    Pass,
    /// Passed, but the soft order-rate cap is breached; StormGuard should
    /// degrade
    PassDegraded,
    /// Rejected
    Reject(RiskViolation),
}

/// The validator chain
pub struct RiskEngine {
    config: RiskConfig,
    books: BookViews,
    positions: Arc<PositionStore>,
    symbols: Arc<SymbolDirectory>,
    rate_windows: FxHashMap<StrategyId, VecDeque<i64>>,
}

impl RiskEngine {
    /// Create the engine over read-only state views
    #[must_use]
    pub fn new(
        config: RiskConfig,
        books: BookViews,
        positions: Arc<PositionStore>,
        symbols: Arc<SymbolDirectory>,
    ) -> Self {
        Self {
            config,
            books,
            positions,
            symbols,
            rate_windows: FxHashMap::default(),
        }
    }

    /// Run the validator chain on an intent
    ///
    /// CANCELs skip everything except the rate window: cancels must always
    /// be able to flow, but they still count against the broker budget.
    pub fn evaluate(&mut self, intent: &OrderIntent, now: Ts) -> RiskVerdict {
        let rate = self.check_rate(intent.strategy, now);
        if let Some(v) = rate_violation(&rate, &self.config) {
            counter!("risk_reject_total", "reason" => v.reason.as_str()).increment(1);
            return RiskVerdict::Reject(v);
        }

        if intent.intent_type != IntentType::Cancel {
            if let Err(v) = self
                .check_price_band(intent)
                .and_then(|()| self.check_order_size(intent))
                .and_then(|()| self.check_notional(intent))
                .and_then(|()| self.check_position(intent))
            {
                counter!("risk_reject_total", "reason" => v.reason.as_str()).increment(1);
                return RiskVerdict::Reject(v);
            }
        }

        if rate.soft_breached {
            RiskVerdict::PassDegraded
        } else {
            RiskVerdict::Pass
        }
    }

    /// Price within `band_ticks` of the best opposite level, falling back
    /// to the last trade; no reference means no band to enforce
    fn check_price_band(&self, intent: &OrderIntent) -> Result<(), RiskViolation> {
        let Some(meta) = self.symbols.meta(intent.symbol) else {
            return Err(RiskViolation {
                reason: ReasonCode::UnknownSymbol,
                threshold: 0,
                value: 0,
            });
        };
        let Some(view) = self.books.get(intent.symbol) else {
            return Ok(());
        };
        let snapshot = view.load();
        let reference = match intent.side {
            Side::Buy => snapshot.asks.as_slice().first().map(|l| l.price),
            Side::Sell => snapshot.bids.as_slice().first().map(|l| l.price),
        }
        .or(snapshot.last_trade.map(|(px, _)| px));
        let Some(reference) = reference else {
            return Ok(());
        };

        let band = self.config.band_ticks * meta.tick_size;
        let distance = (intent.price.as_i64() - reference.as_i64()).abs();
        if distance > band {
            return Err(RiskViolation {
                reason: ReasonCode::PriceBand,
                threshold: band,
                value: distance,
            });
        }
        Ok(())
    }

    fn check_order_size(&self, intent: &OrderIntent) -> Result<(), RiskViolation> {
        let qty = intent.qty.as_i64();
        if qty > self.config.max_qty {
            return Err(RiskViolation {
                reason: ReasonCode::MaxQty,
                threshold: self.config.max_qty,
                value: qty,
            });
        }
        Ok(())
    }

    fn check_notional(&self, intent: &OrderIntent) -> Result<(), RiskViolation> {
        let notional = intent.price.as_i64().saturating_mul(intent.qty.as_i64());
        if notional > self.config.max_notional {
            return Err(RiskViolation {
                reason: ReasonCode::MaxNotional,
                threshold: self.config.max_notional,
                value: notional,
            });
        }
        Ok(())
    }

    /// Settled position plus this order stays within the cap; the
    /// pending-inclusive aggregate is enforced by the exposure store
    fn check_position(&self, intent: &OrderIntent) -> Result<(), RiskViolation> {
        let net = self.positions.net_qty(intent.strategy, intent.symbol);
        let projected = net + intent.signed_qty();
        if projected.abs() > self.config.max_position {
            return Err(RiskViolation {
                reason: ReasonCode::MaxPosition,
                threshold: self.config.max_position,
                value: projected,
            });
        }
        Ok(())
    }

    fn check_rate(&mut self, strategy: StrategyId, now: Ts) -> RateStatus {
        let window = self.rate_windows.entry(strategy).or_default();
        let cutoff = now.as_nanos() - self.config.rate_window_ns;
        while window.front().is_some_and(|ts| *ts < cutoff) {
            window.pop_front();
        }

        if window.len() >= self.config.rate_hard {
            return RateStatus {
                hard_breached: true,
                soft_breached: true,
                in_window: window.len(),
            };
        }
        window.push_back(now.as_nanos());
        RateStatus {
            hard_breached: false,
            soft_breached: window.len() >= self.config.rate_soft,
            in_window: window.len(),
        }
    }
}

struct RateStatus {
    hard_breached: bool,
    soft_breached: bool,
    in_window: usize,
}

fn rate_violation(rate: &RateStatus, config: &RiskConfig) -> Option<RiskViolation> {
    rate.hard_breached.then(|| RiskViolation {
        reason: ReasonCode::OrderRate,
        threshold: config.rate_hard as i64,
        value: rate.in_window as i64,
    })
}
