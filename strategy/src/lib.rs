//! Strategy dispatch
//!
//! Strategies are plain state machines behind a capability trait. The runner
//! drives them sequentially in registration order, so a given event stream
//! always produces the same intent stream.

#![warn(missing_docs)]

pub mod breaker;
pub mod context;
pub mod momentum;
pub mod runner;

pub use breaker::{BreakerState, StrategyBreaker};
pub use context::StrategyContext;
pub use momentum::ImbalanceMomentum;
pub use runner::StrategyRunner;

use common::events::{FillEvent, MarketEvent};
use common::StrategyId;

/// A trading strategy
///
/// Handlers run on the single runner thread; no interior synchronization is
/// needed. Intents are emitted through the context, never returned.
pub trait Strategy: Send {
    /// Stable identifier, used for intent attribution
    fn id(&self) -> StrategyId;

    /// Human-readable name, used in logs and metric labels
    fn name(&self) -> &'static str;

    /// Market event callback
    fn on_event(&mut self, ctx: &mut StrategyContext<'_>, event: &MarketEvent);

    /// Fill callback; default is to ignore
    fn on_fill(&mut self, _ctx: &mut StrategyContext<'_>, _fill: &FillEvent) {}
}
