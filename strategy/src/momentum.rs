//! Imbalance-momentum strategy
//!
//! Leans on book imbalance: a heavily bid book gets a passive buy at the
//! best bid, a heavily offered one a passive sell at the best ask. One
//! working order per symbol; integer thresholds only.

use crate::context::StrategyContext;
use crate::Strategy;
use common::events::{IntentType, MarketEvent, Tif};
use common::{Side, StrategyId, Symbol};
use rustc_hash::FxHashMap;

/// Imbalance thresholds are expressed as numerator/denominator pairs to
/// stay in integer math: trigger when `|num| * den_scale > den * num_scale`.
pub struct ImbalanceMomentum {
    id: StrategyId,
    /// Trigger ratio numerator (e.g. 1 of 2 = imbalance beyond 50%)
    trigger_num: i64,
    /// Trigger ratio denominator
    trigger_den: i64,
    /// Order size
    qty: i64,
    /// Symbols with an intent already working this epoch
    working: FxHashMap<Symbol, u64>,
}

impl ImbalanceMomentum {
    /// Create the strategy
    #[must_use]
    pub fn new(id: StrategyId, trigger_num: i64, trigger_den: i64, qty: i64) -> Self {
        Self {
            id,
            trigger_num,
            trigger_den,
            qty,
            working: FxHashMap::default(),
        }
    }
}

impl Strategy for ImbalanceMomentum {
    fn id(&self) -> StrategyId {
        self.id
    }

    fn name(&self) -> &'static str {
        "imbalance_momentum"
    }

    fn on_event(&mut self, ctx: &mut StrategyContext<'_>, event: &MarketEvent) {
        let MarketEvent::Stats(stats) = event else {
            return;
        };
        if self.working.contains_key(&stats.symbol) || stats.imbalance_den == 0 {
            return;
        }

        // |imbalance| > trigger_num / trigger_den
        let lean = stats.imbalance_num * self.trigger_den;
        let threshold = stats.imbalance_den * self.trigger_num;
        let (side, price) = if lean > threshold {
            (Side::Buy, stats.best_bid)
        } else if lean < -threshold {
            (Side::Sell, stats.best_ask)
        } else {
            return;
        };

        let intent_id = ctx.place_order(
            stats.symbol,
            side,
            price,
            self.qty,
            Tif::Limit,
            IntentType::New,
            None,
        );
        self.working.insert(stats.symbol, intent_id);
    }

    fn on_fill(&mut self, _ctx: &mut StrategyContext<'_>, fill: &common::events::FillEvent) {
        self.working.remove(&fill.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::events::{LobStats, StormFlag, StormState};
    use common::{Px, Qty, SymbolDirectory, Ts};
    use execution::PositionBook;
    use lob::BookViews;
    use std::sync::Arc;

    fn stats(symbol: Symbol, bid_depth: i64, ask_depth: i64) -> MarketEvent {
        MarketEvent::Stats(LobStats {
            symbol,
            best_bid: Px::from_scaled(1_000_000),
            best_ask: Px::from_scaled(1_001_000),
            mid_x2: 2_001_000,
            spread: 1_000,
            bid_depth: Qty::from_i64(bid_depth),
            ask_depth: Qty::from_i64(ask_depth),
            imbalance_num: bid_depth - ask_depth,
            imbalance_den: bid_depth + ask_depth,
            ts: Ts::from_nanos(1),
        })
    }

    fn dispatch(
        strategy: &mut ImbalanceMomentum,
        symbols: &SymbolDirectory,
        event: &MarketEvent,
        seq: &mut u64,
    ) -> Vec<common::events::OrderIntent> {
        let books = BookViews::new();
        let positions = Arc::new(PositionBook::default());
        let mut out = Vec::new();
        let mut ctx = StrategyContext::new(
            &books,
            &positions,
            symbols,
            StormState::Normal,
            strategy.id(),
            Ts::from_nanos(1_000),
            1_000_000_000,
            seq,
            500_000_000,
            &mut out,
        );
        strategy.on_event(&mut ctx, event);
        out
    }

    #[test]
    fn test_leans_with_the_book() {
        let symbols = SymbolDirectory::empty();
        let sym = symbols.register("IF2409", "CFFEX", 4, 2000);
        let mut strategy = ImbalanceMomentum::new(StrategyId::new(1), 1, 2, 2);
        let mut seq = 0;

        // 80/20 bid-heavy: buys at the bid
        let intents = dispatch(&mut strategy, &symbols, &stats(sym, 80, 20), &mut seq);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Buy);
        assert_eq!(intents[0].price, Px::from_scaled(1_000_000));

        // Working order: no second intent until a fill clears it
        let intents = dispatch(&mut strategy, &symbols, &stats(sym, 90, 10), &mut seq);
        assert!(intents.is_empty());
    }

    #[test]
    fn test_balanced_book_stays_quiet() {
        let symbols = SymbolDirectory::empty();
        let sym = symbols.register("IF2409", "CFFEX", 4, 2000);
        let mut strategy = ImbalanceMomentum::new(StrategyId::new(1), 1, 2, 2);
        let mut seq = 0;

        let intents = dispatch(&mut strategy, &symbols, &stats(sym, 55, 45), &mut seq);
        assert!(intents.is_empty());
    }

    #[test]
    fn test_ask_heavy_sells() {
        let symbols = SymbolDirectory::empty();
        let sym = symbols.register("IF2409", "CFFEX", 4, 2000);
        let mut strategy = ImbalanceMomentum::new(StrategyId::new(1), 1, 2, 2);
        let mut seq = 0;

        let intents = dispatch(&mut strategy, &symbols, &stats(sym, 10, 90), &mut seq);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Sell);
        assert_eq!(intents[0].price, Px::from_scaled(1_001_000));
    }
}
