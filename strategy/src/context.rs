//! Dispatch context handed to strategy callbacks
//!
//! Read-only views of books, positions and metadata, plus the order helper
//! that stamps idempotency keys and trace ids. References point one way:
//! strategies borrow the context, never the scheduler.

use common::events::{IdempotencyKey, IntentType, OrderIntent, StormState, Tif};
use common::{Px, Qty, Side, StrategyId, Symbol, SymbolDirectory, Timebase, Ts};
use execution::PositionBook;
use lob::{BookSnapshot, BookViews};
use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::sync::Arc;

/// Per-dispatch context
pub struct StrategyContext<'a> {
    books: &'a BookViews,
    positions: &'a Arc<PositionBook>,
    symbols: &'a SymbolDirectory,
    storm: StormState,
    strategy: StrategyId,
    now: Ts,
    epoch_bucket: i64,
    intent_seq: &'a mut u64,
    default_ttl_ns: i64,
    out: &'a mut Vec<OrderIntent>,
}

impl<'a> StrategyContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        books: &'a BookViews,
        positions: &'a Arc<PositionBook>,
        symbols: &'a SymbolDirectory,
        storm: StormState,
        strategy: StrategyId,
        now: Ts,
        epoch_bucket_ns: i64,
        intent_seq: &'a mut u64,
        default_ttl_ns: i64,
        out: &'a mut Vec<OrderIntent>,
    ) -> Self {
        Self {
            books,
            positions,
            symbols,
            storm,
            strategy,
            now,
            epoch_bucket: Timebase::epoch_bucket(now, epoch_bucket_ns),
            intent_seq,
            default_ttl_ns,
            out,
        }
    }

    /// Latest book snapshot for `symbol`, when one has been published
    #[must_use]
    pub fn book(&self, symbol: Symbol) -> Option<BookSnapshot> {
        self.books.get(symbol).map(|view| view.load())
    }

    /// Net position of this strategy in `symbol`
    #[must_use]
    pub fn net_qty(&self, symbol: Symbol) -> i64 {
        self.positions
            .get(&(self.strategy, symbol))
            .map_or(0, |e| e.net_qty)
    }

    /// Current policy mode
    #[must_use]
    pub const fn storm_state(&self) -> StormState {
        self.storm
    }

    /// Symbol metadata directory
    #[must_use]
    pub const fn symbols(&self) -> &SymbolDirectory {
        self.symbols
    }

    /// Dispatch timestamp for this batch
    #[must_use]
    pub const fn now(&self) -> Ts {
        self.now
    }

    /// Emit an order intent
    ///
    /// Snaps the price to the symbol's tick, stamps the idempotency key from
    /// the intent's identity fields plus the epoch bucket, and assigns a
    /// monotonically increasing intent id.
    #[allow(clippy::too_many_arguments)]
    pub fn place_order(
        &mut self,
        symbol: Symbol,
        side: Side,
        price: Px,
        qty: i64,
        tif: Tif,
        intent_type: IntentType,
        target_order_id: Option<u64>,
    ) -> u64 {
        let price = match self.symbols.meta(symbol) {
            Some(meta) => meta.codec.round_to_tick(price, meta.tick_size),
            None => price,
        };

        *self.intent_seq += 1;
        let intent_id = *self.intent_seq;
        let key = idempotency_key(
            self.strategy,
            symbol,
            intent_type,
            side,
            price,
            qty,
            self.epoch_bucket,
        );

        self.out.push(OrderIntent {
            intent_id,
            strategy: self.strategy,
            symbol,
            intent_type,
            side,
            price,
            qty: Qty::from_i64(qty),
            tif,
            target_order_id,
            idempotency_key: key,
            ttl_ns: self.default_ttl_ns,
            trace_id: (u128::from(self.now.as_nanos().max(0) as u64) << 64)
                | u128::from(intent_id),
            created: self.now,
        });
        intent_id
    }

    /// Cancel helper: CANCEL intents carry no price or size
    pub fn cancel_order(&mut self, symbol: Symbol, side: Side, target_order_id: u64) -> u64 {
        self.place_order(
            symbol,
            side,
            Px::ZERO,
            0,
            Tif::Limit,
            IntentType::Cancel,
            Some(target_order_id),
        )
    }
}

/// Deterministic intent fingerprint
///
/// Two Fx passes over the identity tuple, the second seeded from the first,
/// concatenated into 128 bits. Identical intents in the same epoch bucket
/// collide by construction; that is the dedup contract.
#[must_use]
pub fn idempotency_key(
    strategy: StrategyId,
    symbol: Symbol,
    intent_type: IntentType,
    side: Side,
    price: Px,
    qty: i64,
    epoch_bucket: i64,
) -> IdempotencyKey {
    let mut lo = FxHasher::default();
    write_fields(&mut lo, strategy, symbol, intent_type, side, price, qty, epoch_bucket);
    let a = lo.finish();

    let mut hi = FxHasher::default();
    hi.write_u64(a ^ 0x9E37_79B9_7F4A_7C15);
    write_fields(&mut hi, strategy, symbol, intent_type, side, price, qty, epoch_bucket);
    let b = hi.finish();

    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&a.to_le_bytes());
    bytes[8..].copy_from_slice(&b.to_le_bytes());
    IdempotencyKey(bytes)
}

#[allow(clippy::too_many_arguments)]
fn write_fields(
    hasher: &mut FxHasher,
    strategy: StrategyId,
    symbol: Symbol,
    intent_type: IntentType,
    side: Side,
    price: Px,
    qty: i64,
    epoch_bucket: i64,
) {
    hasher.write_u16(strategy.0);
    hasher.write_u32(symbol.0);
    hasher.write_u8(match intent_type {
        IntentType::New => 0,
        IntentType::Amend => 1,
        IntentType::Cancel => 2,
    });
    hasher.write_u8(match side {
        Side::Buy => 0,
        Side::Sell => 1,
    });
    hasher.write_i64(price.as_i64());
    hasher.write_i64(qty);
    hasher.write_i64(epoch_bucket);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = idempotency_key(
            StrategyId::new(1),
            Symbol::new(2),
            IntentType::New,
            Side::Buy,
            Px::from_scaled(1_000_000),
            10,
            7,
        );
        let b = idempotency_key(
            StrategyId::new(1),
            Symbol::new(2),
            IntentType::New,
            Side::Buy,
            Px::from_scaled(1_000_000),
            10,
            7,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_varies_with_fields() {
        let base = idempotency_key(
            StrategyId::new(1),
            Symbol::new(2),
            IntentType::New,
            Side::Buy,
            Px::from_scaled(1_000_000),
            10,
            7,
        );
        let other_epoch = idempotency_key(
            StrategyId::new(1),
            Symbol::new(2),
            IntentType::New,
            Side::Buy,
            Px::from_scaled(1_000_000),
            10,
            8,
        );
        let other_side = idempotency_key(
            StrategyId::new(1),
            Symbol::new(2),
            IntentType::New,
            Side::Sell,
            Px::from_scaled(1_000_000),
            10,
            7,
        );
        assert_ne!(base, other_epoch);
        assert_ne!(base, other_side);
    }

    #[test]
    fn test_place_order_snaps_to_tick_and_increments_ids() {
        let symbols = SymbolDirectory::empty();
        let sym = symbols.register("IF2409", "CFFEX", 4, 2000);
        let books = BookViews::new();
        let positions = Arc::new(PositionBook::default());
        let mut intent_seq = 0u64;
        let mut out = Vec::new();

        let mut ctx = StrategyContext::new(
            &books,
            &positions,
            &symbols,
            StormState::Normal,
            StrategyId::new(1),
            Ts::from_nanos(1_000),
            1_000_000_000,
            &mut intent_seq,
            500_000_000,
            &mut out,
        );

        // 100.015 -> tick 0.2 -> snaps to 100.0
        let id1 = ctx.place_order(
            sym,
            Side::Buy,
            Px::from_scaled(1_000_150),
            5,
            Tif::Limit,
            IntentType::New,
            None,
        );
        let id2 = ctx.place_order(
            sym,
            Side::Sell,
            Px::from_scaled(1_001_000),
            5,
            Tif::Ioc,
            IntentType::New,
            None,
        );

        assert_eq!(out.len(), 2);
        assert!(id2 > id1);
        assert_eq!(out[0].price, Px::from_scaled(1_000_000));
        assert_eq!(out[0].qty, Qty::from_i64(5));
        assert_ne!(out[0].idempotency_key, out[1].idempotency_key);
        assert_ne!(out[0].trace_id, out[1].trace_id);
    }
}
