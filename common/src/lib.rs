//! Core types shared across the Velostream pipeline
//!
//! Everything on the hot path is expressed in scaled integers; floats only
//! appear at the ingress boundary (payload decoding) and in reporting.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod codec;
pub mod config;
pub mod events;
pub mod instrument;
pub mod reason;
pub mod types;

pub use clock::Timebase;
pub use codec::PriceCodec;
pub use config::{ConfigError, CoreConfig, RecorderMode};
pub use events::*;
pub use instrument::{SymbolDirectory, SymbolMeta};
pub use reason::ReasonCode;
pub use types::{AccountId, Px, Qty, Side, StrategyId, Symbol, Ts};
