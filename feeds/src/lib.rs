//! Market-data ingress: normalization and the feed stage
//!
//! Broker callbacks enqueue raw payloads stamped with a monotonic receive
//! time; nothing else runs on callback threads. The stage thread normalizes,
//! applies to the book engine and fans out on the bus.

#![warn(missing_docs)]

pub mod normalize;
pub mod payload;
pub mod stage;

pub use normalize::{NormalizeError, Normalizer};
pub use payload::{RawEnvelope, RawKind};
pub use stage::MarketDataStage;
