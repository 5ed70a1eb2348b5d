//! In-process event fan-out and bounded stage queues
//!
//! The ring is single-producer / multi-consumer: the market-data stage
//! publishes, the strategy runner and the recorder tail it independently.
//! Slow consumers never block the producer; overflow is counted and dropped.

#![warn(missing_docs)]

pub mod queue;
pub mod ring;

pub use queue::{StageReceiver, StageSender, bounded};
pub use ring::{PublishOutcome, Ring, RingConsumer};
