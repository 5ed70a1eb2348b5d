//! Order adapter: approved commands to broker actions
//!
//! The last hop before the wire. Everything that can go wrong at the broker
//! boundary is absorbed here: stale commands, rate limits, broker outages,
//! and the dead letters left over when retries run out.

#![warn(missing_docs)]

pub mod adapter;
pub mod breaker;
pub mod dlq;
pub mod rate;

pub use adapter::{BrokerClient, BrokerError, OrderAdapter};
pub use breaker::{BreakerPosition, CircuitBreaker};
pub use dlq::{DeadLetter, DeadLetterQueue};
pub use rate::{AcquireOutcome, SlidingWindowLimiter};
