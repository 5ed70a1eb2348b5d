//! The gateway: serialized pre-trade pipeline
//!
//! Every strategy intent passes through one loop that runs dedup, policy,
//! exposure and risk in a fixed order with no suspension points, then hands
//! approved commands to the order adapter. Callers are never blocked.

#![warn(missing_docs)]

pub mod dedup;
pub mod exposure;
pub mod policy;
pub mod risk;
pub mod service;

pub use dedup::{Decision, IdempotencyStore};
pub use exposure::{ExposureError, ExposureStore};
pub use policy::StormGuard;
pub use risk::{RiskEngine, RiskVerdict, RiskViolation};
pub use service::Gateway;
