//! Execution plane: position accounting and broker callback routing

#![warn(missing_docs)]

pub mod orders;
pub mod positions;
pub mod recon;
pub mod router;

pub use orders::{OrderAttribution, OrderDirectory};
pub use positions::{PositionBook, PositionEntry, PositionStore};
pub use recon::{BrokerSnapshot, ReconReport, SnapshotSource, reconcile};
pub use router::{ExecutionRouter, RawExecEnvelope, RawExecKind};
