//! Durable capture: batchers, WAL, disk watchdog, loader
//!
//! WAL-first by default: batches are acknowledged once fsync returns on the
//! segment file, and a separate loader drains closed segments into the
//! column store. The hot path never waits on the store.

#![warn(missing_docs)]

pub mod batcher;
pub mod disk;
pub mod loader;
pub mod segment;
pub mod service;
pub mod store;
pub mod wal;

pub use batcher::BatcherSet;
pub use disk::{DiskLevel, DiskPressureMonitor};
pub use loader::Loader;
pub use segment::{SegmentReader, SegmentWriter};
pub use service::Recorder;
pub use store::{ColumnStore, MemStore};
pub use wal::Wal;
