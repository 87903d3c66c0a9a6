//! Storage substrate: in-memory tables made durable with a WAL and
//! periodic checkpoints.

pub mod checkpoint;
mod error;
pub mod model;
mod store;
pub mod tables;
pub mod tracked;
pub mod wal;

pub use error::StoreError;
pub use store::{InsertOutcome, RawReading, Store, StoreCounts};
pub use tracked::{Change, HistoryHook, HistoryLog, HistoryRow, TrackedTable};
