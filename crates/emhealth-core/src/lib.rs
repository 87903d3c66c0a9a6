//! emhealth-core: instrument health engine.
//!
//! Provides:
//! - `storage`: WAL-backed tables, change tracking with history, checkpoints
//! - `collector`: PostgreSQL metrics snapshots that never wait on locks
//! - `miner`: autovacuum and auto_explain events from csvlog / jsonlog
//! - `retention`: per-series purge and incremental counter rollups
//! - `session`: debounced session intervals from instrument state series
//! - `ingest`: import batches and telemetry rows
//! - `cycle`: one scheduled pass over all of the above
//! - `config`: TOML engine configuration
//! - `util`: duration and timestamp helpers

pub mod collector;
pub mod config;
pub mod cycle;
pub mod ingest;
pub mod miner;
pub mod retention;
pub mod session;
pub mod storage;
pub mod util;

pub use config::{ConfigError, EngineConfig};
pub use cycle::{CycleError, CycleSummary, Engine};
pub use storage::{Store, StoreError};
