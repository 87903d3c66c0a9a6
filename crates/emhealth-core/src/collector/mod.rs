//! Metrics snapshot collector.
//!
//! Enumerates tracked resources of a class, reads the lock registry
//! snapshot, and appends one [`MetricSnapshot`](crate::storage::model::MetricSnapshot)
//! per resource per cycle:
//! - resources holding an `AccessExclusiveLock` get a zero-filled placeholder
//!   row (`locked = true`) instead of a counter read that would block
//! - a read that hits a lock taken after that snapshot also gets the placeholder
//! - resources that vanish between listing and reading are skipped and counted
//! - listing and lock-registry failures are systemic and abort the batch

#[cfg(test)]
pub(crate) mod mock;
mod pg_source;
mod snapshot;
mod source;

pub use pg_source::{PostgresSource, format_postgres_error};
pub use snapshot::{CollectSummary, MetricsCollector, StatementSummary};
pub use source::{LockRegistry, MetricsSource, Resource};

use crate::storage::StoreError;

/// Error type for metric sources.
#[derive(Debug)]
pub enum SourceError {
    /// Environment variable not set.
    EnvNotSet(String),
    /// Connection failed.
    ConnectionError(String),
    /// Query execution failed.
    QueryError(String),
    /// The resource disappeared between listing and reading it.
    ResourceGone(String),
    /// The read gave up waiting on a lock (`lock_not_available`).
    Locked(String),
}

impl SourceError {
    /// Failures confined to one resource; the batch continues.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::ResourceGone(_) | SourceError::QueryError(_) | SourceError::Locked(_)
        )
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::EnvNotSet(var) => write!(f, "PostgreSQL: {} not set", var),
            SourceError::ConnectionError(msg) => write!(f, "PostgreSQL: {}", msg),
            SourceError::QueryError(msg) => write!(f, "PostgreSQL query error: {}", msg),
            SourceError::ResourceGone(what) => write!(f, "resource vanished: {}", what),
            SourceError::Locked(msg) => write!(f, "PostgreSQL lock timeout: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Failure that aborts a collection batch.
#[derive(Debug)]
pub enum CollectError {
    Source(SourceError),
    Store(StoreError),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Source(e) => write!(f, "{}", e),
            CollectError::Store(e) => write!(f, "storage: {}", e),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Source(e) => Some(e),
            CollectError::Store(e) => Some(e),
        }
    }
}

impl From<SourceError> for CollectError {
    fn from(e: SourceError) -> Self {
        CollectError::Source(e)
    }
}

impl From<StoreError> for CollectError {
    fn from(e: StoreError) -> Self {
        CollectError::Store(e)
    }
}
