//! Events mined from the PostgreSQL log.

use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Natural key of a vacuum event. The log names tables, not oids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VacuumKey {
    /// `database.schema.table` as printed by autovacuum.
    pub table: String,
    pub started_at: Timestamp,
}

/// One completed autovacuum run.
///
/// Source: `log_autovacuum_min_duration` output
/// (`automatic vacuum of table "db.schema.table": index scans: N ...`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacuumEvent {
    pub table: String,
    /// Log timestamp minus elapsed time.
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub elapsed_ms: i64,
    pub index_scans: u32,
    pub pages_removed: i64,
    pub pages_remaining: i64,
    pub tuples_removed: i64,
    pub tuples_remaining: i64,
    /// `to prevent wraparound` present in the message.
    pub wraparound: bool,
    pub aggressive: bool,
    /// Full message text.
    pub detail: String,
}

impl VacuumEvent {
    pub fn key(&self) -> VacuumKey {
        VacuumKey {
            table: self.table.clone(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanKey {
    pub timestamp: Timestamp,
    pub query_id: i64,
}

/// Slow query captured by auto_explain.
///
/// Source: `auto_explain.log_format = json` output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlanEvent {
    pub timestamp: Timestamp,
    pub query_id: i64,
    pub duration_ms: f64,
    /// Source: `Plan."Total Cost"`
    pub total_cost: f64,
    /// Shared + local + temp read blocks, times the 8 KiB block size.
    pub bytes_read: i64,
    /// Source: `Plan."I/O Read Time"` (`"Shared I/O Read Time"` on PG 17+)
    pub io_read_time_ms: f64,
    pub database_name: Option<String>,
    pub user_name: Option<String>,
    pub query_text: Option<String>,
    /// Raw JSON payload.
    pub plan: String,
}

impl QueryPlanEvent {
    pub fn key(&self) -> PlanKey {
        PlanKey {
            timestamp: self.timestamp,
            query_id: self.query_id,
        }
    }
}
