//! Slow-query plans logged by auto_explain with `log_format = json`:
//!
//! ```text
//! duration: 1234.567 ms  plan:
//! {
//!   "Query Text": "SELECT ...",
//!   "Query Identifier": -3162158357361384458,
//!   "Plan": { "Node Type": "Seq Scan", "Total Cost": 431.0, "Shared Read Blocks": 12, ... }
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::storage::model::QueryPlanEvent;

use super::LogRecord;

const DURATION_PREFIX: &str = "duration: ";
const PLAN_MARKER: &str = "plan:";
const BLOCK_SIZE: i64 = 8192;

#[derive(Deserialize)]
struct ExplainOutput {
    #[serde(rename = "Query Text")]
    query_text: Option<String>,
    #[serde(rename = "Query Identifier")]
    query_identifier: Option<i64>,
    #[serde(rename = "Plan")]
    plan: PlanNode,
}

/// Root node; buffer and timing figures are inclusive of children.
#[derive(Deserialize)]
struct PlanNode {
    #[serde(rename = "Total Cost")]
    total_cost: f64,
    #[serde(rename = "Shared Read Blocks", default)]
    shared_read_blocks: i64,
    #[serde(rename = "Local Read Blocks", default)]
    local_read_blocks: i64,
    #[serde(rename = "Temp Read Blocks", default)]
    temp_read_blocks: i64,
    #[serde(rename = "I/O Read Time")]
    io_read_time: Option<f64>,
    /// PG 17+
    #[serde(rename = "Shared I/O Read Time")]
    shared_io_read_time: Option<f64>,
}

/// Duration announced by a `duration: N ms  plan:` record, in milliseconds.
pub fn announced_duration(record: &LogRecord) -> Option<f64> {
    let rest = record.message.strip_prefix(DURATION_PREFIX)?;
    let (head, _) = rest.split_once(PLAN_MARKER)?;
    head.trim().strip_suffix("ms")?.trim().parse().ok()
}

/// Extract a plan event. `None` if the record is below `threshold` or the
/// payload cannot be decoded.
pub fn parse_plan(record: &LogRecord, threshold: Duration) -> Option<QueryPlanEvent> {
    let duration_ms = announced_duration(record)?;
    if !duration_ms.is_finite() || duration_ms < threshold.as_secs_f64() * 1000.0 {
        return None;
    }
    let (_, payload) = record.message.split_once(PLAN_MARKER)?;
    let payload = payload.trim();
    let explain: ExplainOutput = serde_json::from_str(payload).ok()?;

    let query_id = record
        .query_id
        .filter(|id| *id != 0)
        .or(explain.query_identifier.filter(|id| *id != 0))
        .or_else(|| explain.query_text.as_deref().map(fingerprint))?;

    let node = &explain.plan;
    let blocks = node.shared_read_blocks + node.local_read_blocks + node.temp_read_blocks;

    Some(QueryPlanEvent {
        timestamp: record.timestamp,
        query_id,
        duration_ms,
        total_cost: node.total_cost,
        bytes_read: blocks.saturating_mul(BLOCK_SIZE),
        io_read_time_ms: node
            .io_read_time
            .or(node.shared_io_read_time)
            .unwrap_or(0.0),
        database_name: record.database_name.clone(),
        user_name: record.user_name.clone(),
        query_text: explain.query_text,
        plan: payload.to_string(),
    })
}

/// Stable id for queries logged without a query identifier.
fn fingerprint(query: &str) -> i64 {
    xxh3_64(query.trim().as_bytes()) as i64
}
