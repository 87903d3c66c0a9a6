//! PostgreSQL health snapshots and their rollups.
//!
//! Snapshots are append-only, one row per (resource, collection instant).
//! Counters are cumulative since the last statistics reset; rollups turn
//! them into per-bucket deltas.

use serde::{Deserialize, Serialize};

use super::{Series, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    Database,
    Table,
    Index,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [
        ResourceClass::Database,
        ResourceClass::Table,
        ResourceClass::Index,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::Database => "database",
            ResourceClass::Table => "table",
            ResourceClass::Index => "index",
        }
    }

    pub fn parse(s: &str) -> Option<ResourceClass> {
        match s {
            "database" => Some(ResourceClass::Database),
            "table" => Some(ResourceClass::Table),
            "index" => Some(ResourceClass::Index),
            _ => None,
        }
    }

    /// Cumulative counters, in the order they appear in `Readings::counters`.
    pub fn counter_names(self) -> &'static [&'static str] {
        match self {
            // Source: pg_stat_database
            ResourceClass::Database => &[
                "xact_commit",
                "xact_rollback",
                "blks_read",
                "blks_hit",
                "tup_returned",
                "tup_fetched",
                "tup_inserted",
                "tup_updated",
                "tup_deleted",
                "conflicts",
                "temp_files",
                "temp_bytes",
                "deadlocks",
            ],
            // Source: pg_stat_user_tables + pg_statio_user_tables
            ResourceClass::Table => &[
                "seq_scan",
                "seq_tup_read",
                "idx_scan",
                "idx_tup_fetch",
                "n_tup_ins",
                "n_tup_upd",
                "n_tup_del",
                "n_tup_hot_upd",
                "vacuum_count",
                "autovacuum_count",
                "analyze_count",
                "autoanalyze_count",
                "heap_blks_read",
                "heap_blks_hit",
                "idx_blks_read",
                "idx_blks_hit",
            ],
            // Source: pg_stat_user_indexes + pg_statio_user_indexes
            ResourceClass::Index => &[
                "idx_scan",
                "idx_tup_read",
                "idx_tup_fetch",
                "idx_blks_read",
                "idx_blks_hit",
            ],
        }
    }

    /// Point-in-time values, in the order of `Readings::gauges`.
    pub fn gauge_names(self) -> &'static [&'static str] {
        match self {
            ResourceClass::Database => &["size_bytes", "numbackends"],
            ResourceClass::Table => &["size_bytes", "n_live_tup", "n_dead_tup"],
            ResourceClass::Index => &["size_bytes"],
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog identity of a tracked resource.
///
/// Databases use `object_oid == database_oid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub database_oid: u32,
    pub object_oid: u32,
}

impl ResourceId {
    pub fn database(oid: u32) -> Self {
        Self {
            database_oid: oid,
            object_oid: oid,
        }
    }

    /// Packed form used as the rollup resource key.
    pub fn key(self) -> u64 {
        ((self.database_oid as u64) << 32) | self.object_oid as u64
    }
}

/// Counter values read for one resource.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Readings {
    pub counters: Vec<i64>,
    pub gauges: Vec<i64>,
}

impl Readings {
    /// Zero-filled readings written for an exclusively locked resource.
    pub fn zeroed(class: ResourceClass) -> Self {
        Self {
            counters: vec![0; class.counter_names().len()],
            gauges: vec![0; class.gauge_names().len()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub class: ResourceClass,
    pub resource: ResourceId,
    /// `datname`, or `schemaname.relname` for tables and indexes.
    pub name: String,
    pub collected_at: Timestamp,
    /// Resource held an `AccessExclusiveLock` at collection time;
    /// `readings` are zero-filled.
    pub locked: bool,
    pub readings: Readings,
}

/// Per-query statistics from pg_stat_statements, folded over users and
/// databases.
///
/// Source: `pg_stat_statements`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementStat {
    pub collected_at: Timestamp,
    /// Source: `pg_stat_statements.queryid`
    pub query_id: i64,
    /// Normalized query text (first seen).
    pub query: String,
    pub calls: i64,
    /// Milliseconds.
    /// Source: `pg_stat_statements.total_exec_time` (PG 13+)
    pub total_exec_time: f64,
    pub rows: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub shared_blks_written: i64,
    pub temp_blks_read: i64,
    pub temp_blks_written: i64,
}

impl StatementStat {
    pub const COUNTER_NAMES: [&'static str; 8] = [
        "calls",
        "total_exec_time",
        "rows",
        "shared_blks_hit",
        "shared_blks_read",
        "shared_blks_written",
        "temp_blks_read",
        "temp_blks_written",
    ];

    pub fn counter_values(&self) -> Vec<f64> {
        vec![
            self.calls as f64,
            self.total_exec_time,
            self.rows as f64,
            self.shared_blks_hit as f64,
            self.shared_blks_read as f64,
            self.shared_blks_written as f64,
            self.temp_blks_read as f64,
            self.temp_blks_written as f64,
        ]
    }

    /// Add another row for the same query id (different user / database).
    pub fn fold(&mut self, other: &StatementStat) {
        self.calls += other.calls;
        self.total_exec_time += other.total_exec_time;
        self.rows += other.rows;
        self.shared_blks_hit += other.shared_blks_hit;
        self.shared_blks_read += other.shared_blks_read;
        self.shared_blks_written += other.shared_blks_written;
        self.temp_blks_read += other.temp_blks_read;
        self.temp_blks_written += other.temp_blks_written;
    }
}

/// Cumulative series that can be rolled up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RollupSeries {
    DatabaseSnapshots,
    TableSnapshots,
    IndexSnapshots,
    StatementStats,
}

impl RollupSeries {
    pub const ALL: [RollupSeries; 4] = [
        RollupSeries::DatabaseSnapshots,
        RollupSeries::TableSnapshots,
        RollupSeries::IndexSnapshots,
        RollupSeries::StatementStats,
    ];

    pub fn counter_names(self) -> &'static [&'static str] {
        match self {
            RollupSeries::DatabaseSnapshots => ResourceClass::Database.counter_names(),
            RollupSeries::TableSnapshots => ResourceClass::Table.counter_names(),
            RollupSeries::IndexSnapshots => ResourceClass::Index.counter_names(),
            RollupSeries::StatementStats => &StatementStat::COUNTER_NAMES,
        }
    }

    /// Rollup fed by a raw series, if any.
    pub fn for_series(series: Series) -> Option<RollupSeries> {
        match series {
            Series::DatabaseSnapshots => Some(RollupSeries::DatabaseSnapshots),
            Series::TableSnapshots => Some(RollupSeries::TableSnapshots),
            Series::IndexSnapshots => Some(RollupSeries::IndexSnapshots),
            Series::StatementStats => Some(RollupSeries::StatementStats),
            _ => None,
        }
    }

    pub fn class(self) -> Option<ResourceClass> {
        match self {
            RollupSeries::DatabaseSnapshots => Some(ResourceClass::Database),
            RollupSeries::TableSnapshots => Some(ResourceClass::Table),
            RollupSeries::IndexSnapshots => Some(ResourceClass::Index),
            RollupSeries::StatementStats => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RollupSeries::DatabaseSnapshots => "database_snapshots",
            RollupSeries::TableSnapshots => "table_snapshots",
            RollupSeries::IndexSnapshots => "index_snapshots",
            RollupSeries::StatementStats => "statement_stats",
        }
    }
}

impl std::fmt::Display for RollupSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downsampled bucket for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub bucket_start: Timestamp,
    /// Sum of per-sample deltas, indexed like `RollupSeries::counter_names`.
    pub deltas: Vec<f64>,
    /// Counter resets observed inside this bucket.
    pub resets: u32,
    /// Raw readings merged into this bucket.
    pub samples: u32,
}

impl RollupBucket {
    pub fn empty(bucket_start: Timestamp, width: usize) -> Self {
        Self {
            bucket_start,
            deltas: vec![0.0; width],
            resets: 0,
            samples: 0,
        }
    }
}
