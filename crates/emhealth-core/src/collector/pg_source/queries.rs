//! SQL for the PostgreSQL metrics source.
//!
//! Listing and per-resource reads are split so that a locked relation is
//! never touched: `pg_relation_size()` takes `AccessShareLock` and would
//! queue behind an `AccessExclusiveLock`.

pub(super) const CURRENT_DATABASE_OID: &str =
    "SELECT oid::bigint FROM pg_database WHERE datname = current_database()";

pub(super) const LIST_DATABASES: &str = r#"
    SELECT d.oid::bigint, d.datname
    FROM pg_database d
    WHERE NOT d.datistemplate AND d.datallowconn
    ORDER BY d.oid
"#;

pub(super) const LIST_TABLES: &str = r#"
    SELECT relid::bigint, COALESCE(schemaname, ''), COALESCE(relname, '')
    FROM pg_stat_user_tables
    ORDER BY relid
"#;

pub(super) const LIST_INDEXES: &str = r#"
    SELECT indexrelid::bigint, relid::bigint,
           COALESCE(schemaname, ''), COALESCE(indexrelname, '')
    FROM pg_stat_user_indexes
    ORDER BY indexrelid
"#;

/// Granted relation-level `AccessExclusiveLock`s. Reading pg_locks never
/// waits on the locks it reports.
pub(super) const LOCK_REGISTRY: &str = r#"
    SELECT COALESCE(database, 0)::bigint, relation::bigint
    FROM pg_locks
    WHERE locktype = 'relation'
      AND mode = 'AccessExclusiveLock'
      AND granted
      AND relation IS NOT NULL
"#;

pub(super) const DATABASE_COUNTERS: &str = r#"
    SELECT
        COALESCE(xact_commit, 0)::bigint,
        COALESCE(xact_rollback, 0)::bigint,
        COALESCE(blks_read, 0)::bigint,
        COALESCE(blks_hit, 0)::bigint,
        COALESCE(tup_returned, 0)::bigint,
        COALESCE(tup_fetched, 0)::bigint,
        COALESCE(tup_inserted, 0)::bigint,
        COALESCE(tup_updated, 0)::bigint,
        COALESCE(tup_deleted, 0)::bigint,
        COALESCE(conflicts, 0)::bigint,
        COALESCE(temp_files, 0)::bigint,
        COALESCE(temp_bytes, 0)::bigint,
        COALESCE(deadlocks, 0)::bigint,
        COALESCE(pg_database_size(datid), 0)::bigint,
        COALESCE(numbackends, 0)::bigint
    FROM pg_stat_database
    WHERE datid::bigint = $1
"#;

pub(super) const TABLE_COUNTERS: &str = r#"
    SELECT
        COALESCE(s.seq_scan, 0)::bigint,
        COALESCE(s.seq_tup_read, 0)::bigint,
        COALESCE(s.idx_scan, 0)::bigint,
        COALESCE(s.idx_tup_fetch, 0)::bigint,
        COALESCE(s.n_tup_ins, 0)::bigint,
        COALESCE(s.n_tup_upd, 0)::bigint,
        COALESCE(s.n_tup_del, 0)::bigint,
        COALESCE(s.n_tup_hot_upd, 0)::bigint,
        COALESCE(s.vacuum_count, 0)::bigint,
        COALESCE(s.autovacuum_count, 0)::bigint,
        COALESCE(s.analyze_count, 0)::bigint,
        COALESCE(s.autoanalyze_count, 0)::bigint,
        COALESCE(io.heap_blks_read, 0)::bigint,
        COALESCE(io.heap_blks_hit, 0)::bigint,
        COALESCE(io.idx_blks_read, 0)::bigint,
        COALESCE(io.idx_blks_hit, 0)::bigint,
        COALESCE(pg_relation_size(s.relid), 0)::bigint,
        COALESCE(s.n_live_tup, 0)::bigint,
        COALESCE(s.n_dead_tup, 0)::bigint
    FROM pg_stat_user_tables s
    LEFT JOIN pg_statio_user_tables io ON io.relid = s.relid
    WHERE s.relid::bigint = $1
"#;

pub(super) const INDEX_COUNTERS: &str = r#"
    SELECT
        COALESCE(s.idx_scan, 0)::bigint,
        COALESCE(s.idx_tup_read, 0)::bigint,
        COALESCE(s.idx_tup_fetch, 0)::bigint,
        COALESCE(io.idx_blks_read, 0)::bigint,
        COALESCE(io.idx_blks_hit, 0)::bigint,
        COALESCE(pg_relation_size(s.indexrelid), 0)::bigint
    FROM pg_stat_user_indexes s
    LEFT JOIN pg_statio_user_indexes io ON io.indexrelid = s.indexrelid
    WHERE s.indexrelid::bigint = $1
"#;

pub(super) const STATEMENTS_EXTENSION: &str =
    "SELECT 1 FROM pg_extension WHERE extname = 'pg_stat_statements'";

/// Builds version-aware query for pg_stat_statements.
/// `total_time` was renamed to `total_exec_time` in PG 13.
pub(super) fn build_statements_query(server_version_num: Option<i32>) -> String {
    let total_time = if server_version_num.unwrap_or(0) >= 130000 {
        "total_exec_time"
    } else {
        "total_time"
    };
    format!(
        r#"
            SELECT
                queryid::bigint,
                COALESCE(query, ''),
                COALESCE(calls, 0)::bigint,
                COALESCE({total_time}, 0)::double precision,
                COALESCE(rows, 0)::bigint,
                COALESCE(shared_blks_hit, 0)::bigint,
                COALESCE(shared_blks_read, 0)::bigint,
                COALESCE(shared_blks_written, 0)::bigint,
                COALESCE(temp_blks_read, 0)::bigint,
                COALESCE(temp_blks_written, 0)::bigint
            FROM pg_stat_statements
            WHERE queryid IS NOT NULL
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_query_version() {
        assert!(build_statements_query(Some(160000)).contains("total_exec_time"));
        let old = build_statements_query(Some(120000));
        assert!(old.contains("COALESCE(total_time, 0)"));
        assert!(!old.contains("total_exec_time"));
        assert!(build_statements_query(None).contains("total_time"));
    }

    #[test]
    fn test_counter_queries_match_class_layout() {
        use crate::storage::model::ResourceClass;
        let columns = |q: &str| q.matches("::bigint").count() - 1; // WHERE clause cast
        let width = |c: ResourceClass| c.counter_names().len() + c.gauge_names().len();
        assert_eq!(columns(DATABASE_COUNTERS), width(ResourceClass::Database));
        assert_eq!(columns(TABLE_COUNTERS), width(ResourceClass::Table));
        assert_eq!(columns(INDEX_COUNTERS), width(ResourceClass::Index));
    }
}
