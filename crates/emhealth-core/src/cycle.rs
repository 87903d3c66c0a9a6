//! One engine cycle: collect → statements → mine → rollup → purge.
//!
//! Per-resource and per-record failures are absorbed by each stage and
//! show up in the summary. A systemic failure (storage or connection)
//! aborts the remaining stages and is returned to the scheduler, which
//! simply retries on the next tick; every stage is idempotent so a
//! partial cycle leaves nothing to undo.
//!
//! Mining does not depend on the metrics source: the records handed to a
//! cycle are mined even when collection fails, since the log tailer has
//! already moved past them.

use std::fmt;
use std::time::Instant;

use tracing::{info, warn};

use crate::collector::{
    CollectError, CollectSummary, MetricsCollector, MetricsSource, SourceError, StatementSummary,
};
use crate::config::EngineConfig;
use crate::miner::{LogMiner, LogRecord, ScanSummary};
use crate::retention::{PurgeSummary, RetentionManager, RollupManager, RollupSummary};
use crate::storage::model::Timestamp;
use crate::storage::{Store, StoreError};

/// Failure that aborts a cycle.
#[derive(Debug)]
pub enum CycleError {
    Store(StoreError),
    Source(SourceError),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Store(e) => write!(f, "storage: {}", e),
            CycleError::Source(e) => write!(f, "collector: {}", e),
        }
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CycleError::Store(e) => Some(e),
            CycleError::Source(e) => Some(e),
        }
    }
}

impl From<StoreError> for CycleError {
    fn from(e: StoreError) -> Self {
        CycleError::Store(e)
    }
}

impl From<SourceError> for CycleError {
    fn from(e: SourceError) -> Self {
        CycleError::Source(e)
    }
}

impl From<CollectError> for CycleError {
    fn from(e: CollectError) -> Self {
        match e {
            CollectError::Source(e) => CycleError::Source(e),
            CollectError::Store(e) => CycleError::Store(e),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub collected: Vec<CollectSummary>,
    pub statements: Option<StatementSummary>,
    pub mined: ScanSummary,
    pub rollups: Vec<RollupSummary>,
    pub purged: PurgeSummary,
    pub elapsed_ms: u128,
}

impl CycleSummary {
    pub fn snapshots_written(&self) -> usize {
        self.collected.iter().map(|c| c.written).sum()
    }
}

pub struct Engine<S: MetricsSource> {
    config: EngineConfig,
    store: Store,
    collector: MetricsCollector<S>,
    miner: LogMiner,
    rollup: RollupManager,
    retention: RetentionManager,
}

impl<S: MetricsSource> Engine<S> {
    pub fn new(config: EngineConfig, store: Store, source: S) -> Self {
        Self {
            miner: LogMiner::new(config.slow_query_threshold),
            rollup: RollupManager::new(config.rollup_bucket_width),
            retention: RetentionManager::new(config.retention_horizon.clone()),
            collector: MetricsCollector::new(source),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source_mut(&mut self) -> &mut S {
        self.collector.source_mut()
    }

    /// Run every stage once at `now`, mining `records`.
    pub fn run_cycle(
        &mut self,
        now: Timestamp,
        records: &[LogRecord],
    ) -> Result<CycleSummary, CycleError> {
        let started = Instant::now();
        let mut summary = CycleSummary::default();

        let collected = self.collect_metrics(now, &mut summary);
        summary.mined = self.miner.scan(&self.store, records)?;
        if let Err(e) = collected {
            warn!(
                "Collection failed, mined {} vacuum and {} plan events before aborting",
                summary.mined.vacuum_inserted, summary.mined.plans_inserted
            );
            return Err(e);
        }

        summary.rollups = self.rollup.rollup_all(&self.store)?;
        summary.purged = self.retention.purge(&self.store, now)?;
        summary.elapsed_ms = started.elapsed().as_millis();

        info!(
            "Cycle done in {}ms: {} snapshots, {} statements, {} vacuum, {} plans ({} malformed), {} purged",
            summary.elapsed_ms,
            summary.snapshots_written(),
            summary.statements.map_or(0, |s| s.written),
            summary.mined.vacuum_inserted,
            summary.mined.plans_inserted,
            summary.mined.malformed,
            summary.purged.total(),
        );
        Ok(summary)
    }

    fn collect_metrics(
        &mut self,
        now: Timestamp,
        summary: &mut CycleSummary,
    ) -> Result<(), CycleError> {
        for class in self.config.collector.classes() {
            let collected = self.collector.collect(&self.store, class, now)?;
            summary.collected.push(collected);
        }

        if self.config.collector.collect_statements {
            summary.statements = match self.collector.collect_statements(&self.store, now) {
                Ok(s) => Some(s),
                Err(CollectError::Source(e)) if e.is_transient() => {
                    warn!("Statement stats skipped: {}", e);
                    None
                }
                Err(e) => return Err(e.into()),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockSource;
    use crate::config::LogFormat;
    use crate::miner::LogStream;
    use crate::storage::model::{ResourceClass, RollupSeries, Series};

    const MIN: i64 = 60_000;

    const VACUUM_JSON: &str = r#"{"timestamp":"2024-01-15 14:30:00.000 UTC","pid":77,"error_severity":"LOG","message":"automatic vacuum of table \"shop.public.orders\": index scans: 1\npages: 0 removed, 45 remain, 45 scanned (100.00% of total)\ntuples: 10 removed, 1000 remain, 0 are dead but not yet removable\nsystem usage: CPU: user: 0.00 s, system: 0.00 s, elapsed: 0.50 s","backend_type":"autovacuum worker","query_id":0}"#;

    fn engine() -> Engine<MockSource> {
        let config = EngineConfig::from_toml(
            r#"
rollup_bucket_width = "1h"

[retention_horizon]
table_snapshots = "10m"
"#,
        )
        .unwrap();
        let mut source = MockSource::new();
        source.add_database(5, "postgres", 100);
        source.add_table(10, "public.orders", 0);
        Engine::new(config, Store::in_memory(), source)
    }

    #[test]
    fn test_cycles_collect_rollup_and_purge() {
        let mut engine = engine();
        let table = crate::storage::model::ResourceId {
            database_oid: 1,
            object_oid: 10,
        };
        for i in 0..20 {
            engine
                .source_mut()
                .set_counter(table, ResourceClass::Table, i * 3);
            let s = engine.run_cycle(i * MIN, &[]).unwrap();
            assert_eq!(s.snapshots_written(), 2);
        }

        let oldest = engine.store().oldest(Series::TableSnapshots).unwrap();
        assert_eq!(oldest, 9 * MIN);
        assert_eq!(engine.store().oldest(Series::DatabaseSnapshots), Some(0));

        let buckets = engine.store().rollup_buckets(
            RollupSeries::TableSnapshots,
            3_600_000,
            table.key(),
            0,
            0,
        );
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].deltas[0], 57.0);
        assert_eq!(buckets[0].samples, 19);
    }

    #[test]
    fn test_systemic_failure_aborts_cycle() {
        let mut engine = engine();
        engine.source_mut().fail_listing = true;
        let err = engine.run_cycle(MIN, &[]).unwrap_err();
        assert!(matches!(err, CycleError::Source(SourceError::ConnectionError(_))));
        assert_eq!(engine.store().counts().snapshots, 0);

        engine.source_mut().fail_listing = false;
        assert!(engine.run_cycle(2 * MIN, &[]).is_ok());
    }

    #[test]
    fn test_log_records_mined_while_postgres_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postgresql.json");
        std::fs::write(&path, format!("{VACUUM_JSON}\n")).unwrap();
        let mut stream = LogStream::from_start(path, LogFormat::Jsonlog).unwrap();

        let mut engine = engine();
        engine.source_mut().fail_listing = true;
        let records = stream.read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(engine.run_cycle(MIN, &records).is_err());
        assert_eq!(engine.store().counts().vacuum_events, 1);

        engine.source_mut().fail_listing = false;
        let records = stream.read_records().unwrap();
        assert!(records.is_empty());
        let s = engine.run_cycle(2 * MIN, &records).unwrap();
        assert_eq!(s.snapshots_written(), 2);
        assert_eq!(engine.store().counts().vacuum_events, 1);
    }
}
