//! Retention & rollup manager.
//!
//! [`RetentionManager::purge`] drops raw rows older than each series'
//! horizon, independently per series. [`rollup::RollupManager`] keeps
//! downsampled buckets of the cumulative series in storage of their own,
//! so buckets outlive the raw rows they were computed from.

pub mod rollup;

use tracing::info;

use crate::config::RetentionConfig;
use crate::storage::model::{Series, Timestamp};
use crate::storage::{Store, StoreError};

pub use rollup::{CounterDelta, RollupManager, RollupSummary, counter_delta};

/// Rows removed per series by one `purge` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub removed: Vec<(Series, usize)>,
}

impl PurgeSummary {
    pub fn total(&self) -> usize {
        self.removed.iter().map(|(_, n)| n).sum()
    }

    pub fn removed_from(&self, series: Series) -> usize {
        self.removed
            .iter()
            .find(|(s, _)| *s == series)
            .map_or(0, |(_, n)| *n)
    }
}

pub struct RetentionManager {
    config: RetentionConfig,
}

impl RetentionManager {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    /// Oldest timestamp `series` keeps at `now`; `None` if it never expires.
    pub fn cutoff(&self, series: Series, now: Timestamp) -> Option<Timestamp> {
        let horizon = self.config.horizon(series)?;
        let horizon_ms = i64::try_from(horizon.as_millis()).unwrap_or(i64::MAX);
        Some(now.saturating_sub(horizon_ms))
    }

    /// Delete every row whose age at `now` exceeds its series' horizon.
    pub fn purge(&self, store: &Store, now: Timestamp) -> Result<PurgeSummary, StoreError> {
        let mut summary = PurgeSummary::default();
        for series in Series::ALL {
            let Some(cutoff) = self.cutoff(series, now) else {
                continue;
            };
            let removed = store.purge_series(series, cutoff)?;
            summary.removed.push((series, removed));
        }
        if summary.total() > 0 {
            info!("Retention purged {} rows", summary.total());
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::{
        MetricSnapshot, QueryPlanEvent, Readings, ResourceClass, ResourceId, VacuumEvent,
    };
    use std::time::Duration;

    const DAY: i64 = 86_400_000;

    fn snapshot(at: Timestamp) -> MetricSnapshot {
        MetricSnapshot {
            class: ResourceClass::Database,
            resource: ResourceId::database(5),
            name: "postgres".into(),
            collected_at: at,
            locked: false,
            readings: Readings::zeroed(ResourceClass::Database),
        }
    }

    fn vacuum(finished_at: Timestamp) -> VacuumEvent {
        VacuumEvent {
            table: "db.public.t".into(),
            started_at: finished_at - 100,
            finished_at,
            elapsed_ms: 100,
            index_scans: 0,
            pages_removed: 0,
            pages_remaining: 1,
            tuples_removed: 0,
            tuples_remaining: 1,
            wraparound: false,
            aggressive: false,
            detail: String::new(),
        }
    }

    fn plan(at: Timestamp) -> QueryPlanEvent {
        QueryPlanEvent {
            timestamp: at,
            query_id: 1,
            duration_ms: 1500.0,
            total_cost: 1.0,
            bytes_read: 0,
            io_read_time_ms: 0.0,
            database_name: None,
            user_name: None,
            query_text: None,
            plan: "{}".into(),
        }
    }

    #[test]
    fn test_purge_respects_each_horizon() {
        let store = Store::in_memory();
        let now = 100 * DAY;
        let config = RetentionConfig {
            database_snapshots: Duration::from_secs(10 * 86_400),
            vacuum_events: Duration::from_secs(30 * 86_400),
            plan_events: Duration::from_secs(86_400),
            ..RetentionConfig::default()
        };

        store
            .append_snapshots(vec![
                snapshot(now - 11 * DAY),
                snapshot(now - 10 * DAY),
                snapshot(now - DAY),
            ])
            .unwrap();
        store
            .insert_vacuum_events(vec![vacuum(now - 31 * DAY), vacuum(now - 29 * DAY)])
            .unwrap();
        store
            .insert_plan_events(vec![plan(now - 2 * DAY), plan(now - DAY + 1)])
            .unwrap();

        let summary = RetentionManager::new(config).purge(&store, now).unwrap();
        assert_eq!(summary.removed_from(Series::DatabaseSnapshots), 1);
        assert_eq!(summary.removed_from(Series::VacuumEvents), 1);
        assert_eq!(summary.removed_from(Series::PlanEvents), 1);
        assert_eq!(summary.total(), 3);

        let db = ResourceId::database(5);
        let left = store.snapshots(ResourceClass::Database, db, 0, now);
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].collected_at, now - 10 * DAY);
        assert_eq!(store.oldest(Series::VacuumEvents), Some(now - 29 * DAY));
    }

    #[test]
    fn test_history_without_horizon_is_kept() {
        let manager = RetentionManager::new(RetentionConfig::default());
        assert_eq!(manager.cutoff(Series::ParameterHistory, DAY), None);
        assert_eq!(manager.cutoff(Series::PlanEvents, 100 * DAY), Some(86 * DAY));

        let store = Store::in_memory();
        let summary = manager.purge(&store, 100 * DAY).unwrap();
        assert_eq!(summary.total(), 0);
        assert!(
            !summary
                .removed
                .iter()
                .any(|(s, _)| *s == Series::ParameterHistory)
        );
    }
}
