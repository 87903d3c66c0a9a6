//! Incremental rollup of cumulative counters.
//!
//! Each pass consumes the raw readings newer than the per-(series, width)
//! cursor, diffs every reading against the last one seen for the same
//! resource, and adds the deltas into the bucket `floor(at / width) * width`.
//! Any decrease is a counter reset: the post-reset value is counted as the
//! delta and the bucket's `resets` is bumped. Lock placeholders carry no
//! values and are skipped without disturbing the last reading.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::storage::model::{RollupBucket, RollupSeries, Timestamp};
use crate::storage::tables::{LastReading, RollupCommit, RollupState};
use crate::storage::{RawReading, Store, StoreError};

/// Difference between two successive cumulative readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterDelta {
    Increase(f64),
    /// The counter went down; holds the post-reset value.
    Reset(f64),
}

impl CounterDelta {
    /// Amount to add into a bucket. Never negative for finite inputs.
    pub fn value(self) -> f64 {
        match self {
            CounterDelta::Increase(d) => d,
            CounterDelta::Reset(v) => v.max(0.0),
        }
    }

    pub fn is_reset(self) -> bool {
        matches!(self, CounterDelta::Reset(_))
    }
}

pub fn counter_delta(prev: f64, curr: f64) -> CounterDelta {
    if curr >= prev {
        CounterDelta::Increase(curr - prev)
    } else {
        CounterDelta::Reset(curr)
    }
}

/// Counters for one rollup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupSummary {
    pub series: RollupSeries,
    pub width_ms: i64,
    /// Raw readings handed to the pass.
    pub readings: usize,
    /// Readings whose deltas landed in a bucket.
    pub merged: usize,
    /// First readings of a resource; they only set the baseline.
    pub baselines: usize,
    pub resets: usize,
    pub locked: usize,
    pub buckets: usize,
}

impl RollupSummary {
    fn new(series: RollupSeries, width_ms: i64) -> Self {
        Self {
            series,
            width_ms,
            readings: 0,
            merged: 0,
            baselines: 0,
            resets: 0,
            locked: 0,
            buckets: 0,
        }
    }
}

pub struct RollupManager {
    bucket_width: Duration,
}

impl RollupManager {
    pub fn new(bucket_width: Duration) -> Self {
        Self { bucket_width }
    }

    /// Roll up every cumulative series at the configured width.
    pub fn rollup_all(&self, store: &Store) -> Result<Vec<RollupSummary>, StoreError> {
        RollupSeries::ALL
            .iter()
            .map(|series| Self::rollup(store, *series, self.bucket_width))
            .collect()
    }

    /// Merge raw readings of `series` that landed since the previous pass.
    pub fn rollup(
        store: &Store,
        series: RollupSeries,
        bucket_width: Duration,
    ) -> Result<RollupSummary, StoreError> {
        let width_ms = i64::try_from(bucket_width.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        let mut summary = RollupSummary::new(series, width_ms);
        store.update_rollup(series, width_ms, |state, raw| {
            let (commit, s) = fold_readings(state, series, width_ms, raw);
            summary = s;
            commit
        })?;
        if summary.merged > 0 {
            debug!(
                "Rolled up {} {} readings into {} buckets ({} resets)",
                summary.merged, series, summary.buckets, summary.resets
            );
        }
        Ok(summary)
    }
}

/// Pure rollup step over `raw` (sorted by time).
fn fold_readings(
    state: &RollupState,
    series: RollupSeries,
    width_ms: i64,
    raw: Vec<RawReading>,
) -> (Option<RollupCommit>, RollupSummary) {
    let mut summary = RollupSummary::new(series, width_ms);
    summary.readings = raw.len();
    let Some(cursor) = raw.iter().map(|r| r.at).max() else {
        return (None, summary);
    };

    let counters = series.counter_names().len();
    let mut last: BTreeMap<u64, LastReading> = BTreeMap::new();
    let mut buckets: BTreeMap<(u64, Timestamp), RollupBucket> = BTreeMap::new();

    for reading in raw {
        if reading.locked {
            summary.locked += 1;
            continue;
        }
        let prev = last
            .get(&reading.resource)
            .or_else(|| state.last(series, width_ms, reading.resource));
        let prev = match prev {
            Some(p) if reading.at <= p.at => continue,
            Some(p) if p.values.len() == reading.values.len() => p,
            _ => {
                summary.baselines += 1;
                last.insert(
                    reading.resource,
                    LastReading {
                        at: reading.at,
                        values: reading.values,
                    },
                );
                continue;
            }
        };

        let start = reading.at.div_euclid(width_ms) * width_ms;
        let bucket = buckets.entry((reading.resource, start)).or_insert_with(|| {
            state
                .bucket(series, width_ms, reading.resource, start)
                .cloned()
                .unwrap_or_else(|| RollupBucket::empty(start, counters))
        });

        let mut reset = false;
        for (i, (p, c)) in prev.values.iter().zip(&reading.values).enumerate() {
            let delta = counter_delta(*p, *c);
            reset |= delta.is_reset();
            if let Some(slot) = bucket.deltas.get_mut(i) {
                *slot += delta.value();
            }
        }
        bucket.samples += 1;
        if reset {
            bucket.resets += 1;
            summary.resets += 1;
        }
        summary.merged += 1;

        last.insert(
            reading.resource,
            LastReading {
                at: reading.at,
                values: reading.values,
            },
        );
    }

    summary.buckets = buckets.len();
    let commit = RollupCommit {
        series,
        width_ms,
        cursor,
        last: last.into_iter().collect(),
        buckets: buckets
            .into_iter()
            .map(|((resource, _), bucket)| (resource, bucket))
            .collect(),
    };
    (Some(commit), summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::{
        MetricSnapshot, Readings, ResourceClass, ResourceId, Series, StatementStat,
    };

    const MIN: i64 = 60_000;

    fn table_snapshot(at: Timestamp, seq_scan: i64, locked: bool) -> MetricSnapshot {
        let mut readings = Readings::zeroed(ResourceClass::Table);
        if !locked {
            readings.counters[0] = seq_scan;
        }
        MetricSnapshot {
            class: ResourceClass::Table,
            resource: ResourceId {
                database_oid: 1,
                object_oid: 10,
            },
            name: "public.t".into(),
            collected_at: at,
            locked,
            readings,
        }
    }

    fn table_key() -> u64 {
        ResourceId {
            database_oid: 1,
            object_oid: 10,
        }
        .key()
    }

    #[test]
    fn test_counter_delta() {
        let seq = [100.0, 150.0, 200.0, 10.0, 40.0];
        let deltas: Vec<_> = seq.windows(2).map(|w| counter_delta(w[0], w[1])).collect();
        assert_eq!(
            deltas,
            vec![
                CounterDelta::Increase(50.0),
                CounterDelta::Increase(50.0),
                CounterDelta::Reset(10.0),
                CounterDelta::Increase(30.0),
            ]
        );
        assert!(deltas.iter().all(|d| d.value() >= 0.0));
        assert_eq!(counter_delta(5.0, 5.0), CounterDelta::Increase(0.0));
    }

    #[test]
    fn test_reset_sequence_per_period_buckets() {
        let store = Store::in_memory();
        let rows = [100, 150, 200, 10, 40]
            .iter()
            .enumerate()
            .map(|(i, v)| table_snapshot(i as i64 * MIN, *v, false))
            .collect();
        store.append_snapshots(rows).unwrap();

        let width = Duration::from_secs(60);
        let s = RollupManager::rollup(&store, RollupSeries::TableSnapshots, width).unwrap();
        assert_eq!((s.readings, s.baselines, s.merged, s.resets), (5, 1, 4, 1));

        let buckets =
            store.rollup_buckets(RollupSeries::TableSnapshots, MIN, table_key(), 0, 10 * MIN);
        let firsts: Vec<f64> = buckets.iter().map(|b| b.deltas[0]).collect();
        assert_eq!(firsts, vec![50.0, 50.0, 10.0, 30.0]);
        assert_eq!(buckets[2].resets, 1);
        assert_eq!(buckets[2].bucket_start, 3 * MIN);
    }

    #[test]
    fn test_incremental_matches_single_pass() {
        let width = Duration::from_secs(3600);
        let values = [5, 9, 20, 3, 8, 8, 30];

        let once = Store::in_memory();
        let all = values
            .iter()
            .enumerate()
            .map(|(i, v)| table_snapshot(i as i64 * 10 * MIN, *v, false))
            .collect();
        once.append_snapshots(all).unwrap();
        RollupManager::rollup(&once, RollupSeries::TableSnapshots, width).unwrap();

        let stepwise = Store::in_memory();
        for (i, v) in values.iter().enumerate() {
            stepwise
                .append_snapshots(vec![table_snapshot(i as i64 * 10 * MIN, *v, false)])
                .unwrap();
            RollupManager::rollup(&stepwise, RollupSeries::TableSnapshots, width).unwrap();
        }

        let hour = 3_600_000;
        let a = once.rollup_buckets(RollupSeries::TableSnapshots, hour, table_key(), 0, hour);
        let b = stepwise.rollup_buckets(RollupSeries::TableSnapshots, hour, table_key(), 0, hour);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        // 4 + 11 + reset 3 + 5 + 0 within the first hour, then +22.
        assert_eq!(a[0].deltas[0], 23.0);
        assert_eq!(a[1].deltas[0], 22.0);
    }

    #[test]
    fn test_locked_placeholder_skipped() {
        let store = Store::in_memory();
        store
            .append_snapshots(vec![
                table_snapshot(0, 100, false),
                table_snapshot(MIN, 0, true),
                table_snapshot(2 * MIN, 160, false),
            ])
            .unwrap();
        let s = RollupManager::rollup(&store, RollupSeries::TableSnapshots, Duration::from_secs(3600))
            .unwrap();
        assert_eq!((s.locked, s.resets, s.merged), (1, 0, 1));
        let b = store.rollup_buckets(RollupSeries::TableSnapshots, 3_600_000, table_key(), 0, 0);
        assert_eq!(b[0].deltas[0], 60.0);
    }

    #[test]
    fn test_buckets_survive_purge() {
        let store = Store::in_memory();
        let rows = (0..4)
            .map(|i| table_snapshot(i * MIN, i * 10, false))
            .collect();
        store.append_snapshots(rows).unwrap();
        let width = Duration::from_secs(60);
        RollupManager::rollup(&store, RollupSeries::TableSnapshots, width).unwrap();

        store.purge_series(Series::TableSnapshots, 10 * MIN).unwrap();
        assert_eq!(store.oldest(Series::TableSnapshots), None);

        let buckets =
            store.rollup_buckets(RollupSeries::TableSnapshots, MIN, table_key(), 0, 10 * MIN);
        assert_eq!(buckets.len(), 3);

        // New rows continue from the carried last reading.
        store
            .append_snapshots(vec![table_snapshot(4 * MIN, 45, false)])
            .unwrap();
        let s = RollupManager::rollup(&store, RollupSeries::TableSnapshots, width).unwrap();
        assert_eq!((s.baselines, s.merged), (0, 1));
        let b = store.rollup_buckets(RollupSeries::TableSnapshots, MIN, table_key(), 4 * MIN, 4 * MIN);
        assert_eq!(b[0].deltas[0], 15.0);
    }

    #[test]
    fn test_statement_series() {
        let store = Store::in_memory();
        let stat = |at: Timestamp, calls: i64| StatementStat {
            collected_at: at,
            query_id: 42,
            query: "SELECT 1".into(),
            calls,
            total_exec_time: calls as f64,
            rows: calls,
            shared_blks_hit: 0,
            shared_blks_read: 0,
            shared_blks_written: 0,
            temp_blks_read: 0,
            temp_blks_written: 0,
        };
        store
            .append_statements(vec![stat(0, 10), stat(MIN, 25)])
            .unwrap();
        let manager = RollupManager::new(Duration::from_secs(3600));
        let all = manager.rollup_all(&store).unwrap();
        assert_eq!(all.len(), RollupSeries::ALL.len());

        let b = store.rollup_buckets(RollupSeries::StatementStats, 3_600_000, 42, 0, 0);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].deltas[0], 15.0);
        assert_eq!(b[0].samples, 1);
    }
}
