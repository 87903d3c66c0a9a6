//! In-memory table parts.
//!
//! The live [`Store`](super::Store) keeps each part behind its own lock; the
//! checkpoint image and WAL replay work on the same parts directly, so a
//! record is applied by the same code either way.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use super::model::{
    EnumDefinition, Instrument, InstrumentId, MetricSnapshot, ResourceClass, ResourceId,
    RollupBucket, RollupSeries, SessionInterval, Timestamp,
};

/// Instruments and their enumeration definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    instruments: BTreeMap<InstrumentId, Instrument>,
    enums: BTreeMap<(InstrumentId, String), EnumDefinition>,
}

impl Catalog {
    pub fn contains(&self, id: InstrumentId) -> bool {
        self.instruments.contains_key(&id)
    }

    pub fn get(&self, id: InstrumentId) -> Option<&Instrument> {
        self.instruments.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Instrument> {
        self.instruments.values().find(|i| i.spec.name == name)
    }

    pub fn by_serial(&self, serial: i64) -> Option<&Instrument> {
        self.instruments.values().find(|i| i.spec.serial == serial)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.values()
    }

    pub fn next_instrument_id(&self) -> InstrumentId {
        self.instruments.keys().next_back().map_or(1, |id| id + 1)
    }

    pub fn upsert_instrument(&mut self, instrument: Instrument) {
        self.instruments.insert(instrument.id, instrument);
    }

    pub fn remove_instrument(&mut self, id: InstrumentId) -> bool {
        self.enums.retain(|(owner, _), _| *owner != id);
        self.instruments.remove(&id).is_some()
    }

    pub fn enum_by_name(&self, instrument: InstrumentId, name: &str) -> Option<&EnumDefinition> {
        self.enums.get(&(instrument, name.to_string()))
    }

    /// `max(enum_id) + 1` over the instrument's enumerations, starting at 1.
    pub fn next_enum_id(&self, instrument: InstrumentId) -> u32 {
        self.enums
            .values()
            .filter(|e| e.instrument == instrument)
            .map(|e| e.enum_id)
            .max()
            .map_or(1, |m| m + 1)
    }

    pub fn define_enum(&mut self, def: EnumDefinition) {
        self.enums.insert((def.instrument, def.name.clone()), def);
    }

    pub fn enums_of(&self, instrument: InstrumentId) -> Vec<EnumDefinition> {
        self.enums
            .values()
            .filter(|e| e.instrument == instrument)
            .cloned()
            .collect()
    }
}

/// Write-once rows keyed by natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendTable<K: Ord, V> {
    rows: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for AppendTable<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> AppendTable<K, V> {
    pub fn contains(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    /// Insert-if-absent. An existing row is never touched.
    pub fn insert(&mut self, key: K, row: V) -> bool {
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(key, row);
        true
    }

    pub fn range(&self, from: &K, to: &K) -> Vec<V> {
        if from > to {
            return Vec::new();
        }
        self.rows
            .range((Bound::Included(from), Bound::Included(to)))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&V) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, v| keep(v));
        before - self.rows.len()
    }
}

/// Snapshots of one resource class, keyed by (resource, collected_at).
pub type SnapshotTable = AppendTable<(ResourceId, Timestamp), MetricSnapshot>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotTables {
    pub database: SnapshotTable,
    pub table: SnapshotTable,
    pub index: SnapshotTable,
}

impl SnapshotTables {
    pub fn class(&self, class: ResourceClass) -> &SnapshotTable {
        match class {
            ResourceClass::Database => &self.database,
            ResourceClass::Table => &self.table,
            ResourceClass::Index => &self.index,
        }
    }

    pub fn class_mut(&mut self, class: ResourceClass) -> &mut SnapshotTable {
        match class {
            ResourceClass::Database => &mut self.database,
            ResourceClass::Table => &mut self.table,
            ResourceClass::Index => &mut self.index,
        }
    }
}

/// Session intervals per (instrument, lane), keyed by start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTable {
    lanes: BTreeMap<(InstrumentId, String), BTreeMap<Timestamp, SessionInterval>>,
}

impl SessionTable {
    /// Replace every interval starting within `[from, to]`.
    pub fn replace(
        &mut self,
        instrument: InstrumentId,
        lane: &str,
        from: Timestamp,
        to: Timestamp,
        intervals: &[SessionInterval],
    ) -> usize {
        let rows = self
            .lanes
            .entry((instrument, lane.to_string()))
            .or_default();
        rows.retain(|start, _| *start < from || *start > to);
        for interval in intervals {
            rows.insert(interval.start, interval.clone());
        }
        intervals.len()
    }

    /// Intervals overlapping `[from, to]`.
    pub fn range(
        &self,
        instrument: InstrumentId,
        lane: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<SessionInterval> {
        self.lanes
            .get(&(instrument, lane.to_string()))
            .map(|rows| {
                rows.range(..=to)
                    .map(|(_, s)| s)
                    .filter(|s| s.end >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_instrument(&mut self, instrument: InstrumentId) -> usize {
        let mut removed = 0;
        self.lanes.retain(|(id, _), rows| {
            if *id == instrument {
                removed += rows.len();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop intervals of `instrument` that ended before `before`.
    pub fn purge_instrument(&mut self, instrument: InstrumentId, before: Timestamp) -> usize {
        let mut removed = 0;
        for ((id, _), rows) in self.lanes.iter_mut() {
            if *id == instrument {
                let n = rows.len();
                rows.retain(|_, s| s.end >= before);
                removed += n - rows.len();
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lanes.values().map(BTreeMap::len).sum()
    }
}

/// Last cumulative reading seen for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastReading {
    pub at: Timestamp,
    pub values: Vec<f64>,
}

/// Result of one incremental rollup pass, applied as absolute values so
/// replaying it twice is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupCommit {
    pub series: RollupSeries,
    pub width_ms: i64,
    pub cursor: Timestamp,
    pub last: Vec<(u64, LastReading)>,
    pub buckets: Vec<(u64, RollupBucket)>,
}

type BucketKey = (RollupSeries, i64, u64, Timestamp);

/// Rollup buckets plus the incremental state that produced them.
///
/// Independent of the raw tables: purging raw rows never touches it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollupState {
    cursors: BTreeMap<(RollupSeries, i64), Timestamp>,
    last: BTreeMap<(RollupSeries, i64, u64), LastReading>,
    buckets: BTreeMap<BucketKey, RollupBucket>,
}

impl RollupState {
    pub fn cursor(&self, series: RollupSeries, width_ms: i64) -> Option<Timestamp> {
        self.cursors.get(&(series, width_ms)).copied()
    }

    pub fn last(&self, series: RollupSeries, width_ms: i64, resource: u64) -> Option<&LastReading> {
        self.last.get(&(series, width_ms, resource))
    }

    pub fn bucket(
        &self,
        series: RollupSeries,
        width_ms: i64,
        resource: u64,
        start: Timestamp,
    ) -> Option<&RollupBucket> {
        self.buckets.get(&(series, width_ms, resource, start))
    }

    pub fn commit(&mut self, commit: &RollupCommit) {
        let (series, width) = (commit.series, commit.width_ms);
        self.cursors.insert((series, width), commit.cursor);
        for (resource, reading) in &commit.last {
            self.last.insert((series, width, *resource), reading.clone());
        }
        for (resource, bucket) in &commit.buckets {
            self.buckets
                .insert((series, width, *resource, bucket.bucket_start), bucket.clone());
        }
    }

    /// Forget last readings of `series` older than `cutoff` for resources
    /// with no raw rows left. Buckets are kept.
    pub fn prune_last(
        &mut self,
        series: RollupSeries,
        cutoff: Timestamp,
        live: &BTreeSet<u64>,
    ) -> usize {
        let before = self.last.len();
        self.last.retain(|(s, _, resource), last| {
            *s != series || last.at >= cutoff || live.contains(resource)
        });
        before - self.last.len()
    }

    pub fn buckets(
        &self,
        series: RollupSeries,
        width_ms: i64,
        resource: u64,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<RollupBucket> {
        if from > to {
            return Vec::new();
        }
        self.buckets
            .range((series, width_ms, resource, from)..=(series, width_ms, resource, to))
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
