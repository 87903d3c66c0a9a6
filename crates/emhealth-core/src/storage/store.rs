//! The engine's storage substrate.
//!
//! Lock order (always acquired in this order, never the reverse):
//! `catalog` → `rollups` → `parameters` → `enum_members` → `snapshots` →
//! `statements` → `vacuum` → `plans` → `sessions` → `wal`.
//!
//! Every mutation takes its table lock, appends its WAL record, then
//! applies the change while still holding the lock. Writers on different
//! tables never contend except on the short WAL append.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use super::checkpoint::{
    StatementTable, StoreImage, cascade_delete, purge_instrument_data, purge_snapshots,
    read_checkpoint, snapshot_resources, statement_resources, write_checkpoint,
};
use super::error::StoreError;
use super::model::{
    EnumDefinition, EnumMemberAttrs, EnumMemberKey, Instrument, InstrumentId, InstrumentSpec,
    MetricSnapshot, ParamKey, ParameterAttrs, PlanKey, QueryPlanEvent, ResourceClass, ResourceId,
    RollupBucket, RollupSeries, Series, SessionInterval, StatementStat, Timestamp, VacuumEvent,
    VacuumKey,
};
use super::tables::{
    AppendTable, Catalog, RollupCommit, RollupState, SessionTable, SnapshotTables,
};
use super::tracked::{Change, HistoryRow, Tracked};
use super::wal::{Wal, WalRecord};

const STATE_FILE: &str = "state.bin";
const WAL_FILE: &str = "wal.log";

/// One raw cumulative reading handed to a rollup pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub resource: u64,
    pub at: Timestamp,
    pub values: Vec<f64>,
    /// Lock placeholder; carries no real values.
    pub locked: bool,
}

/// Outcome of an insert-if-absent batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Row counts per table, for status logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub instruments: usize,
    pub parameters: usize,
    pub parameter_history: usize,
    pub enum_members: usize,
    pub enum_history: usize,
    pub snapshots: usize,
    pub statements: usize,
    pub vacuum_events: usize,
    pub plan_events: usize,
    pub sessions: usize,
    pub rollup_buckets: usize,
    pub wal_frames: usize,
}

pub struct Store {
    dir: Option<PathBuf>,
    catalog: RwLock<Catalog>,
    rollups: Mutex<RollupState>,
    parameters: Mutex<Tracked<ParamKey, ParameterAttrs>>,
    enum_members: Mutex<Tracked<EnumMemberKey, EnumMemberAttrs>>,
    snapshots: Mutex<SnapshotTables>,
    statements: Mutex<StatementTable>,
    vacuum: Mutex<AppendTable<VacuumKey, VacuumEvent>>,
    plans: Mutex<AppendTable<PlanKey, QueryPlanEvent>>,
    sessions: Mutex<SessionTable>,
    wal: Mutex<Option<Wal>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

impl Store {
    /// Volatile store, nothing touches disk.
    pub fn in_memory() -> Self {
        Self::from_image(StoreImage::default(), None, None)
    }

    /// Open a durable store in `dir`: load the checkpoint, migrate it if
    /// needed, and replay the WAL on top.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        // Cleanup old .tmp files
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }

        let state_path = dir.join(STATE_FILE);
        let (mut image, migrated) = match read_checkpoint(&state_path)? {
            Some((image, migrated)) => (image, migrated),
            None => (StoreImage::default(), false),
        };

        let (wal, records) = Wal::open(&dir.join(WAL_FILE))?;
        for record in &records {
            image.apply(record);
        }
        if !records.is_empty() {
            info!("Recovered {} WAL records from {}", records.len(), dir.display());
        }

        let store = Self::from_image(image, Some(dir), Some(wal));
        if migrated {
            store.checkpoint()?;
        }
        Ok(store)
    }

    fn from_image(image: StoreImage, dir: Option<PathBuf>, wal: Option<Wal>) -> Self {
        Self {
            dir,
            catalog: RwLock::new(image.catalog),
            rollups: Mutex::new(image.rollups),
            parameters: Mutex::new(image.parameters),
            enum_members: Mutex::new(image.enum_members),
            snapshots: Mutex::new(image.snapshots),
            statements: Mutex::new(image.statements),
            vacuum: Mutex::new(image.vacuum),
            plans: Mutex::new(image.plans),
            sessions: Mutex::new(image.sessions),
            wal: Mutex::new(wal),
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn log(&self, record: &WalRecord) -> Result<(), StoreError> {
        match lock(&self.wal).as_mut() {
            Some(wal) => wal.append(record),
            None => Ok(()),
        }
    }

    /// Persist every table to `state.bin` and truncate the WAL.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let catalog = write(&self.catalog);
        let rollups = lock(&self.rollups);
        let parameters = lock(&self.parameters);
        let enum_members = lock(&self.enum_members);
        let snapshots = lock(&self.snapshots);
        let statements = lock(&self.statements);
        let vacuum = lock(&self.vacuum);
        let plans = lock(&self.plans);
        let sessions = lock(&self.sessions);
        let mut wal = lock(&self.wal);

        let image = StoreImage {
            catalog: catalog.clone(),
            parameters: parameters.clone(),
            enum_members: enum_members.clone(),
            snapshots: snapshots.clone(),
            statements: statements.clone(),
            vacuum: vacuum.clone(),
            plans: plans.clone(),
            sessions: sessions.clone(),
            rollups: rollups.clone(),
        };
        write_checkpoint(&dir.join(STATE_FILE), &image)?;

        if let Some(wal) = wal.as_mut() {
            let frames = wal.frames();
            wal.reset()?;
            debug!("Checkpoint written, {} WAL frames folded", frames);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instruments
    // ------------------------------------------------------------------

    /// Insert or update an instrument keyed by `spec.name`.
    pub fn upsert_instrument(&self, spec: InstrumentSpec) -> Result<InstrumentId, StoreError> {
        let mut catalog = write(&self.catalog);
        let id = match catalog.by_name(&spec.name) {
            Some(existing) if existing.spec == spec => return Ok(existing.id),
            Some(existing) => existing.id,
            None => catalog.next_instrument_id(),
        };
        let instrument = Instrument { id, spec };
        self.log(&WalRecord::InstrumentUpserted(instrument.clone()))?;
        info!("Updated instruments table (item {})", instrument.spec.name);
        catalog.upsert_instrument(instrument);
        Ok(id)
    }

    pub fn instrument(&self, id: InstrumentId) -> Option<Instrument> {
        read(&self.catalog).get(id).cloned()
    }

    pub fn instrument_by_name(&self, name: &str) -> Option<Instrument> {
        read(&self.catalog).by_name(name).cloned()
    }

    pub fn instrument_by_serial(&self, serial: i64) -> Option<Instrument> {
        read(&self.catalog).by_serial(serial).cloned()
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        read(&self.catalog).instruments().cloned().collect()
    }

    /// Delete an instrument and cascade to everything it owns.
    /// Returns the number of dependent rows removed.
    pub fn delete_instrument(&self, id: InstrumentId) -> Result<usize, StoreError> {
        let mut catalog = write(&self.catalog);
        if !catalog.contains(id) {
            return Err(StoreError::UnknownInstrument(id.to_string()));
        }
        let mut parameters = lock(&self.parameters);
        let mut enum_members = lock(&self.enum_members);
        let mut sessions = lock(&self.sessions);

        self.log(&WalRecord::InstrumentDeleted { id })?;
        let removed = cascade_delete(
            id,
            &mut catalog,
            &mut parameters,
            &mut enum_members,
            &mut sessions,
        );
        info!("Deleted instrument {} ({} dependent rows)", id, removed);
        Ok(removed)
    }

    /// Drop history and session rows of an instrument older than `before`.
    pub fn purge_instrument_data(
        &self,
        id: InstrumentId,
        before: Timestamp,
    ) -> Result<usize, StoreError> {
        let catalog = read(&self.catalog);
        if !catalog.contains(id) {
            return Err(StoreError::UnknownInstrument(id.to_string()));
        }
        let mut parameters = lock(&self.parameters);
        let mut enum_members = lock(&self.enum_members);
        let mut sessions = lock(&self.sessions);

        self.log(&WalRecord::InstrumentDataPurged { id, before })?;
        let removed = purge_instrument_data(
            id,
            before,
            &mut parameters,
            &mut enum_members,
            &mut sessions,
        );
        info!("Deleted {} rows older than {} for instrument {}", removed, before, id);
        Ok(removed)
    }

    /// Erase an instrument found by serial: everything when `since` is
    /// `None`, otherwise only derived rows older than `since`.
    pub fn clean_instrument(
        &self,
        serial: i64,
        since: Option<Timestamp>,
    ) -> Result<usize, StoreError> {
        let id = self
            .instrument_by_serial(serial)
            .map(|i| i.id)
            .ok_or_else(|| StoreError::UnknownInstrument(format!("serial {serial}")))?;
        match since {
            None => self.delete_instrument(id),
            Some(before) => self.purge_instrument_data(id, before),
        }
    }

    /// Register an enumeration, returning its per-instrument id. Known
    /// names keep their id; new ones get `max + 1`.
    pub fn define_enum(&self, instrument: InstrumentId, name: &str) -> Result<u32, StoreError> {
        let mut catalog = write(&self.catalog);
        if !catalog.contains(instrument) {
            return Err(StoreError::ReferentialViolation { instrument });
        }
        if let Some(def) = catalog.enum_by_name(instrument, name) {
            return Ok(def.enum_id);
        }
        let def = EnumDefinition {
            instrument,
            enum_id: catalog.next_enum_id(instrument),
            name: name.to_string(),
        };
        self.log(&WalRecord::EnumDefined(def.clone()))?;
        let id = def.enum_id;
        catalog.define_enum(def);
        Ok(id)
    }

    pub fn enum_definition(&self, instrument: InstrumentId, name: &str) -> Option<EnumDefinition> {
        read(&self.catalog).enum_by_name(instrument, name).cloned()
    }

    pub fn enums_of(&self, instrument: InstrumentId) -> Vec<EnumDefinition> {
        read(&self.catalog).enums_of(instrument)
    }

    // ------------------------------------------------------------------
    // Change-tracked dimensions
    // ------------------------------------------------------------------

    /// Insert, update (recording the superseded row) or ignore a
    /// parameter definition.
    pub fn apply_parameter(
        &self,
        key: ParamKey,
        attrs: ParameterAttrs,
        at: Timestamp,
    ) -> Result<Change<ParameterAttrs>, StoreError> {
        let catalog = read(&self.catalog);
        if !catalog.contains(key.instrument) {
            return Err(StoreError::ReferentialViolation {
                instrument: key.instrument,
            });
        }
        let mut table = lock(&self.parameters);
        let change = table.current.diff(&key, &attrs);
        let before = match &change {
            Change::Unchanged => return Ok(change),
            Change::Insert => None,
            Change::Update { before } => Some(before.clone()),
        };
        self.log(&WalRecord::ParameterApplied {
            key,
            attrs: attrs.clone(),
            before,
            at,
        })?;
        Ok(table.apply(key, attrs, at))
    }

    pub fn apply_enum_member(
        &self,
        key: EnumMemberKey,
        attrs: EnumMemberAttrs,
        at: Timestamp,
    ) -> Result<Change<EnumMemberAttrs>, StoreError> {
        let catalog = read(&self.catalog);
        if !catalog.contains(key.instrument) {
            return Err(StoreError::ReferentialViolation {
                instrument: key.instrument,
            });
        }
        let mut table = lock(&self.enum_members);
        let change = table.current.diff(&key, &attrs);
        let before = match &change {
            Change::Unchanged => return Ok(change),
            Change::Insert => None,
            Change::Update { before } => Some(*before),
        };
        self.log(&WalRecord::EnumMemberApplied {
            key: key.clone(),
            attrs,
            before,
            at,
        })?;
        Ok(table.apply(key, attrs, at))
    }

    pub fn parameter(&self, key: &ParamKey) -> Option<ParameterAttrs> {
        lock(&self.parameters).current.get(key).cloned()
    }

    pub fn parameter_history(
        &self,
        key: &ParamKey,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<HistoryRow<ParameterAttrs>> {
        lock(&self.parameters).history.range(key, from, to)
    }

    pub fn parameters_of(&self, instrument: InstrumentId) -> Vec<(ParamKey, ParameterAttrs)> {
        lock(&self.parameters)
            .current
            .iter()
            .filter(|(k, _)| k.instrument == instrument)
            .map(|(k, a)| (*k, a.clone()))
            .collect()
    }

    pub fn enum_member(&self, key: &EnumMemberKey) -> Option<EnumMemberAttrs> {
        lock(&self.enum_members).current.get(key).copied()
    }

    pub fn enum_member_history(
        &self,
        key: &EnumMemberKey,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<HistoryRow<EnumMemberAttrs>> {
        lock(&self.enum_members).history.range(key, from, to)
    }

    /// Members of one enumeration as (name, value).
    pub fn enum_members_of(&self, instrument: InstrumentId, enum_id: u32) -> Vec<(String, i64)> {
        lock(&self.enum_members)
            .current
            .iter()
            .filter(|(k, _)| k.instrument == instrument && k.enum_id == enum_id)
            .map(|(k, a)| (k.member.clone(), a.value))
            .collect()
    }

    // ------------------------------------------------------------------
    // Append-only series
    // ------------------------------------------------------------------

    pub fn append_snapshots(&self, rows: Vec<MetricSnapshot>) -> Result<InsertOutcome, StoreError> {
        let mut tables = lock(&self.snapshots);
        let (fresh, duplicates) = dedup(rows, |r| (r.class, r.resource, r.collected_at), |r| {
            tables.class(r.class).contains(&(r.resource, r.collected_at))
        });
        if !fresh.is_empty() {
            self.log(&WalRecord::SnapshotsAppended(fresh.clone()))?;
        }
        let inserted = fresh.len();
        for row in fresh {
            tables
                .class_mut(row.class)
                .insert((row.resource, row.collected_at), row);
        }
        Ok(InsertOutcome {
            inserted,
            duplicates,
        })
    }

    pub fn append_statements(&self, rows: Vec<StatementStat>) -> Result<InsertOutcome, StoreError> {
        let mut table = lock(&self.statements);
        let (fresh, duplicates) = dedup(rows, |r| (r.collected_at, r.query_id), |r| {
            table.contains(&(r.collected_at, r.query_id))
        });
        if !fresh.is_empty() {
            self.log(&WalRecord::StatementsAppended(fresh.clone()))?;
        }
        let inserted = fresh.len();
        for row in fresh {
            table.insert((row.collected_at, row.query_id), row);
        }
        Ok(InsertOutcome {
            inserted,
            duplicates,
        })
    }

    /// Insert-if-absent on (table, started_at).
    pub fn insert_vacuum_events(&self, rows: Vec<VacuumEvent>) -> Result<InsertOutcome, StoreError> {
        let mut table = lock(&self.vacuum);
        let (fresh, duplicates) = dedup(rows, VacuumEvent::key, |r| table.contains(&r.key()));
        if !fresh.is_empty() {
            self.log(&WalRecord::VacuumInserted(fresh.clone()))?;
        }
        let inserted = fresh.len();
        for row in fresh {
            table.insert(row.key(), row);
        }
        Ok(InsertOutcome {
            inserted,
            duplicates,
        })
    }

    /// Insert-if-absent on (timestamp, query_id).
    pub fn insert_plan_events(&self, rows: Vec<QueryPlanEvent>) -> Result<InsertOutcome, StoreError> {
        let mut table = lock(&self.plans);
        let (fresh, duplicates) = dedup(rows, QueryPlanEvent::key, |r| table.contains(&r.key()));
        if !fresh.is_empty() {
            self.log(&WalRecord::PlansInserted(fresh.clone()))?;
        }
        let inserted = fresh.len();
        for row in fresh {
            table.insert(row.key(), row);
        }
        Ok(InsertOutcome {
            inserted,
            duplicates,
        })
    }

    pub fn snapshots(
        &self,
        class: ResourceClass,
        resource: ResourceId,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<MetricSnapshot> {
        lock(&self.snapshots)
            .class(class)
            .range(&(resource, from), &(resource, to))
    }

    /// Statement stats of one query id collected within `[from, to]`.
    pub fn statement_stats(
        &self,
        query_id: i64,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<StatementStat> {
        lock(&self.statements)
            .range(&(from, i64::MIN), &(to, i64::MAX))
            .into_iter()
            .filter(|r| r.query_id == query_id)
            .collect()
    }

    pub fn vacuum_events(&self, table: &str, from: Timestamp, to: Timestamp) -> Vec<VacuumEvent> {
        let lo = VacuumKey {
            table: table.to_string(),
            started_at: from,
        };
        let hi = VacuumKey {
            table: table.to_string(),
            started_at: to,
        };
        lock(&self.vacuum).range(&lo, &hi)
    }

    /// Plan events within `[from, to]`, optionally for one query id.
    pub fn plan_events(
        &self,
        query_id: Option<i64>,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<QueryPlanEvent> {
        let lo = PlanKey {
            timestamp: from,
            query_id: i64::MIN,
        };
        let hi = PlanKey {
            timestamp: to,
            query_id: i64::MAX,
        };
        lock(&self.plans)
            .range(&lo, &hi)
            .into_iter()
            .filter(|e| query_id.is_none_or(|q| e.query_id == q))
            .collect()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Atomically replace the intervals of one lane starting within
    /// `[from, to]`.
    pub fn replace_sessions(
        &self,
        instrument: InstrumentId,
        lane: &str,
        from: Timestamp,
        to: Timestamp,
        intervals: Vec<SessionInterval>,
    ) -> Result<usize, StoreError> {
        let catalog = read(&self.catalog);
        if !catalog.contains(instrument) {
            return Err(StoreError::ReferentialViolation { instrument });
        }
        let mut sessions = lock(&self.sessions);
        self.log(&WalRecord::SessionsReplaced {
            instrument,
            lane: lane.to_string(),
            from,
            to,
            intervals: intervals.clone(),
        })?;
        Ok(sessions.replace(instrument, lane, from, to, &intervals))
    }

    pub fn sessions(
        &self,
        instrument: InstrumentId,
        lane: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<SessionInterval> {
        lock(&self.sessions).range(instrument, lane, from, to)
    }

    // ------------------------------------------------------------------
    // Rollups
    // ------------------------------------------------------------------

    /// Run one incremental rollup step for `(series, width_ms)`.
    ///
    /// `compute` receives the rollup state and every raw reading at or
    /// after the stored cursor, and returns the commit to persist (or
    /// `None` if there is nothing to do). The rollup lock is held
    /// throughout, so passes over the same series never interleave.
    pub fn update_rollup<F>(
        &self,
        series: RollupSeries,
        width_ms: i64,
        compute: F,
    ) -> Result<Option<RollupCommit>, StoreError>
    where
        F: FnOnce(&RollupState, Vec<RawReading>) -> Option<RollupCommit>,
    {
        let mut state = lock(&self.rollups);
        let since = state.cursor(series, width_ms).unwrap_or(i64::MIN);
        let raw = self.raw_readings(series, since);

        let Some(commit) = compute(&state, raw) else {
            return Ok(None);
        };
        self.log(&WalRecord::RollupCommitted(commit.clone()))?;
        state.commit(&commit);
        Ok(Some(commit))
    }

    fn raw_readings(&self, series: RollupSeries, since: Timestamp) -> Vec<RawReading> {
        let mut out: Vec<RawReading> = match series.class() {
            Some(class) => lock(&self.snapshots)
                .class(class)
                .values()
                .filter(|r| r.collected_at >= since)
                .map(|r| RawReading {
                    resource: r.resource.key(),
                    at: r.collected_at,
                    values: r.readings.counters.iter().map(|v| *v as f64).collect(),
                    locked: r.locked,
                })
                .collect(),
            None => lock(&self.statements)
                .range(&(since, i64::MIN), &(i64::MAX, i64::MAX))
                .into_iter()
                .map(|r| RawReading {
                    resource: r.query_id as u64,
                    at: r.collected_at,
                    values: r.counter_values(),
                    locked: false,
                })
                .collect(),
        };
        out.sort_by(|a, b| a.at.cmp(&b.at).then(a.resource.cmp(&b.resource)));
        out
    }

    pub fn rollup_buckets(
        &self,
        series: RollupSeries,
        width_ms: i64,
        resource: u64,
        from: Timestamp,
        to: Timestamp,
    ) -> Vec<RollupBucket> {
        lock(&self.rollups).buckets(series, width_ms, resource, from, to)
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete rows of `series` older than `cutoff`. Rollup buckets are
    /// untouched; last readings of resources with no raw rows left are
    /// forgotten.
    pub fn purge_series(&self, series: Series, cutoff: Timestamp) -> Result<usize, StoreError> {
        let record = WalRecord::Purged { series, cutoff };
        let removed = match series {
            Series::DatabaseSnapshots | Series::TableSnapshots | Series::IndexSnapshots => {
                let class = match series {
                    Series::DatabaseSnapshots => ResourceClass::Database,
                    Series::TableSnapshots => ResourceClass::Table,
                    _ => ResourceClass::Index,
                };
                let mut rollups = lock(&self.rollups);
                let mut tables = lock(&self.snapshots);
                let table = tables.class_mut(class);
                if !table.values().any(|r| r.collected_at < cutoff) {
                    return Ok(0);
                }
                self.log(&record)?;
                let removed = purge_snapshots(table, cutoff);
                prune_baselines(&mut rollups, series, cutoff, &snapshot_resources(table));
                removed
            }
            Series::StatementStats => {
                let mut rollups = lock(&self.rollups);
                let mut table = lock(&self.statements);
                if !table.values().any(|r| r.collected_at < cutoff) {
                    return Ok(0);
                }
                self.log(&record)?;
                let removed = table.retain(|r| r.collected_at >= cutoff);
                prune_baselines(&mut rollups, series, cutoff, &statement_resources(&table));
                removed
            }
            Series::VacuumEvents => {
                let mut table = lock(&self.vacuum);
                if !table.values().any(|r| r.finished_at < cutoff) {
                    return Ok(0);
                }
                self.log(&record)?;
                table.retain(|r| r.finished_at >= cutoff)
            }
            Series::PlanEvents => {
                let mut table = lock(&self.plans);
                if !table.values().any(|r| r.timestamp < cutoff) {
                    return Ok(0);
                }
                self.log(&record)?;
                table.retain(|r| r.timestamp >= cutoff)
            }
            Series::ParameterHistory => {
                let mut table = lock(&self.parameters);
                if table.history.oldest().is_none_or(|t| t >= cutoff) {
                    return Ok(0);
                }
                self.log(&record)?;
                table.history.purge_before(cutoff, |_| true)
            }
            Series::EnumHistory => {
                let mut table = lock(&self.enum_members);
                if table.history.oldest().is_none_or(|t| t >= cutoff) {
                    return Ok(0);
                }
                self.log(&record)?;
                table.history.purge_before(cutoff, |_| true)
            }
        };
        if removed > 0 {
            debug!("Purged {} rows from {}", removed, series);
        }
        Ok(removed)
    }

    /// Timestamp of the oldest row of `series`, if any.
    pub fn oldest(&self, series: Series) -> Option<Timestamp> {
        match series {
            Series::DatabaseSnapshots => oldest_snapshot(&lock(&self.snapshots).database),
            Series::TableSnapshots => oldest_snapshot(&lock(&self.snapshots).table),
            Series::IndexSnapshots => oldest_snapshot(&lock(&self.snapshots).index),
            Series::StatementStats => lock(&self.statements).values().map(|r| r.collected_at).min(),
            Series::VacuumEvents => lock(&self.vacuum).values().map(|r| r.finished_at).min(),
            Series::PlanEvents => lock(&self.plans).values().map(|r| r.timestamp).min(),
            Series::ParameterHistory => lock(&self.parameters).history.oldest(),
            Series::EnumHistory => lock(&self.enum_members).history.oldest(),
        }
    }

    /// Row counts; each table is locked on its own, so the numbers are
    /// not a consistent cut.
    pub fn counts(&self) -> StoreCounts {
        let instruments = read(&self.catalog).instruments().count();
        let rollup_buckets = lock(&self.rollups).bucket_count();
        let (parameters, parameter_history) = {
            let t = lock(&self.parameters);
            (t.current.len(), t.history.len())
        };
        let (enum_members, enum_history) = {
            let t = lock(&self.enum_members);
            (t.current.len(), t.history.len())
        };
        let snapshots = {
            let t = lock(&self.snapshots);
            t.database.len() + t.table.len() + t.index.len()
        };
        StoreCounts {
            instruments,
            parameters,
            parameter_history,
            enum_members,
            enum_history,
            snapshots,
            statements: lock(&self.statements).len(),
            vacuum_events: lock(&self.vacuum).len(),
            plan_events: lock(&self.plans).len(),
            sessions: lock(&self.sessions).len(),
            rollup_buckets,
            wal_frames: lock(&self.wal).as_ref().map_or(0, Wal::frames),
        }
    }
}

fn prune_baselines(
    rollups: &mut RollupState,
    series: Series,
    cutoff: Timestamp,
    live: &BTreeSet<u64>,
) {
    let Some(rollup) = RollupSeries::for_series(series) else {
        return;
    };
    let pruned = rollups.prune_last(rollup, cutoff, live);
    if pruned > 0 {
        debug!("Forgot {} {} rollup baselines", pruned, rollup);
    }
}

fn oldest_snapshot(table: &AppendTable<(ResourceId, Timestamp), MetricSnapshot>) -> Option<Timestamp> {
    table.values().map(|r| r.collected_at).min()
}

/// Split a batch into rows not yet stored (first occurrence wins) and a
/// duplicate count.
fn dedup<T, K: Ord>(
    rows: Vec<T>,
    key: impl Fn(&T) -> K,
    exists: impl Fn(&T) -> bool,
) -> (Vec<T>, usize) {
    let mut seen = std::collections::BTreeSet::new();
    let mut fresh = Vec::with_capacity(rows.len());
    let mut duplicates = 0;
    for row in rows {
        if exists(&row) || !seen.insert(key(&row)) {
            duplicates += 1;
        } else {
            fresh.push(row);
        }
    }
    (fresh, duplicates)
}
