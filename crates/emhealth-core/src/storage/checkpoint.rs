//! Checkpoint file and schema migrations.
//!
//! File layout:
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ HEADER (8 bytes, uncompressed)           │
//! │   magic: [u8; 4]     = b"EMH1"           │
//! │   version: u16       = SCHEMA_VERSION    │
//! │   _reserved: u16     = 0                 │
//! ├──────────────────────────────────────────┤
//! │ BODY                                     │
//! │   zstd(postcard(StoreImage))             │
//! └──────────────────────────────────────────┘
//! ```
//! Written to `state.tmp` and renamed over `state.bin`.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::StoreError;
use super::model::{
    EnumMemberAttrs, EnumMemberKey, InstrumentId, MetricSnapshot, ParamKey, ParameterAttrs,
    PlanKey, QueryPlanEvent, ResourceId, RollupSeries, Series, StatementStat, Timestamp, VacuumEvent, VacuumKey,
};
use super::tables::{AppendTable, Catalog, RollupState, SessionTable, SnapshotTables};
use super::tracked::Tracked;
use super::wal::WalRecord;

const MAGIC: [u8; 4] = *b"EMH1";
const HEADER_SIZE: usize = 8;
const ZSTD_LEVEL: i32 = 3;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u16 = 1;

/// One step of the migration chain: transforms an image stored at
/// `from` into the layout of `from + 1`.
pub struct MigrationStep {
    pub from: u16,
    pub apply: fn(StoreImage) -> Result<StoreImage, String>,
}

/// Steps applied in order to images older than `SCHEMA_VERSION`.
pub const MIGRATIONS: &[MigrationStep] = &[];

pub type StatementTable = AppendTable<(Timestamp, i64), StatementStat>;

/// Every table of the store as plain data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreImage {
    pub catalog: Catalog,
    pub parameters: Tracked<ParamKey, ParameterAttrs>,
    pub enum_members: Tracked<EnumMemberKey, EnumMemberAttrs>,
    pub snapshots: SnapshotTables,
    pub statements: StatementTable,
    pub vacuum: AppendTable<VacuumKey, VacuumEvent>,
    pub plans: AppendTable<PlanKey, QueryPlanEvent>,
    pub sessions: SessionTable,
    pub rollups: RollupState,
}

impl StoreImage {
    /// Replay one WAL record.
    pub fn apply(&mut self, record: &WalRecord) {
        match record {
            WalRecord::InstrumentUpserted(instrument) => {
                self.catalog.upsert_instrument(instrument.clone())
            }
            WalRecord::InstrumentDeleted { id } => {
                cascade_delete(
                    *id,
                    &mut self.catalog,
                    &mut self.parameters,
                    &mut self.enum_members,
                    &mut self.sessions,
                );
            }
            WalRecord::InstrumentDataPurged { id, before } => {
                purge_instrument_data(
                    *id,
                    *before,
                    &mut self.parameters,
                    &mut self.enum_members,
                    &mut self.sessions,
                );
            }
            WalRecord::EnumDefined(def) => self.catalog.define_enum(def.clone()),
            WalRecord::ParameterApplied { key, attrs, at, .. } => {
                self.parameters.apply(*key, attrs.clone(), *at);
            }
            WalRecord::EnumMemberApplied { key, attrs, at, .. } => {
                self.enum_members.apply(key.clone(), *attrs, *at);
            }
            WalRecord::SnapshotsAppended(rows) => {
                for row in rows {
                    self.snapshots
                        .class_mut(row.class)
                        .insert((row.resource, row.collected_at), row.clone());
                }
            }
            WalRecord::StatementsAppended(rows) => {
                for row in rows {
                    self.statements
                        .insert((row.collected_at, row.query_id), row.clone());
                }
            }
            WalRecord::VacuumInserted(rows) => {
                for row in rows {
                    self.vacuum.insert(row.key(), row.clone());
                }
            }
            WalRecord::PlansInserted(rows) => {
                for row in rows {
                    self.plans.insert(row.key(), row.clone());
                }
            }
            WalRecord::SessionsReplaced {
                instrument,
                lane,
                from,
                to,
                intervals,
            } => {
                self.sessions
                    .replace(*instrument, lane, *from, *to, intervals);
            }
            WalRecord::RollupCommitted(commit) => self.rollups.commit(commit),
            WalRecord::Purged { series, cutoff } => {
                self.purge(*series, *cutoff);
            }
        }
    }

    fn purge(&mut self, series: Series, cutoff: Timestamp) -> usize {
        let removed = match series {
            Series::DatabaseSnapshots => purge_snapshots(&mut self.snapshots.database, cutoff),
            Series::TableSnapshots => purge_snapshots(&mut self.snapshots.table, cutoff),
            Series::IndexSnapshots => purge_snapshots(&mut self.snapshots.index, cutoff),
            Series::StatementStats => self.statements.retain(|r| r.collected_at >= cutoff),
            Series::VacuumEvents => self.vacuum.retain(|r| r.finished_at >= cutoff),
            Series::PlanEvents => self.plans.retain(|r| r.timestamp >= cutoff),
            Series::ParameterHistory => self.parameters.history.purge_before(cutoff, |_| true),
            Series::EnumHistory => self.enum_members.history.purge_before(cutoff, |_| true),
        };
        if let Some(rollup) = RollupSeries::for_series(series) {
            let live = match rollup.class() {
                Some(class) => snapshot_resources(self.snapshots.class(class)),
                None => statement_resources(&self.statements),
            };
            self.rollups.prune_last(rollup, cutoff, &live);
        }
        removed
    }
}

/// Rollup resource keys still present in a snapshot table.
pub(crate) fn snapshot_resources(
    table: &AppendTable<(ResourceId, Timestamp), MetricSnapshot>,
) -> BTreeSet<u64> {
    table.values().map(|r| r.resource.key()).collect()
}

/// Rollup resource keys (query ids) still present in the statement table.
pub(crate) fn statement_resources(table: &StatementTable) -> BTreeSet<u64> {
    table.values().map(|r| r.query_id as u64).collect()
}

pub(crate) fn purge_snapshots(
    table: &mut AppendTable<(ResourceId, Timestamp), MetricSnapshot>,
    cutoff: Timestamp,
) -> usize {
    table.retain(|r| r.collected_at >= cutoff)
}

/// Remove an instrument and everything it owns.
pub(crate) fn cascade_delete(
    id: InstrumentId,
    catalog: &mut Catalog,
    parameters: &mut Tracked<ParamKey, ParameterAttrs>,
    enum_members: &mut Tracked<EnumMemberKey, EnumMemberAttrs>,
    sessions: &mut SessionTable,
) -> usize {
    let mut removed = parameters.remove_where(|k| k.instrument == id);
    removed += enum_members.remove_where(|k| k.instrument == id);
    removed += sessions.remove_instrument(id);
    catalog.remove_instrument(id);
    removed
}

/// Drop derived rows of an instrument older than `before`: history of its
/// parameters and enumerations, and its session intervals.
pub(crate) fn purge_instrument_data(
    id: InstrumentId,
    before: Timestamp,
    parameters: &mut Tracked<ParamKey, ParameterAttrs>,
    enum_members: &mut Tracked<EnumMemberKey, EnumMemberAttrs>,
    sessions: &mut SessionTable,
) -> usize {
    let mut removed = parameters
        .history
        .purge_before(before, |k| k.instrument == id);
    removed += enum_members
        .history
        .purge_before(before, |k| k.instrument == id);
    removed += sessions.purge_instrument(id, before);
    removed
}

/// Write the image atomically.
pub fn write_checkpoint(path: &Path, image: &StoreImage) -> Result<(), StoreError> {
    let raw = postcard::to_allocvec(image)?;
    let body = zstd::encode_all(&raw[..], ZSTD_LEVEL)?;

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&SCHEMA_VERSION.to_le_bytes());

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&header)?;
    file.write_all(&body)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Read a checkpoint, running pending migrations.
///
/// Returns the image and whether it was migrated (caller must persist it).
pub fn read_checkpoint(path: &Path) -> Result<Option<(StoreImage, bool)>, StoreError> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if data.len() < HEADER_SIZE {
        return Err(StoreError::Corrupt(format!(
            "{}: truncated header ({} bytes)",
            path.display(),
            data.len()
        )));
    }
    if data[0..4] != MAGIC {
        return Err(StoreError::Corrupt(format!(
            "invalid magic: expected EMH1, got {:?}",
            &data[0..4]
        )));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);

    let raw = zstd::decode_all(&data[HEADER_SIZE..])
        .map_err(|e| StoreError::Corrupt(format!("decompress failed: {e}")))?;
    let image: StoreImage = postcard::from_bytes(&raw)
        .map_err(|e| StoreError::Corrupt(format!("decode failed: {e}")))?;

    let (image, migrated) = migrate(image, version, SCHEMA_VERSION, MIGRATIONS)?;
    Ok(Some((image, migrated)))
}

/// Run the chain from `stored` up to `target`. Either every step succeeds
/// and the final image is returned, or nothing is.
pub fn migrate(
    mut image: StoreImage,
    stored: u16,
    target: u16,
    steps: &[MigrationStep],
) -> Result<(StoreImage, bool), StoreError> {
    if stored > target {
        return Err(StoreError::Migration {
            from: stored,
            to: target,
            reason: "state was written by a newer version".to_string(),
        });
    }

    let mut version = stored;
    while version < target {
        let step = steps
            .iter()
            .find(|s| s.from == version)
            .ok_or_else(|| StoreError::Migration {
                from: version,
                to: version + 1,
                reason: "no migration step".to_string(),
            })?;
        image = (step.apply)(image).map_err(|reason| StoreError::Migration {
            from: version,
            to: version + 1,
            reason,
        })?;
        info!("Migrated state schema {} -> {}", version, version + 1);
        version += 1;
    }

    Ok((image, stored != target))
}
