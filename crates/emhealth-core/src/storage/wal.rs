//! Write-ahead log.
//!
//! Frame layout:
//! ```text
//! [len: u32 LE][crc32(payload): u32 LE][payload: postcard(WalRecord)]
//! ```
//! Every frame is fsynced before the mutation it describes becomes visible.
//! On open the log is replayed up to the first short or checksum-failing
//! frame and the torn tail is truncated.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::StoreError;
use super::model::{
    EnumDefinition, EnumMemberAttrs, EnumMemberKey, Instrument, InstrumentId, MetricSnapshot,
    ParamKey, ParameterAttrs, QueryPlanEvent, Series, SessionInterval, StatementStat, Timestamp,
    VacuumEvent,
};
use super::tables::RollupCommit;

const FRAME_HEADER: usize = 8;

/// Largest frame accepted on replay; anything bigger is a torn length field.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One committed mutation, recorded with everything needed to reproduce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    InstrumentUpserted(Instrument),
    InstrumentDeleted {
        id: InstrumentId,
    },
    /// Dependent derived rows of an instrument older than `before` removed.
    InstrumentDataPurged {
        id: InstrumentId,
        before: Timestamp,
    },
    EnumDefined(EnumDefinition),
    ParameterApplied {
        key: ParamKey,
        attrs: ParameterAttrs,
        /// Superseded attributes, `None` for an insert.
        before: Option<ParameterAttrs>,
        at: Timestamp,
    },
    EnumMemberApplied {
        key: EnumMemberKey,
        attrs: EnumMemberAttrs,
        before: Option<EnumMemberAttrs>,
        at: Timestamp,
    },
    SnapshotsAppended(Vec<MetricSnapshot>),
    StatementsAppended(Vec<StatementStat>),
    VacuumInserted(Vec<VacuumEvent>),
    PlansInserted(Vec<QueryPlanEvent>),
    SessionsReplaced {
        instrument: InstrumentId,
        lane: String,
        from: Timestamp,
        to: Timestamp,
        intervals: Vec<SessionInterval>,
    },
    RollupCommitted(RollupCommit),
    Purged {
        series: Series,
        cutoff: Timestamp,
    },
}

pub struct Wal {
    path: PathBuf,
    file: File,
    frames: usize,
}

impl Wal {
    /// Open (or create) the log and return every intact record.
    pub fn open(path: &Path) -> Result<(Wal, Vec<WalRecord>), StoreError> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (records, valid_end) = decode_frames(&data);
        if valid_end < data.len() {
            warn!(
                "WAL corruption detected: {} garbage bytes after {} valid records. Truncating WAL.",
                data.len() - valid_end,
                records.len()
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(valid_end as u64)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;

        let frames = records.len();
        Ok((
            Wal {
                path: path.to_path_buf(),
                file,
                frames,
            },
            records,
        ))
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<(), StoreError> {
        let frame = encode_frame(record)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.frames += 1;
        Ok(())
    }

    /// Drop every frame; called once a checkpoint covers them.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.frames = 0;
        Ok(())
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_frame(record: &WalRecord) -> Result<Vec<u8>, StoreError> {
    let payload = postcard::to_allocvec(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Codec(format!("WAL record too large: {} bytes", payload.len())))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode frames until the first incomplete or invalid one.
/// Returns the records and the byte offset where valid data ends.
fn decode_frames(data: &[u8]) -> (Vec<WalRecord>, usize) {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while data.len() - pos >= FRAME_HEADER {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let crc = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        if len > MAX_FRAME_LEN || data.len() - pos - FRAME_HEADER < len {
            break;
        }
        let payload = &data[pos + FRAME_HEADER..pos + FRAME_HEADER + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        match postcard::from_bytes::<WalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        pos += FRAME_HEADER + len;
    }

    (records, pos)
}
