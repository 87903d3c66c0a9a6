//! Log mining engine.
//!
//! Extracts two disjoint event classes from the PostgreSQL log:
//! - completed autovacuum runs ([`vacuum::parse_vacuum`])
//! - slow-query plans logged by auto_explain ([`plan::parse_plan`])
//!
//! Parsers return `Option`; a candidate record that does not match the
//! expected shape is counted as malformed and never partially stored.
//! Inserts are insert-if-absent on the natural key, so re-scanning an
//! overlapping window only reports duplicates.

pub mod csvlog;
pub mod jsonlog;
pub mod plan;
pub mod tailer;
pub mod vacuum;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::config::LogFormat;
use crate::storage::model::Timestamp;
use crate::storage::{Store, StoreError};

use csvlog::CsvlogAssembler;
use tailer::FileTailer;

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogRecord {
    pub timestamp: Timestamp,
    /// `LOG`, `ERROR`, ...
    pub severity: String,
    /// Source: `backend_type` (`autovacuum worker`, `client backend`, ...)
    pub backend_kind: String,
    pub message: String,
    pub database_name: Option<String>,
    pub user_name: Option<String>,
    /// Zero or absent when `compute_query_id` is off.
    pub query_id: Option<i64>,
}

/// Counters for one `scan` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub seen: usize,
    pub vacuum_inserted: usize,
    pub vacuum_duplicates: usize,
    pub plans_inserted: usize,
    pub plans_duplicates: usize,
    /// Candidates that failed extraction.
    pub malformed: usize,
    /// Plans below the slow-query threshold.
    pub below_threshold: usize,
}

impl ScanSummary {
    pub fn merge(&mut self, other: &ScanSummary) {
        self.seen += other.seen;
        self.vacuum_inserted += other.vacuum_inserted;
        self.vacuum_duplicates += other.vacuum_duplicates;
        self.plans_inserted += other.plans_inserted;
        self.plans_duplicates += other.plans_duplicates;
        self.malformed += other.malformed;
        self.below_threshold += other.below_threshold;
    }
}

pub struct LogMiner {
    slow_query_threshold: Duration,
}

impl LogMiner {
    pub fn new(slow_query_threshold: Duration) -> Self {
        Self {
            slow_query_threshold,
        }
    }

    /// Extract events from an ordered window of records and store them.
    pub fn scan(&self, store: &Store, records: &[LogRecord]) -> Result<ScanSummary, StoreError> {
        let mut summary = ScanSummary {
            seen: records.len(),
            ..Default::default()
        };
        let threshold_ms = self.slow_query_threshold.as_secs_f64() * 1000.0;

        let mut vacuums = Vec::new();
        let mut plans = Vec::new();
        for record in records {
            if vacuum::is_candidate(record) {
                match vacuum::parse_vacuum(record) {
                    Some(ev) => vacuums.push(ev),
                    None => {
                        debug!("Malformed vacuum record at {}", record.timestamp);
                        summary.malformed += 1;
                    }
                }
            } else if let Some(duration_ms) = plan::announced_duration(record) {
                if duration_ms < threshold_ms {
                    summary.below_threshold += 1;
                    continue;
                }
                match plan::parse_plan(record, self.slow_query_threshold) {
                    Some(ev) => plans.push(ev),
                    None => {
                        debug!("Malformed plan record at {}", record.timestamp);
                        summary.malformed += 1;
                    }
                }
            }
        }

        let outcome = store.insert_vacuum_events(vacuums)?;
        summary.vacuum_inserted = outcome.inserted;
        summary.vacuum_duplicates = outcome.duplicates;
        let outcome = store.insert_plan_events(plans)?;
        summary.plans_inserted = outcome.inserted;
        summary.plans_duplicates = outcome.duplicates;
        Ok(summary)
    }
}

/// Tails one PostgreSQL log file and decodes its records.
pub struct LogStream {
    tailer: FileTailer,
    format: LogFormat,
    csv: CsvlogAssembler,
    malformed: usize,
}

impl LogStream {
    /// Follow `path`, skipping content written before now.
    pub fn follow(path: PathBuf, format: LogFormat) -> io::Result<Self> {
        Ok(Self::with_tailer(FileTailer::new(path)?, format))
    }

    /// Read `path` from its first byte.
    pub fn from_start(path: PathBuf, format: LogFormat) -> io::Result<Self> {
        Ok(Self::with_tailer(FileTailer::from_start(path)?, format))
    }

    fn with_tailer(tailer: FileTailer, format: LogFormat) -> Self {
        Self {
            tailer,
            format,
            csv: CsvlogAssembler::new(),
            malformed: 0,
        }
    }

    /// Records completed since the last call.
    pub fn read_records(&mut self) -> io::Result<Vec<LogRecord>> {
        let lines = self.tailer.read_new_lines()?;
        let mut records = Vec::with_capacity(lines.len());
        for line in &lines {
            let record = match self.format {
                LogFormat::Csvlog => self.csv.push(line),
                LogFormat::Jsonlog if line.trim().is_empty() => None,
                LogFormat::Jsonlog => {
                    let parsed = jsonlog::parse_jsonlog_line(line);
                    if parsed.is_none() {
                        self.malformed += 1;
                    }
                    parsed
                }
            };
            records.extend(record);
        }
        Ok(records)
    }

    /// Lines or records that could not be decoded, since creation.
    pub fn malformed(&self) -> usize {
        self.malformed + self.csv.malformed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn vacuum_record(at: Timestamp, table: &str) -> LogRecord {
        LogRecord {
            timestamp: at,
            severity: "LOG".into(),
            backend_kind: "autovacuum worker".into(),
            message: format!(
                "automatic vacuum of table \"{table}\": index scans: 1\n\
                 pages: 0 removed, 45 remain, 45 scanned (100.00% of total)\n\
                 tuples: 10 removed, 1000 remain, 0 are dead but not yet removable\n\
                 system usage: CPU: user: 0.00 s, system: 0.00 s, elapsed: 0.50 s"
            ),
            ..Default::default()
        }
    }

    fn plan_record(at: Timestamp, query_id: i64, duration_ms: f64) -> LogRecord {
        LogRecord {
            timestamp: at,
            severity: "LOG".into(),
            backend_kind: "client backend".into(),
            message: format!(
                "duration: {duration_ms} ms  plan:\n{{\"Query Text\": \"SELECT 1\", \
                 \"Plan\": {{\"Node Type\": \"Result\", \"Total Cost\": 0.01}}}}"
            ),
            database_name: Some("postgres".into()),
            user_name: Some("app".into()),
            query_id: Some(query_id),
        }
    }

    /// Ten minutes of log with one vacuum and one slow plan per minute.
    fn window(from_min: i64, to_min: i64) -> Vec<LogRecord> {
        let mut out = Vec::new();
        for m in from_min..=to_min {
            out.push(vacuum_record(m * MIN, &format!("db.public.t{m}")));
            out.push(plan_record(m * MIN + 1, m, 2500.0));
            out.push(LogRecord {
                timestamp: m * MIN + 2,
                severity: "LOG".into(),
                backend_kind: "checkpointer".into(),
                message: "checkpoint starting: time".into(),
                ..Default::default()
            });
        }
        out
    }

    #[test]
    fn test_overlapping_windows_match_single_scan() {
        let miner = LogMiner::new(Duration::from_secs(1));

        let once = Store::in_memory();
        miner.scan(&once, &window(0, 9)).unwrap();

        let twice = Store::in_memory();
        let a = miner.scan(&twice, &window(0, 6)).unwrap();
        let b = miner.scan(&twice, &window(4, 9)).unwrap();
        assert_eq!((a.vacuum_inserted, a.plans_inserted), (7, 7));
        assert_eq!((b.vacuum_inserted, b.vacuum_duplicates), (3, 3));
        assert_eq!((b.plans_inserted, b.plans_duplicates), (3, 3));

        let (c1, c2) = (once.counts(), twice.counts());
        assert_eq!(c1.vacuum_events, 10);
        assert_eq!(c1.plan_events, 10);
        assert_eq!(c1.vacuum_events, c2.vacuum_events);
        assert_eq!(c1.plan_events, c2.plan_events);
    }

    #[test]
    fn test_malformed_and_threshold_counted() {
        let miner = LogMiner::new(Duration::from_secs(1));
        let store = Store::in_memory();
        let mut broken = vacuum_record(MIN, "db.public.t");
        broken.message = "automatic vacuum of table \"db.public.t\": index scans: x".into();
        let fast = plan_record(MIN, 7, 20.0);
        let mut no_payload = plan_record(2 * MIN, 8, 5000.0);
        no_payload.message = "duration: 5000.0 ms  plan:\n{not json".into();

        let s = miner.scan(&store, &[broken, fast, no_payload]).unwrap();
        assert_eq!(s.seen, 3);
        assert_eq!(s.malformed, 2);
        assert_eq!(s.below_threshold, 1);
        assert_eq!(store.counts().vacuum_events, 0);
        assert_eq!(store.counts().plan_events, 0);
    }

    #[test]
    fn test_stream_reads_csvlog_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postgresql.csv");
        std::fs::write(
            &path,
            "2024-01-15 14:30:00.500 UTC,\"\",\"\",42,,\"65a5\",1,,\"2024-01-15 14:00:00 UTC\",\
             \"\",0,LOG,00000,\"automatic vacuum of table \"\"db.public.t\"\": index scans: 0\n\
             pages: 1 removed, 2 remain, 2 scanned (100.00% of total)\n\
             tuples: 3 removed, 4 remain, 0 are dead but not yet removable\n\
             system usage: CPU: user: 0.00 s, system: 0.00 s, elapsed: 0.10 s\",,,,,,,,,\"\",\
             autovacuum worker,,0\n",
        )
        .unwrap();

        let mut stream = LogStream::from_start(path, LogFormat::Csvlog).unwrap();
        let records = stream.read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backend_kind, "autovacuum worker");

        let store = Store::in_memory();
        let s = LogMiner::new(Duration::from_secs(1))
            .scan(&store, &records)
            .unwrap();
        assert_eq!(s.vacuum_inserted, 1);
        assert_eq!(stream.malformed(), 0);
    }
}
