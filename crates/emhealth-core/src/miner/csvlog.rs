//! PostgreSQL csvlog decoding.
//!
//! Columns (PG 14+; older versions stop earlier):
//! `log_time,user_name,database_name,process_id,connection_from,session_id,
//!  session_line_num,command_tag,session_start_time,virtual_transaction_id,
//!  transaction_id,error_severity,sql_state_code,message,detail,hint,
//!  internal_query,internal_query_pos,context,query,query_pos,location,
//!  application_name,backend_type,leader_pid,query_id`
//!
//! Quoted fields may contain newlines, so one record can span several
//! physical lines; [`CsvlogAssembler`] buffers until quotes balance.

use tracing::debug;

use crate::util::parse_log_timestamp;

use super::LogRecord;

const COL_LOG_TIME: usize = 0;
const COL_USER: usize = 1;
const COL_DATABASE: usize = 2;
const COL_SEVERITY: usize = 11;
const COL_MESSAGE: usize = 13;
const COL_BACKEND_TYPE: usize = 23;
const COL_QUERY_ID: usize = 25;
const MIN_COLUMNS: usize = COL_MESSAGE + 1;

/// Upper bound on a buffered record; a runaway quote must not grow forever.
const MAX_RECORD_LEN: usize = 4 * 1024 * 1024;

#[derive(Default)]
pub struct CsvlogAssembler {
    pending: String,
    in_quotes: bool,
    malformed: usize,
}

impl CsvlogAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one physical line. Returns a record once it is complete.
    pub fn push(&mut self, line: &str) -> Option<LogRecord> {
        if !self.pending.is_empty() {
            self.pending.push('\n');
        }
        self.pending.push_str(line);
        for c in line.chars() {
            if c == '"' {
                self.in_quotes = !self.in_quotes;
            }
        }

        if self.in_quotes {
            if self.pending.len() > MAX_RECORD_LEN {
                debug!("Dropping oversized csvlog record");
                self.malformed += 1;
                self.reset();
            }
            return None;
        }

        let raw = std::mem::take(&mut self.pending);
        if raw.trim().is_empty() {
            return None;
        }
        let record = parse_csvlog_record(&raw);
        if record.is_none() {
            debug!("Malformed csvlog record: {:.120}", raw);
            self.malformed += 1;
        }
        record
    }

    /// True while a quoted field is still open.
    pub fn has_partial(&self) -> bool {
        self.in_quotes
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.in_quotes = false;
    }
}

/// Decode one complete csvlog record.
pub fn parse_csvlog_record(raw: &str) -> Option<LogRecord> {
    let fields = split_csv_line(raw);
    if fields.len() < MIN_COLUMNS {
        return None;
    }
    let timestamp = parse_log_timestamp(&fields[COL_LOG_TIME])?;
    let severity = fields[COL_SEVERITY].clone();
    if severity.is_empty() {
        return None;
    }

    Some(LogRecord {
        timestamp,
        severity,
        backend_kind: fields.get(COL_BACKEND_TYPE).cloned().unwrap_or_default(),
        message: fields[COL_MESSAGE].clone(),
        database_name: non_empty(&fields[COL_DATABASE]),
        user_name: non_empty(&fields[COL_USER]),
        query_id: fields
            .get(COL_QUERY_ID)
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|id| *id != 0),
    })
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Split a CSV record respecting double-quote escaping.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == ',' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    fields
}
