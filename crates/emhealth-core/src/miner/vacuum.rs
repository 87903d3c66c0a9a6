//! Autovacuum completion records.
//!
//! Shape (`log_autovacuum_min_duration`, PG 12+):
//!
//! ```text
//! automatic [aggressive ]vacuum [to prevent wraparound ]of table "db.schema.t": index scans: 1
//! pages: 0 removed, 45 remain, 45 scanned (100.00% of total)
//! tuples: 10 removed, 1000 remain, 0 are dead but not yet removable
//! ...
//! system usage: CPU: user: 0.00 s, system: 0.00 s, elapsed: 0.01 s
//! ```
//!
//! Extraction is keyword scanning; the surrounding lines vary between
//! major versions and are ignored.

use crate::storage::model::VacuumEvent;

use super::LogRecord;

const BACKEND_KIND: &str = "autovacuum worker";
const PREFIX: &str = "automatic ";

/// A record this module is responsible for: an autovacuum worker
/// reporting a vacuum (not analyze) run.
pub fn is_candidate(record: &LogRecord) -> bool {
    if record.backend_kind != BACKEND_KIND {
        return false;
    }
    let Some(head) = record.message.strip_prefix(PREFIX) else {
        return false;
    };
    let head = head.split(" of table").next().unwrap_or("");
    head.split_whitespace().any(|w| w == "vacuum")
}

/// Extract a completed vacuum run. `None` unless every field is present.
pub fn parse_vacuum(record: &LogRecord) -> Option<VacuumEvent> {
    if !is_candidate(record) {
        return None;
    }
    let msg = record.message.as_str();
    let first_line = msg.lines().next()?;

    let table = quoted_after(first_line, "of table \"")?;
    let index_scans = token_after(first_line, "index scans: ")?.parse().ok()?;
    let (pages_removed, pages_remaining) = removed_remain(msg, "pages: ")?;
    let (tuples_removed, tuples_remaining) = removed_remain(msg, "tuples: ")?;
    let elapsed_s: f64 = token_after(msg, "elapsed: ")?.parse().ok()?;
    if !elapsed_s.is_finite() || elapsed_s < 0.0 {
        return None;
    }
    let elapsed_ms = (elapsed_s * 1000.0).round() as i64;

    Some(VacuumEvent {
        table: table.to_string(),
        started_at: record.timestamp - elapsed_ms,
        finished_at: record.timestamp,
        elapsed_ms,
        index_scans,
        pages_removed,
        pages_remaining,
        tuples_removed,
        tuples_remaining,
        wraparound: first_line.contains("to prevent wraparound"),
        aggressive: first_line.contains("aggressive"),
        detail: msg.to_string(),
    })
}

/// Text between `marker` and the next `"`.
fn quoted_after<'a>(s: &'a str, marker: &str) -> Option<&'a str> {
    let start = s.find(marker)? + marker.len();
    let len = s[start..].find('"')?;
    let name = &s[start..start + len];
    (!name.is_empty()).then_some(name)
}

/// Numeric token right after `marker`.
fn token_after<'a>(s: &'a str, marker: &str) -> Option<&'a str> {
    let start = s.find(marker)? + marker.len();
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let token = &rest[..end];
    (!token.is_empty()).then_some(token)
}

/// `<marker>N removed, M remain`
fn removed_remain(s: &str, marker: &str) -> Option<(i64, i64)> {
    let start = s.find(marker)? + marker.len();
    let line = s[start..].lines().next()?;
    let mut parts = line.split(", ");
    let removed = parts.next()?.strip_suffix(" removed")?.parse().ok()?;
    let remain = parts.next()?.strip_suffix(" remain")?.parse().ok()?;
    Some((removed, remain))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            timestamp: 1_700_000_010_000,
            severity: "LOG".into(),
            backend_kind: BACKEND_KIND.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    const PG15: &str = "automatic vacuum of table \"mydb.public.users\": index scans: 1\n\
        pages: 3 removed, 120 remain, 120 scanned (100.00% of total)\n\
        tuples: 500 removed, 10000 remain, 0 are dead but not yet removable\n\
        removable cutoff: 748, which was 0 XIDs old when operation ended\n\
        avg read rate: 0.000 MB/s, avg write rate: 0.000 MB/s\n\
        buffer usage: 250 hits, 0 misses, 3 dirtied\n\
        system usage: CPU: user: 0.01 s, system: 0.00 s, elapsed: 2.50 s";

    #[test]
    fn test_parse_pg15_record() {
        let ev = parse_vacuum(&record(PG15)).unwrap();
        assert_eq!(ev.table, "mydb.public.users");
        assert_eq!(ev.index_scans, 1);
        assert_eq!((ev.pages_removed, ev.pages_remaining), (3, 120));
        assert_eq!((ev.tuples_removed, ev.tuples_remaining), (500, 10000));
        assert_eq!(ev.elapsed_ms, 2500);
        assert_eq!(ev.finished_at, 1_700_000_010_000);
        assert_eq!(ev.started_at, 1_700_000_007_500);
        assert!(!ev.wraparound);
        assert!(!ev.aggressive);
    }

    #[test]
    fn test_parse_pg12_record() {
        let msg = "automatic vacuum of table \"db.s.t\": index scans: 0\n\
            pages: 0 removed, 45 remain, 0 skipped due to pins, 0 skipped frozen\n\
            tuples: 0 removed, 900 remain, 0 are dead but not yet removable, oldest xmin: 1234\n\
            system usage: CPU: user: 0.00 s, system: 0.00 s, elapsed: 0.00 s";
        let ev = parse_vacuum(&record(msg)).unwrap();
        assert_eq!(ev.table, "db.s.t");
        assert_eq!(ev.pages_remaining, 45);
        assert_eq!(ev.elapsed_ms, 0);
    }

    #[test]
    fn test_wraparound_flags() {
        let msg = PG15.replace(
            "automatic vacuum of",
            "automatic aggressive vacuum to prevent wraparound of",
        );
        let ev = parse_vacuum(&record(&msg)).unwrap();
        assert!(ev.wraparound);
        assert!(ev.aggressive);
    }

    #[test]
    fn test_non_candidates() {
        let analyze = "automatic analyze of table \"db.s.t\"\n\
            system usage: CPU: user: 0.00 s, system: 0.00 s, elapsed: 0.01 s";
        assert!(!is_candidate(&record(analyze)));

        let mut other_backend = record(PG15);
        other_backend.backend_kind = "client backend".into();
        assert!(!is_candidate(&other_backend));
        assert!(parse_vacuum(&other_backend).is_none());
    }

    #[test]
    fn test_incomplete_record_dropped() {
        let truncated = "automatic vacuum of table \"db.s.t\": index scans: 1\n\
            pages: 3 removed, 120 remain";
        assert!(is_candidate(&record(truncated)));
        assert!(parse_vacuum(&record(truncated)).is_none());

        let no_table = PG15.replace("\"mydb.public.users\"", "mydb.public.users");
        assert!(parse_vacuum(&record(&no_table)).is_none());
    }
}
