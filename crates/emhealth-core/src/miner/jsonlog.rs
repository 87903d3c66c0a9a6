//! PostgreSQL jsonlog decoding (PG 15+, one JSON object per line).

use serde::Deserialize;

use crate::util::parse_log_timestamp;

use super::LogRecord;

#[derive(Deserialize)]
struct JsonlogLine {
    timestamp: String,
    user: Option<String>,
    dbname: Option<String>,
    error_severity: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    backend_type: String,
    query_id: Option<i64>,
}

pub fn parse_jsonlog_line(line: &str) -> Option<LogRecord> {
    let raw: JsonlogLine = serde_json::from_str(line.trim()).ok()?;
    let timestamp = parse_log_timestamp(&raw.timestamp)?;
    Some(LogRecord {
        timestamp,
        severity: raw.error_severity,
        backend_kind: raw.backend_type,
        message: raw.message,
        database_name: raw.dbname.filter(|s| !s.is_empty()),
        user_name: raw.user.filter(|s| !s.is_empty()),
        query_id: raw.query_id.filter(|id| *id != 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let line = r#"{"timestamp":"2024-01-15 14:30:00.123 UTC","user":"app","dbname":"shop","pid":4242,"session_id":"65a5.1092","line_num":3,"error_severity":"LOG","message":"duration: 1500.000 ms  plan:\n{\"Plan\": {}}","backend_type":"client backend","query_id":918273}"#;
        let rec = parse_jsonlog_line(line).unwrap();
        assert_eq!(rec.timestamp, 1_705_329_000_123);
        assert_eq!(rec.severity, "LOG");
        assert_eq!(rec.backend_kind, "client backend");
        assert_eq!(rec.user_name.as_deref(), Some("app"));
        assert_eq!(rec.database_name.as_deref(), Some("shop"));
        assert_eq!(rec.query_id, Some(918273));
        assert!(rec.message.contains('\n'));
    }

    #[test]
    fn test_background_worker_line() {
        let line = r#"{"timestamp":"2024-01-15 14:30:00.000 UTC","pid":77,"error_severity":"LOG","message":"automatic analyze of table \"db.s.t\"","backend_type":"autovacuum worker","query_id":0}"#;
        let rec = parse_jsonlog_line(line).unwrap();
        assert_eq!(rec.user_name, None);
        assert_eq!(rec.query_id, None);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(parse_jsonlog_line("not json").is_none());
        assert!(parse_jsonlog_line(r#"{"error_severity":"LOG"}"#).is_none());
        assert!(
            parse_jsonlog_line(r#"{"timestamp":"yesterday","error_severity":"LOG"}"#).is_none()
        );
    }
}
