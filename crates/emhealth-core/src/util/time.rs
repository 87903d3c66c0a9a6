//! Duration and timestamp parsing.
//!
//! Durations are written the way operators write them in config files:
//! - Single unit: `500ms`, `10s`, `5m`, `1h`, `30d`, `2w`
//! - Compound: `1h30m`, `1d12h`
//! - Bare integer: seconds (`90`)
//!
//! Timestamps come from PostgreSQL logs and telemetry exports:
//! - `2024-01-15 14:30:00.123 UTC` (csvlog / jsonlog, `log_timezone = UTC`)
//! - `2024-01-15 14:30:00.123 +01`, `2025-07-28 10:48:42.685000+0` (numeric offsets)
//! - RFC 3339: `2024-01-15T14:30:00Z`

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

/// Error type for duration / timestamp parsing failures.
#[derive(Debug, Clone)]
pub struct TimeParseError {
    pub input: String,
    pub message: String,
}

impl std::fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to parse '{}': {}", self.input, self.message)
    }
}

impl std::error::Error for TimeParseError {}

/// Current wall clock as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse a human duration string.
///
/// # Examples
///
/// ```
/// use emhealth_core::util::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, TimeParseError> {
    let input = input.trim();
    let err = |message: &str| TimeParseError {
        input: input.to_string(),
        message: message.to_string(),
    };

    if input.is_empty() {
        return Err(err("empty duration"));
    }

    if input.chars().all(|c| c.is_ascii_digit()) {
        let secs: u64 = input.parse().map_err(|_| err("number out of range"))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total_ms: u64 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(err("expected a number, e.g. 10s, 5m, 1h30m, 2d"));
        }
        let number: u64 = rest[..digits]
            .parse()
            .map_err(|_| err("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit_ms: u64 = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            "" => return Err(err("missing unit after number")),
            _ => return Err(err("unknown unit (use ms, s, m, h, d, w)")),
        };
        rest = &rest[unit_len..];

        total_ms = number
            .checked_mul(unit_ms)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| err("duration out of range"))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Format a duration compactly (`1h30m`, `45s`, `250ms`).
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1_000 != 0 {
        return format!("{ms}ms");
    }
    let mut secs = ms / 1_000;
    let mut out = String::new();
    for (unit, size) in [("d", 86_400u64), ("h", 3_600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    out
}

/// Render epoch milliseconds as `YYYY-MM-DD HH:MM:SS` UTC, for log messages.
pub fn format_millis(ts: i64) -> String {
    match Utc.timestamp_millis_opt(ts).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

/// Parse a log / telemetry timestamp into epoch milliseconds.
///
/// Returns `None` for anything that does not look like a timestamp; callers
/// count those as malformed input.
pub fn parse_log_timestamp(input: &str) -> Option<i64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if input.contains('T')
        && let Ok(dt) = DateTime::parse_from_rfc3339(input)
    {
        return Some(dt.timestamp_millis());
    }

    // "YYYY-MM-DD HH:MM:SS[.fff]" is 19+ chars; everything after the
    // fractional part is the zone.
    if input.len() < 19 || !input.is_char_boundary(19) {
        return None;
    }
    let frac_len = input[19..]
        .strip_prefix('.')
        .map(|f| 1 + f.chars().take_while(|c| c.is_ascii_digit()).count())
        .unwrap_or(0);
    let (local, zone) = input.split_at(19 + frac_len);
    let ndt = NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f").ok()?;

    let offset = parse_zone(zone.trim())?;
    let dt = offset.from_local_datetime(&ndt).single()?;
    Some(dt.timestamp_millis())
}

/// Zone suffix: empty / `UTC` / `GMT` / `Z`, or a numeric offset
/// (`+0`, `+01`, `-05`, `+0530`, `+05:30`).
fn parse_zone(zone: &str) -> Option<FixedOffset> {
    match zone {
        "" | "UTC" | "GMT" | "Z" => return FixedOffset::east_opt(0),
        _ => {}
    }

    let sign = match zone.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: String = zone[1..].chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>().ok()?, 0)
    } else {
        let split = digits.len() - 2;
        (
            digits[..split].parse::<i32>().ok()?,
            digits[split..].parse::<i32>().ok()?,
        )
    };
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn test_single_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30d").unwrap(), Duration::from_secs(30 * 86400));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(14 * 86400));
    }

    #[test]
    fn test_compound_and_bare() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d12h").unwrap(), Duration::from_secs(129_600));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 0s ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_invalid_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5 s").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(86_400)), "1d");
    }

    #[test]
    fn test_log_timestamp_utc() {
        let ts = parse_log_timestamp("2024-01-15 14:30:00.123 UTC").unwrap();
        assert_eq!(ts, utc_ms(2024, 1, 15, 14, 30, 0) + 123);

        let ts = parse_log_timestamp("2024-01-15 14:30:00 UTC").unwrap();
        assert_eq!(ts, utc_ms(2024, 1, 15, 14, 30, 0));
    }

    #[test]
    fn test_log_timestamp_offsets() {
        let base = utc_ms(2024, 1, 15, 13, 30, 0);
        assert_eq!(parse_log_timestamp("2024-01-15 14:30:00 +01"), Some(base));
        assert_eq!(parse_log_timestamp("2024-01-15 19:00:00+0530"), Some(base));
        assert_eq!(parse_log_timestamp("2024-01-15 19:00:00 +05:30"), Some(base));

        let ts = parse_log_timestamp("2025-07-28 10:48:42.685000+0").unwrap();
        assert_eq!(ts, utc_ms(2025, 7, 28, 10, 48, 42) + 685);
    }

    #[test]
    fn test_log_timestamp_rfc3339() {
        let ts = parse_log_timestamp("2024-01-15T14:30:00Z").unwrap();
        assert_eq!(ts, utc_ms(2024, 1, 15, 14, 30, 0));
    }

    #[test]
    fn test_log_timestamp_invalid() {
        assert_eq!(parse_log_timestamp(""), None);
        assert_eq!(parse_log_timestamp("not a timestamp"), None);
        assert_eq!(parse_log_timestamp("2024-01-15 14:30:00 CET"), None);
        assert_eq!(parse_log_timestamp("2024-13-15 14:30:00 UTC"), None);
    }
}
