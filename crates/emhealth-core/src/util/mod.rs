//! Utility modules for emhealth.

mod time;

pub use time::{
    TimeParseError, format_duration, format_millis, now_millis, parse_duration,
    parse_log_timestamp,
};
