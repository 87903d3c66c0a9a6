use serde::{Deserialize, Serialize};

use super::{InstrumentId, Timestamp};

/// Telemetry value of a state parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Num(f64),
    Text(String),
}

impl StateValue {
    /// Compare against a configured state name. Numeric states match
    /// numerically (`"3"` matches `Num(3.0)`).
    pub fn matches(&self, expected: &str) -> bool {
        match self {
            StateValue::Text(s) => s == expected,
            StateValue::Num(v) => expected.trim().parse::<f64>().is_ok_and(|e| e == *v),
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::Num(v) => write!(f, "{v}"),
            StateValue::Text(s) => f.write_str(s),
        }
    }
}

/// A detected run of the running state on one lane of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInterval {
    pub instrument: InstrumentId,
    pub lane: String,
    pub start: Timestamp,
    pub end: Timestamp,
    /// State observed at the falling edge.
    pub terminal_state: StateValue,
}

impl SessionInterval {
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }
}
