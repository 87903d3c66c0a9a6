//! Session interval detection.
//!
//! Turns a state time series of one lane of one instrument into running
//! sessions:
//!
//! ```text
//!  samples   F  F  T  T  P  T  F  F  T  T  F
//!  paused          ....drop....
//!  edges           ^           v     ^     v
//!  runs            [-----------)     [-----)
//!  debounce        merged when the F gap < debounce window
//!  filter          runs shorter than min_duration dropped
//! ```
//!
//! Detection is a pure function of the samples; [`SessionDetector::rebuild`]
//! swaps the stored intervals for the covered time range in one step, so a
//! lane can be recomputed at any time.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{EngineConfig, SessionLaneConfig};
use crate::ingest::TelemetrySample;
use crate::storage::model::{InstrumentId, ParamKey, SessionInterval, StateValue, Timestamp};
use crate::storage::{Store, StoreError};

/// Which state values count as running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunningPredicate {
    Equals(String),
    OneOf(Vec<String>),
}

impl RunningPredicate {
    /// `None` for an empty list.
    pub fn from_values(values: &[String]) -> Option<Self> {
        match values {
            [] => None,
            [one] => Some(RunningPredicate::Equals(one.clone())),
            many => Some(RunningPredicate::OneOf(many.to_vec())),
        }
    }

    pub fn is_running(&self, value: &StateValue) -> bool {
        match self {
            RunningPredicate::Equals(s) => value.matches(s),
            RunningPredicate::OneOf(set) => set.iter().any(|s| value.matches(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub running: RunningPredicate,
    /// Samples in these states are removed before detection.
    pub paused: Vec<String>,
    pub min_duration: Duration,
    /// Not-running gaps strictly shorter than this merge two runs; zero
    /// disables merging.
    pub debounce: Duration,
}

impl SessionParams {
    /// Parameters for a configured lane; `None` if it has no running state.
    pub fn for_lane(lane: &SessionLaneConfig, config: &EngineConfig) -> Option<Self> {
        Some(Self {
            running: RunningPredicate::from_values(&lane.running)?,
            paused: lane.paused.clone(),
            min_duration: config.min_session_duration.for_lane(&lane.name),
            debounce: config.debounce_window,
        })
    }

    fn is_paused(&self, value: &StateValue) -> bool {
        self.paused.iter().any(|p| value.matches(p))
    }
}

/// One (timestamp, state) sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSample {
    pub at: Timestamp,
    pub value: StateValue,
}

/// Detect sessions in `samples`, which must be ordered by time.
pub fn detect(
    instrument: InstrumentId,
    lane: &str,
    samples: &[StateSample],
    params: &SessionParams,
) -> Vec<SessionInterval> {
    let min_ms = duration_ms(params.min_duration);
    let debounce_ms = duration_ms(params.debounce);

    let mut runs: Vec<SessionInterval> = Vec::new();
    let mut started: Option<Timestamp> = None;
    for sample in samples.iter().filter(|s| !params.is_paused(&s.value)) {
        let running = params.running.is_running(&sample.value);
        match (started, running) {
            (None, true) => started = Some(sample.at),
            (Some(start), false) => {
                started = None;
                let run = SessionInterval {
                    instrument,
                    lane: lane.to_string(),
                    start,
                    end: sample.at,
                    terminal_state: sample.value.clone(),
                };
                match runs.last_mut() {
                    Some(prev) if debounce_ms > 0 && run.start - prev.end < debounce_ms => {
                        prev.end = run.end;
                        prev.terminal_state = run.terminal_state;
                    }
                    _ => runs.push(run),
                }
            }
            _ => {}
        }
    }

    runs.retain(|r| r.duration_ms() >= min_ms);
    runs
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Summary of a multi-lane backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub lanes: usize,
    pub samples: usize,
    pub sessions: usize,
    /// Rows whose value did not fit the parameter's type.
    pub untyped: usize,
}

pub struct SessionDetector;

impl SessionDetector {
    /// Recompute one lane over the time range covered by `samples` and
    /// replace the stored intervals of that range.
    pub fn rebuild(
        store: &Store,
        instrument: InstrumentId,
        lane: &str,
        samples: &[StateSample],
        params: &SessionParams,
    ) -> Result<usize, StoreError> {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Ok(0);
        };
        let intervals = detect(instrument, lane, samples, params);
        let n = store.replace_sessions(instrument, lane, first.at, last.at, intervals)?;
        debug!(
            "Rebuilt {} sessions for instrument {} lane {}",
            n, instrument, lane
        );
        Ok(n)
    }

    /// Rebuild every configured lane from a telemetry dump.
    pub fn backfill(
        store: &Store,
        config: &EngineConfig,
        telemetry: &[TelemetrySample],
    ) -> Result<BackfillSummary, StoreError> {
        let mut summary = BackfillSummary::default();
        for lane in &config.session_lanes {
            let Some(params) = SessionParams::for_lane(lane, config) else {
                continue;
            };

            let mut per_instrument: BTreeMap<InstrumentId, Vec<StateSample>> = BTreeMap::new();
            for row in telemetry.iter().filter(|t| t.param_id == lane.parameter_id) {
                let key = ParamKey {
                    instrument: row.instrument,
                    param_id: row.param_id,
                };
                let value_type = store.parameter(&key).map(|p| p.value_type);
                match row.state(value_type) {
                    Some(value) => per_instrument
                        .entry(row.instrument)
                        .or_default()
                        .push(StateSample { at: row.at, value }),
                    None => summary.untyped += 1,
                }
            }

            for (instrument, mut samples) in per_instrument {
                samples.sort_by_key(|s| s.at);
                summary.samples += samples.len();
                summary.sessions +=
                    Self::rebuild(store, instrument, &lane.name, &samples, &params)?;
                summary.lanes += 1;
            }
        }
        info!(
            "Session backfill: {} sessions from {} samples ({} lanes)",
            summary.sessions, summary.samples, summary.lanes
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::parse_telemetry;
    use crate::storage::model::InstrumentSpec;

    const T0: Timestamp = 1_700_000_000_000;
    const SEC: i64 = 1000;

    fn params(min_secs: u64, debounce_secs: u64) -> SessionParams {
        SessionParams {
            running: RunningPredicate::Equals("Running".into()),
            paused: vec!["Paused".into()],
            min_duration: Duration::from_secs(min_secs),
            debounce: Duration::from_secs(debounce_secs),
        }
    }

    fn series(states: &[&str]) -> Vec<StateSample> {
        states
            .iter()
            .enumerate()
            .map(|(i, s)| StateSample {
                at: T0 + i as i64 * SEC,
                value: StateValue::Text((*s).into()),
            })
            .collect()
    }

    fn spans(intervals: &[SessionInterval]) -> Vec<(i64, i64)> {
        intervals
            .iter()
            .map(|i| ((i.start - T0) / SEC, (i.end - T0) / SEC))
            .collect()
    }

    #[test]
    fn test_single_run_and_min_duration() {
        let s = series(&["Idle", "Idle", "Running", "Running", "Running", "Idle", "Idle"]);
        let found = detect(1, "epu", &s, &params(1, 0));
        assert_eq!(spans(&found), vec![(2, 5)]);
        assert_eq!(found[0].terminal_state, StateValue::Text("Idle".into()));

        assert!(detect(1, "epu", &s, &params(10, 0)).is_empty());
    }

    #[test]
    fn test_first_sample_running_and_unterminated_tail() {
        let s = series(&["Running", "Running", "Idle", "Running", "Running"]);
        assert_eq!(spans(&detect(1, "epu", &s, &params(0, 0))), vec![(0, 2)]);
    }

    #[test]
    fn test_pause_does_not_end_run() {
        let s = series(&["Idle", "Running", "Paused", "Paused", "Running", "Error"]);
        let found = detect(1, "epu", &s, &params(1, 0));
        assert_eq!(spans(&found), vec![(1, 5)]);
        assert_eq!(found[0].terminal_state, StateValue::Text("Error".into()));
    }

    #[test]
    fn test_debounce_merges_short_gaps() {
        // Gaps: 2s between the first two runs, 4s before the third.
        let s = series(&[
            "Running", "Running", "Idle", "Idle", "Running", "Idle", "Idle", "Idle", "Idle",
            "Running", "Idle",
        ]);
        assert_eq!(
            spans(&detect(1, "epu", &s, &params(0, 0))),
            vec![(0, 2), (4, 5), (9, 10)]
        );
        assert_eq!(
            spans(&detect(1, "epu", &s, &params(0, 3))),
            vec![(0, 5), (9, 10)]
        );
        // Strictly shorter: a 2s window does not merge a 2s gap.
        assert_eq!(spans(&detect(1, "epu", &s, &params(0, 2))).len(), 3);
    }

    #[test]
    fn test_numeric_states_and_one_of() {
        let samples: Vec<StateSample> = [0.0, 3.0, 4.0, 3.0, 1.0]
            .iter()
            .enumerate()
            .map(|(i, v)| StateSample {
                at: T0 + i as i64 * SEC,
                value: StateValue::Num(*v),
            })
            .collect();
        let p = SessionParams {
            running: RunningPredicate::from_values(&["3".into(), "4".into()]).unwrap(),
            paused: Vec::new(),
            min_duration: Duration::ZERO,
            debounce: Duration::ZERO,
        };
        let found = detect(7, "autoloader", &samples, &p);
        assert_eq!(spans(&found), vec![(1, 4)]);
        assert_eq!(found[0].terminal_state, StateValue::Num(1.0));
        assert_eq!(found[0].instrument, 7);
        assert!(RunningPredicate::from_values(&[]).is_none());
    }

    #[test]
    fn test_rebuild_replaces_range() {
        let store = Store::in_memory();
        let id = store
            .upsert_instrument(InstrumentSpec {
                name: "krios-1".into(),
                serial: 1,
                model: "Titan Krios G4".into(),
                display_name: "Krios 1".into(),
                template: "krios".into(),
                server: "10.0.0.5".into(),
            })
            .unwrap();

        let s = series(&["Idle", "Running", "Running", "Idle", "Running", "Idle"]);
        assert_eq!(SessionDetector::rebuild(&store, id, "epu", &s, &params(0, 0)).unwrap(), 2);
        assert_eq!(store.sessions(id, "epu", T0, T0 + 10 * SEC).len(), 2);

        // Stricter threshold over the same range drops the short run.
        assert_eq!(SessionDetector::rebuild(&store, id, "epu", &s, &params(2, 0)).unwrap(), 1);
        let stored = store.sessions(id, "epu", T0, T0 + 10 * SEC);
        assert_eq!(spans(&stored), vec![(1, 3)]);

        assert!(matches!(
            SessionDetector::rebuild(&store, id + 1, "epu", &s, &params(0, 0)),
            Err(StoreError::ReferentialViolation { .. })
        ));
    }

    #[test]
    fn test_backfill_from_telemetry() {
        let store = Store::in_memory();
        let id = store
            .upsert_instrument(InstrumentSpec {
                name: "krios-1".into(),
                serial: 1,
                model: "Titan Krios G4".into(),
                display_name: "Krios 1".into(),
                template: "krios".into(),
                server: "10.0.0.5".into(),
            })
            .unwrap();
        let config = EngineConfig::from_toml(
            r#"
[min_session_duration]
epu = "2s"

[[session_lane]]
name = "epu"
parameter_id = 93
running = ["Running"]
paused = ["Paused"]
"#,
        )
        .unwrap();

        let dump = format!(
            "2024-01-15 10:00:00+00\t{id}\t93\t\\N\tIdle\n\
             2024-01-15 10:00:05+00\t{id}\t93\t\\N\tRunning\n\
             2024-01-15 10:00:09+00\t{id}\t93\t\\N\tPaused\n\
             2024-01-15 10:00:20+00\t{id}\t93\t\\N\tIdle\n\
             2024-01-15 10:00:21+00\t{id}\t94\t7.5\t\\N\n"
        );
        let (telemetry, malformed) = parse_telemetry(&dump);
        assert_eq!(malformed, 0);

        let summary = SessionDetector::backfill(&store, &config, &telemetry).unwrap();
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.sessions, 1);
        let stored = store.sessions(id, "epu", 0, i64::MAX);
        assert_eq!(stored[0].duration_ms(), 15_000);
    }
}
