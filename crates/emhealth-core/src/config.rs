//! Engine configuration.
//!
//! Loaded from TOML; every option has a default. Durations are human
//! strings (`"500ms"`, `"10s"`, `"1h30m"`, `"30d"`) or integer seconds.
//! `validate` must pass before the engine starts; any violation is fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::storage::model::{ResourceClass, Series};
use crate::util::parse_duration;

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid { field: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {e}"),
            ConfigError::Parse(e) => write!(f, "invalid config syntax: {e}"),
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// A duration written as `"10s"`-style text or integer seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Secs(s) => Ok(HumanDuration(Duration::from_secs(s))),
            Raw::Text(t) => parse_duration(&t)
                .map(HumanDuration)
                .map_err(serde::de::Error::custom),
        }
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    HumanDuration::deserialize(d).map(|h| h.0)
}

fn de_opt_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Option::<HumanDuration>::deserialize(d).map(|h| h.map(|h| h.0))
}

fn default_slow_query_threshold() -> Duration {
    Duration::from_secs(1)
}

fn default_rollup_bucket_width() -> Duration {
    HOUR
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Plans with a shorter duration are not recorded.
    #[serde(
        default = "default_slow_query_threshold",
        deserialize_with = "de_duration"
    )]
    pub slow_query_threshold: Duration,
    #[serde(
        default = "default_rollup_bucket_width",
        deserialize_with = "de_duration"
    )]
    pub rollup_bucket_width: Duration,
    /// Not-running gaps shorter than this merge adjacent sessions; zero
    /// disables merging.
    #[serde(default, deserialize_with = "de_duration")]
    pub debounce_window: Duration,
    #[serde(default)]
    pub retention_horizon: RetentionConfig,
    #[serde(default)]
    pub min_session_duration: MinSessionDuration,
    #[serde(default, rename = "session_lane")]
    pub session_lanes: Vec<SessionLaneConfig>,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: default_slow_query_threshold(),
            rollup_bucket_width: default_rollup_bucket_width(),
            debounce_window: Duration::ZERO,
            retention_horizon: RetentionConfig::default(),
            min_session_duration: MinSessionDuration::default(),
            session_lanes: Vec::new(),
            collector: CollectorConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retention_horizon.validate()?;

        if self.rollup_bucket_width < Duration::from_secs(1) {
            return Err(invalid("rollup_bucket_width", "must be at least 1s"));
        }
        if self.rollup_bucket_width > 7 * DAY {
            return Err(invalid("rollup_bucket_width", "must be at most 7d"));
        }

        let mut names = BTreeSet::new();
        for (i, lane) in self.session_lanes.iter().enumerate() {
            if lane.name.trim().is_empty() {
                return Err(invalid(format!("session_lane[{i}].name"), "must not be empty"));
            }
            if !names.insert(lane.name.as_str()) {
                return Err(invalid(
                    format!("session_lane[{i}].name"),
                    format!("duplicate lane '{}'", lane.name),
                ));
            }
            if lane.running.is_empty() {
                return Err(invalid(
                    format!("session_lane[{i}].running"),
                    "needs at least one running state",
                ));
            }
        }

        for class in &self.collector.database_classes {
            if ResourceClass::parse(class).is_none() {
                return Err(invalid(
                    "collector.database_classes",
                    format!("unknown class '{class}' (use database, table, index)"),
                ));
            }
        }
        Ok(())
    }
}

/// Per-series retention horizons.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetentionConfig {
    #[serde(deserialize_with = "de_duration")]
    pub database_snapshots: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub table_snapshots: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub index_snapshots: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub statement_stats: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub vacuum_events: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub plan_events: Duration,
    /// `None` keeps history forever.
    #[serde(deserialize_with = "de_opt_duration")]
    pub parameter_history: Option<Duration>,
    #[serde(deserialize_with = "de_opt_duration")]
    pub enum_history: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            database_snapshots: 30 * DAY,
            table_snapshots: 30 * DAY,
            index_snapshots: 30 * DAY,
            statement_stats: 14 * DAY,
            vacuum_events: 90 * DAY,
            plan_events: 14 * DAY,
            parameter_history: None,
            enum_history: None,
        }
    }
}

impl RetentionConfig {
    /// Horizon for `series`; `None` means the series is never purged.
    pub fn horizon(&self, series: Series) -> Option<Duration> {
        match series {
            Series::DatabaseSnapshots => Some(self.database_snapshots),
            Series::TableSnapshots => Some(self.table_snapshots),
            Series::IndexSnapshots => Some(self.index_snapshots),
            Series::StatementStats => Some(self.statement_stats),
            Series::VacuumEvents => Some(self.vacuum_events),
            Series::PlanEvents => Some(self.plan_events),
            Series::ParameterHistory => self.parameter_history,
            Series::EnumHistory => self.enum_history,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for series in Series::ALL {
            if let Some(h) = self.horizon(series)
                && h.is_zero()
            {
                return Err(invalid(
                    format!("retention_horizon.{series}"),
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

/// Minimum session length, with per-lane overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, HumanDuration>")]
pub struct MinSessionDuration {
    pub default: Duration,
    pub per_lane: BTreeMap<String, Duration>,
}

impl Default for MinSessionDuration {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(1),
            per_lane: BTreeMap::new(),
        }
    }
}

impl From<BTreeMap<String, HumanDuration>> for MinSessionDuration {
    fn from(mut map: BTreeMap<String, HumanDuration>) -> Self {
        let default = map
            .remove("default")
            .map_or(Duration::from_secs(1), |h| h.0);
        Self {
            default,
            per_lane: map.into_iter().map(|(k, v)| (k, v.0)).collect(),
        }
    }
}

impl MinSessionDuration {
    pub fn for_lane(&self, lane: &str) -> Duration {
        self.per_lane.get(lane).copied().unwrap_or(self.default)
    }
}

/// A state parameter evaluated by session detection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionLaneConfig {
    pub name: String,
    pub parameter_id: u32,
    pub running: Vec<String>,
    #[serde(default)]
    pub paused: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CollectorConfig {
    pub database_classes: Vec<String>,
    pub collect_statements: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            database_classes: ResourceClass::ALL
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            collect_statements: true,
        }
    }
}

impl CollectorConfig {
    /// Configured classes; unknown names were rejected by `validate`.
    pub fn classes(&self) -> Vec<ResourceClass> {
        self.database_classes
            .iter()
            .filter_map(|c| ResourceClass::parse(c))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Csvlog,
    Jsonlog,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Log file to tail; the daemon's `--log-file` overrides it.
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
slow_query_threshold = "500ms"
rollup_bucket_width  = "1h"
debounce_window      = "5s"

[retention_horizon]
database_snapshots = "30d"
table_snapshots    = "30d"
index_snapshots    = "7d"
statement_stats    = "14d"
vacuum_events      = "90d"
plan_events        = 86400
parameter_history  = "3650d"

[min_session_duration]
default = "1s"
epu     = "10s"

[[session_lane]]
name = "epu"
parameter_id = 93
running = ["Running"]
paused  = ["Paused"]

[collector]
database_classes = ["database", "table"]
collect_statements = false

[log]
format = "jsonlog"
path = "/var/log/postgresql/postgresql.json"
"#;

    #[test]
    fn test_full_config() {
        let c = EngineConfig::from_toml(FULL).unwrap();
        assert_eq!(c.slow_query_threshold, Duration::from_millis(500));
        assert_eq!(c.debounce_window, Duration::from_secs(5));
        assert_eq!(c.retention_horizon.index_snapshots, 7 * DAY);
        assert_eq!(c.retention_horizon.plan_events, DAY);
        assert_eq!(
            c.retention_horizon.horizon(Series::ParameterHistory),
            Some(3650 * DAY)
        );
        assert_eq!(c.retention_horizon.horizon(Series::EnumHistory), None);
        assert_eq!(c.min_session_duration.for_lane("epu"), Duration::from_secs(10));
        assert_eq!(c.min_session_duration.for_lane("other"), Duration::from_secs(1));
        assert_eq!(c.session_lanes[0].parameter_id, 93);
        assert_eq!(
            c.collector.classes(),
            vec![ResourceClass::Database, ResourceClass::Table]
        );
        assert!(!c.collector.collect_statements);
        assert_eq!(c.log.format, LogFormat::Jsonlog);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let c = EngineConfig::from_toml("").unwrap();
        assert_eq!(c.slow_query_threshold, Duration::from_secs(1));
        assert_eq!(c.rollup_bucket_width, HOUR);
        assert_eq!(c.debounce_window, Duration::ZERO);
        assert_eq!(c.retention_horizon, RetentionConfig::default());
        assert_eq!(c.collector.classes().len(), 3);
        assert_eq!(c.log.format, LogFormat::Csvlog);
    }

    #[test]
    fn test_zero_horizon_is_invalid() {
        let err = EngineConfig::from_toml("[retention_horizon]\nvacuum_events = \"0s\"").unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "retention_horizon.vacuum_events"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bucket_width_bounds() {
        assert!(matches!(
            EngineConfig::from_toml("rollup_bucket_width = \"500ms\""),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml("rollup_bucket_width = \"8d\""),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(EngineConfig::from_toml("rollup_bucket_width = \"7d\"").is_ok());
    }

    #[test]
    fn test_lane_validation() {
        let dup = r#"
[[session_lane]]
name = "epu"
parameter_id = 1
running = ["Running"]
[[session_lane]]
name = "epu"
parameter_id = 2
running = ["Running"]
"#;
        assert!(matches!(EngineConfig::from_toml(dup), Err(ConfigError::Invalid { .. })));

        let no_running = "[[session_lane]]\nname = \"tomo\"\nparameter_id = 1\nrunning = []\n";
        assert!(matches!(
            EngineConfig::from_toml(no_running),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            EngineConfig::from_toml("slow_query_threshold = \"fast\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("unknown_option = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("[collector]\ndatabase_classes = [\"view\"]"),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
