//! Data model for the engine tables.

mod events;
mod instrument;
mod metrics;
mod session;

pub use events::{PlanKey, QueryPlanEvent, VacuumEvent, VacuumKey};
pub use instrument::{
    EnumDefinition, EnumMemberAttrs, EnumMemberKey, Instrument, InstrumentId, InstrumentSpec,
    ParamKey, ParameterAttrs, ValueType,
};
pub use metrics::{
    MetricSnapshot, Readings, ResourceClass, ResourceId, RollupBucket, RollupSeries,
    StatementStat,
};
pub use session::{SessionInterval, StateValue};

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Every retained series, as named in `[retention_horizon]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Series {
    DatabaseSnapshots,
    TableSnapshots,
    IndexSnapshots,
    StatementStats,
    VacuumEvents,
    PlanEvents,
    ParameterHistory,
    EnumHistory,
}

impl Series {
    pub const ALL: [Series; 8] = [
        Series::DatabaseSnapshots,
        Series::TableSnapshots,
        Series::IndexSnapshots,
        Series::StatementStats,
        Series::VacuumEvents,
        Series::PlanEvents,
        Series::ParameterHistory,
        Series::EnumHistory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Series::DatabaseSnapshots => "database_snapshots",
            Series::TableSnapshots => "table_snapshots",
            Series::IndexSnapshots => "index_snapshots",
            Series::StatementStats => "statement_stats",
            Series::VacuumEvents => "vacuum_events",
            Series::PlanEvents => "plan_events",
            Series::ParameterHistory => "parameter_history",
            Series::EnumHistory => "enum_history",
        }
    }
}

impl std::fmt::Display for Series {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
