//! Ingestion interface for the import front-end.
//!
//! An [`ImportBatch`] carries one instrument's definitions; applying it
//! routes every parameter and enumeration member through the
//! change-tracking store. Telemetry arrives as rows in the tab-separated
//! COPY layout `time \t instrument_id \t param_id \t value_num \t value_text`.

use tracing::info;

use crate::storage::model::{
    EnumMemberAttrs, EnumMemberKey, InstrumentId, InstrumentSpec, ParamKey, ParameterAttrs,
    StateValue, Timestamp, ValueType,
};
use crate::storage::{Change, Store, StoreError};
use crate::util::parse_log_timestamp;

const COPY_NULL: &str = "\\N";

#[derive(Debug, Clone, PartialEq)]
pub struct EnumImport {
    pub name: String,
    /// (member name, value)
    pub members: Vec<(String, i64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterImport {
    pub param_id: u32,
    pub attrs: ParameterAttrs,
}

/// Everything one instrument export defines.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBatch {
    pub instrument: InstrumentSpec,
    pub enums: Vec<EnumImport>,
    pub parameters: Vec<ParameterImport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl ApplyCounts {
    fn record<A>(&mut self, change: &Change<A>) {
        match change {
            Change::Insert => self.inserted += 1,
            Change::Update { .. } => self.updated += 1,
            Change::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub instrument: InstrumentId,
    pub enums: usize,
    pub enum_members: ApplyCounts,
    pub parameters: ApplyCounts,
}

impl Store {
    /// Apply one import: instrument, then enumerations, then parameters.
    pub fn apply_import(
        &self,
        batch: &ImportBatch,
        now: Timestamp,
    ) -> Result<ImportSummary, StoreError> {
        let instrument = self.upsert_instrument(batch.instrument.clone())?;
        let mut summary = ImportSummary {
            instrument,
            enums: batch.enums.len(),
            enum_members: ApplyCounts::default(),
            parameters: ApplyCounts::default(),
        };

        for e in &batch.enums {
            let enum_id = self.define_enum(instrument, &e.name)?;
            for (member, value) in &e.members {
                let key = EnumMemberKey {
                    instrument,
                    enum_id,
                    member: member.clone(),
                };
                let change = self.apply_enum_member(key, EnumMemberAttrs { value: *value }, now)?;
                summary.enum_members.record(&change);
            }
        }
        if !batch.enums.is_empty() {
            info!(
                "Updated enum_values table ({} new, {} changed)",
                summary.enum_members.inserted, summary.enum_members.updated
            );
        }

        for p in &batch.parameters {
            let key = ParamKey {
                instrument,
                param_id: p.param_id,
            };
            let change = self.apply_parameter(key, p.attrs.clone(), now)?;
            summary.parameters.record(&change);
        }
        if !batch.parameters.is_empty() {
            info!(
                "Updated parameters table ({} new, {} changed)",
                summary.parameters.inserted, summary.parameters.updated
            );
        }
        Ok(summary)
    }
}

/// One telemetry row.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub at: Timestamp,
    pub instrument: InstrumentId,
    pub param_id: u32,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
}

impl TelemetrySample {
    /// Value typed by the parameter's declared type; unknown types take
    /// whichever column is filled.
    pub fn state(&self, value_type: Option<ValueType>) -> Option<StateValue> {
        match value_type {
            Some(ValueType::Int | ValueType::Float) => self.value_num.map(StateValue::Num),
            Some(ValueType::Text) => self.value_text.clone().map(StateValue::Text),
            None => self
                .value_num
                .map(StateValue::Num)
                .or_else(|| self.value_text.clone().map(StateValue::Text)),
        }
    }
}

/// Parse one COPY row; `None` if it is malformed.
pub fn parse_telemetry_line(line: &str) -> Option<TelemetrySample> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut fields = line.split('\t');
    let at = parse_log_timestamp(fields.next()?)?;
    let instrument = fields.next()?.trim().parse().ok()?;
    let param_id = fields.next()?.trim().parse().ok()?;
    let value_num = match fields.next()? {
        COPY_NULL | "" => None,
        s => Some(s.trim().parse::<f64>().ok()?),
    };
    let value_text = match fields.next()? {
        COPY_NULL => None,
        s => Some(unescape_copy(s)),
    };
    if fields.next().is_some() {
        return None;
    }
    Some(TelemetrySample {
        at,
        instrument,
        param_id,
        value_num,
        value_text,
    })
}

/// Parse a whole COPY dump. Returns the samples and the malformed count.
pub fn parse_telemetry(content: &str) -> (Vec<TelemetrySample>, usize) {
    let mut samples = Vec::new();
    let mut malformed = 0;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match parse_telemetry_line(line) {
            Some(s) => samples.push(s),
            None => malformed += 1,
        }
    }
    (samples, malformed)
}

fn unescape_copy(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
