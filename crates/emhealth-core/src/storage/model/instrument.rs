//! Instruments and their slowly-changing dimension records.

use serde::{Deserialize, Serialize};

pub type InstrumentId = u32;

/// Instrument identity as supplied by an import.
///
/// `name` is the natural key; re-importing the same name updates the other
/// attributes in place and keeps the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub name: String,
    pub serial: i64,
    pub model: String,
    pub display_name: String,
    pub template: String,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub spec: InstrumentSpec,
}

/// Natural key of a parameter: (instrument, parameter id from the export).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamKey {
    pub instrument: InstrumentId,
    pub param_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Float,
    Text,
}

impl ValueType {
    /// Accepts the spellings seen in instrument exports (`double`, `str`, ...).
    pub fn parse(s: &str) -> Option<ValueType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" | "long" | "bool" | "boolean" => Some(ValueType::Int),
            "float" | "double" | "number" => Some(ValueType::Float),
            "text" | "str" | "string" => Some(ValueType::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Text => "text",
        }
    }
}

/// Tracked attributes of a parameter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAttrs {
    pub subsystem: String,
    pub component: String,
    pub param_name: String,
    pub display_name: String,
    pub value_type: ValueType,
    pub event_id: Option<u32>,
    pub event_name: Option<String>,
    /// Name of the enumeration the values are drawn from.
    pub enum_name: Option<String>,
    pub storage_unit: Option<String>,
    pub display_unit: Option<String>,
    pub display_scale: Option<f64>,
}

impl ParameterAttrs {
    /// Minimal attribute set, mostly for tests and hand-written imports.
    pub fn new(subsystem: &str, param_name: &str, value_type: ValueType) -> Self {
        Self {
            subsystem: subsystem.to_string(),
            component: String::new(),
            param_name: param_name.to_string(),
            display_name: param_name.to_string(),
            value_type,
            event_id: None,
            event_name: None,
            enum_name: None,
            storage_unit: None,
            display_unit: None,
            display_scale: None,
        }
    }
}

/// Enumeration registered for an instrument. Ids are allocated per
/// instrument as `max + 1` and never reused while the instrument lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDefinition {
    pub instrument: InstrumentId,
    pub enum_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnumMemberKey {
    pub instrument: InstrumentId,
    pub enum_id: u32,
    pub member: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumMemberAttrs {
    pub value: i64,
}
