//! Cell-state parameters.
//!
//! Parameters are persisted as an open JSON mapping, but every mapping is
//! validated through a typed view: shared fields, one variant per operation
//! type with its own field set, and an opaque `extra` map for custom keys.
//! This module also owns the static registry describing which keys apply to
//! which operation type.

mod registry;

pub use registry::{
    definitions, is_parameter_applicable, parameter_metadata, ParameterMetadata,
    ALL_PARAMETER_METADATA,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

/// Parameter key holding the operation type tag.
pub const OPERATION_TYPE_KEY: &str = "operation_type";

/// Kind of culture operation a cell state records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// A new culture seeded from scratch.
    StartNewCulture,
    /// Cells moved to fresh vessels.
    Passage,
    /// Cells frozen into vials.
    Freeze,
    /// Frozen cells revived.
    Thaw,
    /// An observation without manipulation.
    Measurement,
    /// A culture divided into several.
    Split,
    /// Cells collected at end of culture.
    Harvest,
}

impl OperationType {
    /// All operation types in registry order.
    pub const ALL: [OperationType; 7] = [
        OperationType::StartNewCulture,
        OperationType::Passage,
        OperationType::Freeze,
        OperationType::Thaw,
        OperationType::Measurement,
        OperationType::Split,
        OperationType::Harvest,
    ];

    /// Wire name of the operation type.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::StartNewCulture => "start_new_culture",
            OperationType::Passage => "passage",
            OperationType::Freeze => "freeze",
            OperationType::Thaw => "thaw",
            OperationType::Measurement => "measurement",
            OperationType::Split => "split",
            OperationType::Harvest => "harvest",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|op| op.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown operation type: {}", s))
    }
}

/// Fields meaningful for most operation types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommonParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_ml: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Cells per ml at the time of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_density: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_type: Option<String>,
    /// Hypothesized growth rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub growth_rate: Option<f64>,
    /// Hypothesized doubling time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doubling_time: Option<f64>,
    /// Hypothesized density limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub density_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_doubling_time: Option<f64>,
}

/// Kinetics values written back by the calculation endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doubling_time_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_pd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_growth_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_density_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartNewCultureParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_viability: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassageParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_viability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_end_viability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_end_density: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_parameter: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreezeParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_end_viability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_end_density: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_vials: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cells: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThawParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_viability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_passages: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_end_viability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_end_density: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_end_viability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_density: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_parameter: Option<Value>,
}

/// Operation-specific fields, one variant per operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum OperationParameters {
    StartNewCulture(StartNewCultureParameters),
    Passage(PassageParameters),
    Freeze(FreezeParameters),
    Thaw(ThawParameters),
    Measurement(MeasurementParameters),
    Split(SplitParameters),
    Harvest(HarvestParameters),
}

impl OperationParameters {
    /// Operation type tag of this variant.
    pub fn operation_type(&self) -> OperationType {
        match self {
            OperationParameters::StartNewCulture(_) => OperationType::StartNewCulture,
            OperationParameters::Passage(_) => OperationType::Passage,
            OperationParameters::Freeze(_) => OperationType::Freeze,
            OperationParameters::Thaw(_) => OperationType::Thaw,
            OperationParameters::Measurement(_) => OperationType::Measurement,
            OperationParameters::Split(_) => OperationType::Split,
            OperationParameters::Harvest(_) => OperationType::Harvest,
        }
    }
}

/// Typed view over a raw parameter mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedParameters {
    /// Operation-specific fields, absent when no `operation_type` is set.
    pub operation: Option<OperationParameters>,
    pub common: CommonParameters,
    pub derived: DerivedParameters,
    /// Keys outside the registry, kept verbatim.
    pub extra: Map<String, Value>,
}

impl TypedParameters {
    /// Validate and split a raw mapping.
    pub fn from_map(map: &Map<String, Value>) -> AppResult<Self> {
        let operation = match map.get(OPERATION_TYPE_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => {
                let op: OperationType = raw
                    .parse()
                    .map_err(|reason: String| AppError::validation(OPERATION_TYPE_KEY, reason))?;
                Some(parse_operation(op, map)?)
            }
            Some(_) => return Err(AppError::validation(OPERATION_TYPE_KEY, "must be a string")),
        };

        let common: CommonParameters = from_mapping(map)?;
        let derived: DerivedParameters = from_mapping(map)?;

        let extra = map
            .iter()
            .filter(|(key, _)| key.as_str() != OPERATION_TYPE_KEY && parameter_metadata(key).is_none())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            operation,
            common,
            derived,
            extra,
        })
    }

    /// Operation type, if one is recorded.
    pub fn operation_type(&self) -> Option<OperationType> {
        self.operation.as_ref().map(OperationParameters::operation_type)
    }

    /// Flatten back into a raw mapping. Absent optional fields are omitted.
    pub fn to_map(&self) -> AppResult<Map<String, Value>> {
        let mut map = Map::new();
        if let Some(operation) = &self.operation {
            merge_parameters(&mut map, to_mapping(operation)?);
        }
        merge_parameters(&mut map, to_mapping(&self.common)?);
        merge_parameters(&mut map, to_mapping(&self.derived)?);
        merge_parameters(&mut map, self.extra.clone());
        Ok(map)
    }
}

/// Read the operation type tag of a raw mapping without full validation.
pub fn operation_type_of(map: &Map<String, Value>) -> Option<OperationType> {
    map.get(OPERATION_TYPE_KEY)
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
}

/// Key-wise merge: keys in `update` overwrite, all other keys are kept.
pub fn merge_parameters(existing: &mut Map<String, Value>, update: Map<String, Value>) {
    for (key, value) in update {
        existing.insert(key, value);
    }
}

fn parse_operation(op: OperationType, map: &Map<String, Value>) -> AppResult<OperationParameters> {
    Ok(match op {
        OperationType::StartNewCulture => OperationParameters::StartNewCulture(from_mapping(map)?),
        OperationType::Passage => OperationParameters::Passage(from_mapping(map)?),
        OperationType::Freeze => OperationParameters::Freeze(from_mapping(map)?),
        OperationType::Thaw => OperationParameters::Thaw(from_mapping(map)?),
        OperationType::Measurement => OperationParameters::Measurement(from_mapping(map)?),
        OperationType::Split => OperationParameters::Split(from_mapping(map)?),
        OperationType::Harvest => OperationParameters::Harvest(from_mapping(map)?),
    })
}

fn from_mapping<T: DeserializeOwned>(map: &Map<String, Value>) -> AppResult<T> {
    serde_json::from_value(Value::Object(map.clone()))
        .map_err(|e| AppError::validation("parameters", e.to_string()))
}

fn to_mapping<T: Serialize>(value: &T) -> AppResult<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(AppError::Internal {
            message: format!("parameters serialized to non-object: {}", other),
        }),
        Err(e) => Err(AppError::Internal {
            message: e.to_string(),
        }),
    }
}
