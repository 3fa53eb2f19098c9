use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use super::OperationType;
use super::OperationType::{Freeze, Harvest, Measurement, Passage, Split, StartNewCulture, Thaw};

/// Display and applicability metadata for one parameter key.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMetadata {
    #[serde(skip)]
    pub key: &'static str,
    pub display_name: &'static str,
    pub applicable_to_all_nodes: bool,
    #[serde(skip_serializing_if = "no_operations")]
    pub operation_specific: &'static [OperationType],
}

fn no_operations(operations: &&'static [OperationType]) -> bool {
    operations.is_empty()
}

const fn global(key: &'static str, display_name: &'static str) -> ParameterMetadata {
    ParameterMetadata {
        key,
        display_name,
        applicable_to_all_nodes: true,
        operation_specific: &[],
    }
}

const fn specific(
    key: &'static str,
    display_name: &'static str,
    operations: &'static [OperationType],
) -> ParameterMetadata {
    ParameterMetadata {
        key,
        display_name,
        applicable_to_all_nodes: false,
        operation_specific: operations,
    }
}

/// Every known parameter key, in export column order.
pub const ALL_PARAMETER_METADATA: &[ParameterMetadata] = &[
    specific("example_parameter", "Example Parameter", &[Passage, Harvest]),
    global("temperature_c", "Temperature (°C)"),
    global("volume_ml", "Volume (ml)"),
    global("location", "Location"),
    global("cell_density", "Initial Cell Density"),
    specific("start_viability", "Start Viability (%)", &[StartNewCulture, Passage, Thaw]),
    specific("parent_end_viability", "Parent End Viability (%)", &[Passage, Harvest, Freeze, Split]),
    global("growth_rate", "Hypothesized Growth Rate"),
    global("doubling_time", "Hypothesized Doubling Time"),
    global("density_limit", "Hypothesized Density Limit"),
    global("measured_doubling_time", "Measured Doubling Time"),
    ParameterMetadata {
        key: "cell_type",
        display_name: "Cell Type",
        applicable_to_all_nodes: true,
        operation_specific: &[StartNewCulture],
    },
    specific("parent_end_density", "Parent End Density", &[Passage, Freeze, Split]),
    specific("number_of_vials", "Number of Vials", &[Freeze]),
    specific("total_cells", "Total Cells", &[Freeze]),
    specific("number_of_passages", "Number of Passages", &[Thaw]),
    specific("end_density", "End Density", &[Harvest]),
    specific("measured_value", "Measured Value", &[Measurement]),
    global("seed_count", "Seed Count"),
    global("harvest_count", "Harvest Count"),
    global("generation", "Population Doublings"),
    global("doubling_time_hours", "Doubling Time (h)"),
    global("cumulative_pd", "Cumulative Population Doublings"),
    global("measured_growth_rate", "Measured Growth Rate"),
    global("measured_density_limit", "Measured Density Limit"),
    global("operation_type", "Operation Type"),
];

/// Keys shared by every operation type.
const SHARED: &[&str] = &[
    "temperature_c",
    "volume_ml",
    "location",
    "growth_rate",
    "doubling_time",
    "density_limit",
    "measured_doubling_time",
    "cell_type",
    "seed_count",
    "harvest_count",
    "generation",
    "doubling_time_hours",
    "cumulative_pd",
    "measured_growth_rate",
    "measured_density_limit",
    "operation_type",
];

impl OperationType {
    /// Operation-specific keys applicable to this operation, beyond the shared set.
    fn specific_parameters(&self) -> &'static [&'static str] {
        match self {
            StartNewCulture => &["cell_density", "start_viability"],
            Passage => &[
                "cell_density",
                "start_viability",
                "parent_end_viability",
                "parent_end_density",
                "example_parameter",
            ],
            Freeze => &[
                "cell_density",
                "parent_end_viability",
                "parent_end_density",
                "number_of_vials",
                "total_cells",
            ],
            Thaw => &["cell_density", "start_viability", "number_of_passages"],
            Measurement => &["cell_density", "measured_value"],
            Split => &["cell_density", "parent_end_viability", "parent_end_density"],
            Harvest => &["parent_end_viability", "end_density", "example_parameter"],
        }
    }

    /// Every key applicable to this operation, in registry order.
    pub fn applicable_parameters(&self) -> Vec<&'static str> {
        let specific = self.specific_parameters();
        ALL_PARAMETER_METADATA
            .iter()
            .map(|meta| meta.key)
            .filter(|key| SHARED.contains(key) || specific.contains(key))
            .collect()
    }

    /// Whether `key` is applicable to this operation.
    pub fn is_applicable(&self, key: &str) -> bool {
        SHARED.contains(&key) || self.specific_parameters().contains(&key)
    }
}

/// Metadata for a known key.
pub fn parameter_metadata(key: &str) -> Option<&'static ParameterMetadata> {
    ALL_PARAMETER_METADATA.iter().find(|meta| meta.key == key)
}

/// Whether a parameter applies to a node with the given operation type.
///
/// Without an operation type only globally applicable keys apply. With one,
/// the operation's own key list decides.
pub fn is_parameter_applicable(key: &str, operation_type: Option<OperationType>) -> bool {
    match operation_type {
        None => parameter_metadata(key).is_some_and(|meta| meta.applicable_to_all_nodes),
        Some(op) => op.is_applicable(key),
    }
}

/// Registry contents as served by the definitions endpoint.
pub fn definitions() -> Value {
    let mapping: BTreeMap<&str, Vec<&str>> = OperationType::ALL
        .iter()
        .map(|op| (op.as_str(), op.applicable_parameters()))
        .collect();

    let metadata: BTreeMap<&str, &ParameterMetadata> = ALL_PARAMETER_METADATA
        .iter()
        .map(|meta| (meta.key, meta))
        .collect();

    let all: Vec<&str> = ALL_PARAMETER_METADATA.iter().map(|meta| meta.key).collect();

    json!({
        "operation_parameter_mapping": mapping,
        "parameter_metadata": metadata,
        "all_possible_parameters": all,
    })
}
