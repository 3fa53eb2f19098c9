//! CSV export of every recorded state.
//!
//! The document opens with a short legend, then one column per registry key
//! and one per custom key found in the data. A registry key that does not
//! apply to a row's operation type is written as `N/A`; an applicable key
//! with no recorded value is left empty.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::parameters::{is_parameter_applicable, ParameterMetadata, ALL_PARAMETER_METADATA};
use crate::storage::CellState;

/// Marker for a parameter that does not apply to the row's operation type.
pub const NOT_APPLICABLE: &str = "N/A";

const FIXED_HEADERS: [&str; 5] = [
    "ID",
    "Name (global)",
    "Timestamp (global)",
    "Parent ID (global)",
    "Additional Notes (global)",
];

/// Download name for an export taken at `now`.
pub fn export_filename(now: DateTime<Utc>) -> String {
    format!("cell_culture_data_{}.csv", now.format("%Y%m%d_%H%M%S"))
}

/// Render `states` as a CSV document.
pub fn export_csv(states: &[CellState]) -> AppResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    writer.write_record(["LEGEND"]).map_err(csv_error)?;
    writer
        .write_record([NOT_APPLICABLE, "Parameter does not apply to this operation type"])
        .map_err(csv_error)?;
    writer
        .write_record(["(empty)", "Parameter applies but no value was recorded"])
        .map_err(csv_error)?;
    writer.write_record([""]).map_err(csv_error)?;

    let custom_keys = custom_keys(states);
    writer
        .write_record(header_row(&custom_keys))
        .map_err(csv_error)?;

    for state in states {
        writer
            .write_record(data_row(state, &custom_keys))
            .map_err(csv_error)?;
    }

    writer.into_inner().map_err(|e| AppError::Internal {
        message: format!("Failed to finish CSV export: {}", e),
    })
}

fn csv_error(e: csv::Error) -> AppError {
    AppError::Internal {
        message: format!("Failed to write CSV export: {}", e),
    }
}

/// Parameter keys present in the data but unknown to the registry, sorted.
fn custom_keys(states: &[CellState]) -> Vec<String> {
    states
        .iter()
        .flat_map(|state| state.parameters.keys())
        .filter(|key| !ALL_PARAMETER_METADATA.iter().any(|meta| meta.key == key.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn column_label(meta: &ParameterMetadata) -> String {
    if meta.applicable_to_all_nodes || meta.operation_specific.is_empty() {
        format!("{} (global)", meta.display_name)
    } else {
        let scope = meta
            .operation_specific
            .iter()
            .map(|op| op.as_str())
            .collect::<Vec<_>>()
            .join("/");
        format!("{} ({})", meta.display_name, scope)
    }
}

fn header_row(custom_keys: &[String]) -> Vec<String> {
    FIXED_HEADERS
        .iter()
        .map(|h| h.to_string())
        .chain(ALL_PARAMETER_METADATA.iter().map(column_label))
        .chain(custom_keys.iter().map(|key| format!("{} (custom)", key)))
        .collect()
}

fn data_row(state: &CellState, custom_keys: &[String]) -> Vec<String> {
    let operation = state.operation_type();

    let mut row = vec![
        state.id.to_string(),
        state.name.clone(),
        state.timestamp.to_rfc3339(),
        state.parent_id.map(|id| id.to_string()).unwrap_or_default(),
        state.additional_notes.clone().unwrap_or_default(),
    ];

    for meta in ALL_PARAMETER_METADATA {
        if is_parameter_applicable(meta.key, operation) {
            row.push(cell_value(state.parameters.get(meta.key)));
        } else {
            row.push(NOT_APPLICABLE.to_string());
        }
    }

    for key in custom_keys {
        row.push(cell_value(state.parameters.get(key)));
    }

    row
}

fn cell_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
