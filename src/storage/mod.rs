//! Storage layer for cell-state persistence.
//!
//! This module provides the [`Storage`] trait and its SQLite implementation.
//! Parameters are persisted as a JSON document per state; parent links are a
//! self-referencing foreign key.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageResult;
use crate::kinetics::parse_timestamp;
use crate::lineage::{DeletePlan, DeletePolicy, StateLink};
use crate::parameters::{merge_parameters, operation_type_of, OperationType};

/// A node in the lineage forest: one recorded culture event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    /// Store-assigned identifier.
    pub id: i64,
    /// Optional human-readable label.
    pub name: String,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// State this one was derived from; `None` for lineage roots.
    pub parent_id: Option<i64>,
    /// Free-form experimental parameters.
    pub parameters: Map<String, Value>,
    /// Operator notes.
    pub additional_notes: Option<String>,
}

impl CellState {
    /// Operation type recorded in the parameters, if valid.
    pub fn operation_type(&self) -> Option<OperationType> {
        operation_type_of(&self.parameters)
    }

    /// Numeric parameter value, if present and numeric.
    pub fn numeric_parameter(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(Value::as_f64)
    }
}

/// Input for creating a cell state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCellState {
    #[serde(default)]
    pub name: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub additional_notes: Option<String>,
}

impl NewCellState {
    /// Create a root state at `timestamp` with no parameters.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            name: String::new(),
            timestamp,
            parameters: Map::new(),
            parent_id: None,
            additional_notes: None,
        }
    }

    /// Set the name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the parent state
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Set the parameters
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set operator notes
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.additional_notes = Some(notes.into());
        self
    }
}

/// Partial change to a stored state, applied by [`Storage::merge_state`].
///
/// Parameters merge key-wise; name and notes replace when given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub name: Option<String>,
    pub parameters: Map<String, Value>,
    pub additional_notes: Option<String>,
}

impl StatePatch {
    /// Patch that only merges parameters.
    pub fn parameters(parameters: Map<String, Value>) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    /// Apply the patch to `state` in place.
    pub fn apply_to(&self, state: &mut CellState) {
        merge_parameters(&mut state.parameters, self.parameters.clone());
        if let Some(name) = &self.name {
            state.name = name.clone();
        }
        if let Some(notes) = &self.additional_notes {
            state.additional_notes = Some(notes.clone());
        }
    }
}

/// Validation run on merged parameters before a patch is written.
pub type ParameterCheck = fn(&Map<String, Value>) -> StorageResult<()>;

/// Accept RFC 3339 as well as naive `YYYY-MM-DDTHH:MM[:SS]` timestamps (taken as UTC).
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

/// Persistence operations for cell states.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a state. The parent, if given, must exist.
    async fn create_state(&self, state: &NewCellState) -> StorageResult<CellState>;

    /// Fetch one state.
    async fn get_state(&self, id: i64) -> StorageResult<Option<CellState>>;

    /// Fetch a page of states ordered by id.
    async fn list_states(&self, skip: u32, limit: u32) -> StorageResult<Vec<CellState>>;

    /// Fetch every state ordered by id.
    async fn list_all_states(&self) -> StorageResult<Vec<CellState>>;

    /// Fetch the given states, in the order of `ids`. Missing ids are skipped.
    async fn get_states(&self, ids: &[i64]) -> StorageResult<Vec<CellState>>;

    /// Ids of the direct children of a state, ascending.
    async fn child_ids(&self, id: i64) -> StorageResult<Vec<i64>>;

    /// Every stored `(id, parent_id)` link.
    async fn lineage_links(&self) -> StorageResult<Vec<StateLink>>;

    /// Read, patch and write a state inside one write transaction.
    ///
    /// Concurrent patches of the same state apply one after another. When the
    /// patch carries parameters, `check` sees the merged map and may reject it
    /// before anything is written.
    async fn merge_state(
        &self,
        id: i64,
        patch: &StatePatch,
        check: ParameterCheck,
    ) -> StorageResult<CellState>;

    /// Delete a state under the given policy, atomically.
    async fn delete_state(&self, id: i64, policy: DeletePolicy) -> StorageResult<DeletePlan>;

    /// Cheap connectivity check.
    async fn ping(&self) -> StorageResult<()>;
}
