//! Cell-state lifecycle and lineage operations.
//!
//! [`CellStateManager`] sits between the HTTP handlers and the store: it
//! validates parameters through their typed view, merges partial updates,
//! enforces the delete policy and answers lineage queries from an explicit
//! adjacency index.

mod calculations;

pub use calculations::{
    MeasuredParametersRequest, MeasuredParametersResult, PopulationDoublingsRequest,
    PopulationDoublingsResult,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, StorageError, StorageResult};
use crate::lineage::{DeletePlan, DeletePolicy, LineageDirection, LineageIndex};
use crate::parameters::TypedParameters;
use crate::storage::{CellState, NewCellState, SqliteStorage, StatePatch, Storage};

/// Upper bound for a single page of states.
pub const MAX_PAGE_LIMIT: u32 = 1_000;

/// Partial update of a cell state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellStateUpdate {
    /// Replaces the name when given.
    #[serde(default)]
    pub name: Option<String>,
    /// Merged key-wise into the existing parameters. Must be a JSON object.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Replaces the notes when given.
    #[serde(default)]
    pub additional_notes: Option<String>,
}

impl CellStateUpdate {
    /// Update that only merges parameters.
    pub fn parameters(parameters: Map<String, Value>) -> Self {
        Self {
            parameters: Some(Value::Object(parameters)),
            ..Self::default()
        }
    }
}

/// A state together with the ids of its direct children.
#[derive(Debug, Clone, Serialize)]
pub struct CellStateDetail {
    #[serde(flatten)]
    pub state: CellState,
    pub children: Vec<i64>,
}

/// Cell-state operations over the store
#[derive(Clone)]
pub struct CellStateManager {
    storage: SqliteStorage,
    default_page_limit: u32,
    lineage_limit: usize,
}

impl CellStateManager {
    /// Create a new manager over `storage`
    pub fn new(storage: SqliteStorage, config: &Config) -> Self {
        Self {
            storage,
            default_page_limit: config.server.default_page_limit.min(MAX_PAGE_LIMIT),
            lineage_limit: config.lineage.max_nodes,
        }
    }

    /// Underlying store
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Record a new state. Parameters must pass typed validation.
    pub async fn create(&self, new_state: NewCellState) -> AppResult<CellState> {
        TypedParameters::from_map(&new_state.parameters)?;

        let state = self.storage.create_state(&new_state).await?;

        info!(
            state_id = state.id,
            parent_id = ?state.parent_id,
            operation = ?state.operation_type(),
            "Cell state created"
        );
        Ok(state)
    }

    /// Page through states ordered by id.
    pub async fn list(&self, skip: Option<u32>, limit: Option<u32>) -> AppResult<Vec<CellState>> {
        let limit = limit.unwrap_or(self.default_page_limit);
        if limit == 0 {
            return Err(AppError::validation("limit", "must be at least 1"));
        }
        let limit = limit.min(MAX_PAGE_LIMIT);

        Ok(self.storage.list_states(skip.unwrap_or(0), limit).await?)
    }

    /// Fetch one state with its child ids.
    pub async fn get(&self, id: i64) -> AppResult<CellStateDetail> {
        let state = self.require(id).await?;
        let children = self.storage.child_ids(id).await?;
        Ok(CellStateDetail { state, children })
    }

    /// Merge a partial update into an existing state.
    ///
    /// Parameters merge key-wise; name and notes replace. An update carrying
    /// nothing is rejected, as is a `parameters` value that is not an object.
    pub async fn update(&self, id: i64, update: CellStateUpdate) -> AppResult<CellState> {
        let parameters = match update.parameters {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => return Err(AppError::validation("parameters", "must be a JSON object")),
        };

        let has_parameters = parameters.as_ref().is_some_and(|map| !map.is_empty());
        if !has_parameters && update.name.is_none() && update.additional_notes.is_none() {
            return Err(AppError::validation("body", "No update data provided"));
        }

        let patch = StatePatch {
            name: update.name,
            parameters: parameters.unwrap_or_default(),
            additional_notes: update.additional_notes,
        };
        let state = self.apply_patch(id, &patch).await?;

        debug!(state_id = id, "Cell state updated");
        Ok(state)
    }

    /// Delete a state under `policy`.
    pub async fn delete(&self, id: i64, policy: DeletePolicy) -> AppResult<DeletePlan> {
        match self.storage.delete_state(id, policy).await {
            Ok(plan) => {
                info!(state_id = id, orphaned = ?plan.orphaned, %policy, "Cell state deleted");
                Ok(plan)
            }
            Err(StorageError::Lineage(err)) => {
                warn!(state_id = id, error = %err, "Cell state delete rejected");
                Err(err.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ancestors, descendants or both of a state, as full records.
    pub async fn lineage(&self, id: i64, direction: LineageDirection) -> AppResult<Vec<CellState>> {
        let index = LineageIndex::new(self.storage.lineage_links().await?);
        let ids = index.lineage(id, direction, self.lineage_limit)?;

        debug!(state_id = id, %direction, count = ids.len(), "Lineage resolved");
        Ok(self.storage.get_states(&ids).await?)
    }

    /// Apply `patch` atomically, validating the merged parameters.
    async fn apply_patch(&self, id: i64, patch: &StatePatch) -> AppResult<CellState> {
        self.storage
            .merge_state(id, patch, check_parameters)
            .await
            .map_err(|e| match e {
                StorageError::InvalidParameters { field, reason } => {
                    AppError::Validation { field, reason }
                }
                other => other.into(),
            })
    }

    async fn require(&self, id: i64) -> AppResult<CellState> {
        self.storage
            .get_state(id)
            .await?
            .ok_or_else(|| StorageError::StateNotFound { id }.into())
    }
}

fn check_parameters(parameters: &Map<String, Value>) -> StorageResult<()> {
    match TypedParameters::from_map(parameters) {
        Ok(_) => Ok(()),
        Err(AppError::Validation { field, reason }) => {
            Err(StorageError::InvalidParameters { field, reason })
        }
        Err(other) => Err(StorageError::InvalidParameters {
            field: "parameters".to_string(),
            reason: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, LineageConfig, LogFormat, LoggingConfig, ServerConfig};
    use crate::error::LineageError;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
                max_connections: 1,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: LogFormat::Pretty,
            },
            lineage: LineageConfig::default(),
        }
    }

    async fn manager() -> CellStateManager {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        CellStateManager::new(storage, &test_config())
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn create(manager: &CellStateManager, parent: Option<i64>, value: Value) -> CellState {
        let mut new_state = NewCellState::new(Utc::now()).with_parameters(params(value));
        new_state.parent_id = parent;
        manager.create(new_state).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_operation_type() {
        let manager = manager().await;
        let result = manager
            .create(NewCellState::new(Utc::now()).with_parameters(params(json!({"operation_type": "dance"}))))
            .await;
        assert!(matches!(result, Err(AppError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_create_with_missing_parent_is_not_found() {
        let manager = manager().await;
        let err = manager
            .create(NewCellState::new(Utc::now()).with_parent(41))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_merges_parameters() {
        let manager = manager().await;
        let state = create(&manager, None, json!({"a": 1, "b": 2})).await;

        let updated = manager
            .update(state.id, CellStateUpdate::parameters(params(json!({"b": 3, "c": 4}))))
            .await
            .unwrap();
        assert_eq!(Value::Object(updated.parameters), json!({"a": 1, "b": 3, "c": 4}));

        let stored = manager.get(state.id).await.unwrap().state;
        assert_eq!(Value::Object(stored.parameters), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[tokio::test]
    async fn test_update_rejects_non_mapping_parameters() {
        let manager = manager().await;
        let state = create(&manager, None, json!({})).await;
        let update = CellStateUpdate {
            parameters: Some(json!([1, 2, 3])),
            ..Default::default()
        };
        let err = manager.update(state.id, update).await.unwrap_err();
        assert!(err.to_string().contains("must be a JSON object"));
    }

    #[tokio::test]
    async fn test_update_rejects_empty_update() {
        let manager = manager().await;
        let state = create(&manager, None, json!({"a": 1})).await;

        let err = manager.update(state.id, CellStateUpdate::default()).await.unwrap_err();
        assert!(err.to_string().contains("No update data provided"));

        let err = manager
            .update(state.id, CellStateUpdate::parameters(Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_merged_parameters() {
        let manager = manager().await;
        let state = create(&manager, None, json!({"operation_type": "freeze"})).await;

        let err = manager
            .update(state.id, CellStateUpdate::parameters(params(json!({"number_of_vials": "six"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));

        let stored = manager.get(state.id).await.unwrap().state;
        assert_eq!(Value::Object(stored.parameters), json!({"operation_type": "freeze"}));
    }

    #[tokio::test]
    async fn test_update_missing_state() {
        let manager = manager().await;
        let err = manager
            .update(5, CellStateUpdate::parameters(params(json!({"a": 1}))))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_notes_only() {
        let manager = manager().await;
        let state = create(&manager, None, json!({"a": 1})).await;
        let update = CellStateUpdate {
            additional_notes: Some("contaminated".to_string()),
            ..Default::default()
        };
        let updated = manager.update(state.id, update).await.unwrap();
        assert_eq!(updated.additional_notes.as_deref(), Some("contaminated"));
        assert_eq!(Value::Object(updated.parameters), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_lineage_chain() {
        let manager = manager().await;
        let root = create(&manager, None, json!({"operation_type": "start_new_culture"})).await;
        let a = create(&manager, Some(root.id), json!({"operation_type": "passage"})).await;
        let b = create(&manager, Some(a.id), json!({"operation_type": "passage"})).await;
        let c = create(&manager, Some(b.id), json!({"operation_type": "freeze"})).await;

        let ids = |states: Vec<CellState>| states.into_iter().map(|s| s.id).collect::<Vec<_>>();

        assert_eq!(
            ids(manager.lineage(b.id, LineageDirection::Ancestors).await.unwrap()),
            vec![a.id, root.id]
        );
        assert_eq!(
            ids(manager.lineage(b.id, LineageDirection::Descendants).await.unwrap()),
            vec![c.id]
        );
        assert_eq!(
            ids(manager.lineage(b.id, LineageDirection::Both).await.unwrap()),
            vec![a.id, root.id, c.id]
        );
    }

    #[tokio::test]
    async fn test_lineage_limit() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let mut config = test_config();
        config.lineage.max_nodes = 1;
        let manager = CellStateManager::new(storage, &config);

        let root = create(&manager, None, json!({})).await;
        let a = create(&manager, Some(root.id), json!({})).await;
        create(&manager, Some(a.id), json!({})).await;

        let err = manager.lineage(root.id, LineageDirection::Descendants).await.unwrap_err();
        assert!(matches!(err, AppError::Lineage(LineageError::LimitExceeded { limit: 1 })));
    }

    #[tokio::test]
    async fn test_get_lists_children() {
        let manager = manager().await;
        let root = create(&manager, None, json!({})).await;
        let a = create(&manager, Some(root.id), json!({})).await;
        let b = create(&manager, Some(root.id), json!({})).await;

        let detail = manager.get(root.id).await.unwrap();
        assert_eq!(detail.children, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_list_rejects_zero_limit() {
        let manager = manager().await;
        assert!(manager.list(None, Some(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_with_children_is_conflict() {
        let manager = manager().await;
        let root = create(&manager, None, json!({})).await;
        let child = create(&manager, Some(root.id), json!({})).await;

        let err = manager.delete(root.id, DeletePolicy::Reject).await.unwrap_err();
        assert!(err.is_conflict());

        assert!(manager.get(root.id).await.is_ok());
        let child = manager.get(child.id).await.unwrap().state;
        assert_eq!(child.parent_id, Some(root.id));
    }
}
