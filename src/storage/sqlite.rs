use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

use super::{CellState, NewCellState, ParameterCheck, StatePatch, Storage};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::lineage::{DeletePlan, DeletePolicy, StateLink};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const STATE_COLUMNS: &str = "id, name, timestamp, parent_id, parameters, additional_notes";

/// Ids bound per `IN (...)` query, below SQLite's host-parameter limit.
const ID_CHUNK_SIZE: usize = 500;

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                    message: format!("Failed to create database directory: {}", e),
                })?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory database, mainly for tests.
    ///
    /// Each SQLite memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_state(&self, state: &NewCellState) -> StorageResult<CellState> {
        let parameters = serde_json::to_string(&state.parameters)?;
        let mut tx = self.pool.begin().await?;

        if let Some(parent_id) = state.parent_id {
            let parent: Option<(i64,)> = sqlx::query_as("SELECT id FROM cell_states WHERE id = ?")
                .bind(parent_id)
                .fetch_optional(&mut *tx)
                .await?;
            if parent.is_none() {
                return Err(StorageError::ParentNotFound { id: parent_id });
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO cell_states (name, timestamp, parent_id, parameters, additional_notes)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.name)
        .bind(state.timestamp.to_rfc3339())
        .bind(state.parent_id)
        .bind(&parameters)
        .bind(&state.additional_notes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let id = result.last_insert_rowid();
        debug!(state_id = id, parent_id = ?state.parent_id, "Cell state inserted");

        Ok(CellState {
            id,
            name: state.name.clone(),
            timestamp: state.timestamp,
            parent_id: state.parent_id,
            parameters: state.parameters.clone(),
            additional_notes: state.additional_notes.clone(),
        })
    }

    async fn get_state(&self, id: i64) -> StorageResult<Option<CellState>> {
        let row: Option<CellStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cell_states WHERE id = ?",
            STATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CellState::try_from).transpose()
    }

    async fn list_states(&self, skip: u32, limit: u32) -> StorageResult<Vec<CellState>> {
        let rows: Vec<CellStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cell_states ORDER BY id ASC LIMIT ? OFFSET ?",
            STATE_COLUMNS
        ))
        .bind(i64::from(limit))
        .bind(i64::from(skip))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CellState::try_from).collect()
    }

    async fn list_all_states(&self) -> StorageResult<Vec<CellState>> {
        let rows: Vec<CellStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cell_states ORDER BY id ASC",
            STATE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CellState::try_from).collect()
    }

    async fn get_states(&self, ids: &[i64]) -> StorageResult<Vec<CellState>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows: Vec<CellStateRow> = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM cell_states WHERE id IN (", STATE_COLUMNS));
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let chunk_rows: Vec<CellStateRow> =
                builder.build_query_as().fetch_all(&self.pool).await?;
            rows.extend(chunk_rows);
        }

        let mut by_id = rows
            .into_iter()
            .map(|row| CellState::try_from(row).map(|state| (state.id, state)))
            .collect::<StorageResult<HashMap<i64, CellState>>>()?;

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn child_ids(&self, id: i64) -> StorageResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM cell_states WHERE parent_id = ? ORDER BY id ASC")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(child,)| child).collect())
    }

    async fn lineage_links(&self) -> StorageResult<Vec<StateLink>> {
        let rows: Vec<(i64, Option<i64>)> =
            sqlx::query_as("SELECT id, parent_id FROM cell_states ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, parent_id)| StateLink::new(id, parent_id))
            .collect())
    }

    async fn merge_state(
        &self,
        id: i64,
        patch: &StatePatch,
        check: ParameterCheck,
    ) -> StorageResult<CellState> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before it reads.
        let locked = sqlx::query("UPDATE cell_states SET name = name WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if locked.rows_affected() == 0 {
            return Err(StorageError::StateNotFound { id });
        }

        let row: CellStateRow = sqlx::query_as(&format!(
            "SELECT {} FROM cell_states WHERE id = ?",
            STATE_COLUMNS
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let mut state = CellState::try_from(row)?;
        patch.apply_to(&mut state);
        if !patch.parameters.is_empty() {
            check(&state.parameters)?;
        }

        let parameters = serde_json::to_string(&state.parameters)?;
        sqlx::query(
            r#"
            UPDATE cell_states
            SET name = ?, parameters = ?, additional_notes = ?
            WHERE id = ?
            "#,
        )
        .bind(&state.name)
        .bind(&parameters)
        .bind(&state.additional_notes)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(state_id = id, merged_keys = patch.parameters.len(), "Cell state merged");
        Ok(state)
    }

    async fn delete_state(&self, id: i64, policy: DeletePolicy) -> StorageResult<DeletePlan> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM cell_states WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::StateNotFound { id });
        }

        let children: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM cell_states WHERE parent_id = ? ORDER BY id ASC")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;
        let children: Vec<i64> = children.into_iter().map(|(child,)| child).collect();

        // Dropping the transaction on a rejected plan rolls it back untouched.
        let plan = policy.plan(id, &children)?;

        if !plan.orphaned.is_empty() {
            sqlx::query("UPDATE cell_states SET parent_id = NULL WHERE parent_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM cell_states WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(state_id = id, orphaned = plan.orphaned.len(), %policy, "Cell state deleted");
        Ok(plan)
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct CellStateRow {
    id: i64,
    name: String,
    timestamp: String,
    parent_id: Option<i64>,
    parameters: String,
    additional_notes: Option<String>,
}

impl TryFrom<CellStateRow> for CellState {
    type Error = StorageError;

    fn try_from(row: CellStateRow) -> Result<Self, Self::Error> {
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::Query {
                message: format!("Invalid timestamp on cell state {}: {}", row.id, e),
            })?;

        let parameters: Map<String, Value> = serde_json::from_str(&row.parameters)?;

        Ok(Self {
            id: row.id,
            name: row.name,
            timestamp,
            parent_id: row.parent_id,
            parameters,
            additional_notes: row.additional_notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_row_round_trip_preserves_fields() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 5, 2, 14, 15, 30).unwrap();

        let created = storage
            .create_state(
                &NewCellState::new(ts)
                    .with_name("P1")
                    .with_parameters(params(json!({"operation_type": "passage", "volume_ml": 20})))
                    .with_notes("split 1:4"),
            )
            .await
            .unwrap();

        let fetched = storage.get_state(created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.timestamp, ts);
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_reported() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        sqlx::query("INSERT INTO cell_states (name, timestamp, parameters) VALUES ('x', 'garbage', '{}')")
            .execute(storage.pool())
            .await
            .unwrap();

        let err = storage.list_all_states().await.unwrap_err();
        assert!(matches!(err, StorageError::Query { .. }));
    }

    #[tokio::test]
    async fn test_get_states_preserves_requested_order() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let ts = Utc::now();
        let a = storage.create_state(&NewCellState::new(ts)).await.unwrap();
        let b = storage.create_state(&NewCellState::new(ts)).await.unwrap();
        let c = storage.create_state(&NewCellState::new(ts)).await.unwrap();

        let states = storage.get_states(&[c.id, a.id, 999, b.id]).await.unwrap();
        let ids: Vec<i64> = states.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![c.id, a.id, b.id]);
    }

    #[tokio::test]
    async fn test_get_states_spans_several_chunks() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let ts = Utc::now();
        let a = storage.create_state(&NewCellState::new(ts)).await.unwrap();
        let b = storage.create_state(&NewCellState::new(ts)).await.unwrap();
        let c = storage.create_state(&NewCellState::new(ts)).await.unwrap();

        let mut ids = vec![b.id];
        ids.extend(1_000..1_000 + ID_CHUNK_SIZE as i64);
        ids.push(a.id);
        ids.extend(10_000..10_000 + 2 * ID_CHUNK_SIZE as i64);
        ids.push(c.id);

        let states = storage.get_states(&ids).await.unwrap();
        let found: Vec<i64> = states.iter().map(|s| s.id).collect();
        assert_eq!(found, vec![b.id, a.id, c.id]);
    }

    #[tokio::test]
    async fn test_merge_state_rejected_check_leaves_row() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let created = storage
            .create_state(&NewCellState::new(Utc::now()).with_parameters(params(json!({"a": 1}))))
            .await
            .unwrap();

        fn reject(_: &Map<String, Value>) -> StorageResult<()> {
            Err(StorageError::InvalidParameters {
                field: "a".to_string(),
                reason: "rejected".to_string(),
            })
        }

        let patch = StatePatch::parameters(params(json!({"a": 2})));
        let err = storage.merge_state(created.id, &patch, reject).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidParameters { .. }));

        let fetched = storage.get_state(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.parameters["a"], json!(1));
    }

    #[tokio::test]
    async fn test_ping() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        assert!(storage.ping().await.is_ok());
    }
}
