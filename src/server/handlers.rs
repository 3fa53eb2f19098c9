//! Axum handlers for the cell-state API.
//!
//! Handlers take JSON and query rejections as values so malformed input
//! answers 400 with an [`ErrorResponse`] body, then delegate to
//! [`CellStateManager`](crate::states::CellStateManager).

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use super::SharedState;
use crate::error::{AppError, AppResult, LineageError, StorageError};
use crate::export::{export_csv as render_csv, export_filename};
use crate::lineage::{DeletePolicy, LineageDirection};
use crate::parameters::definitions;
use crate::states::{
    CellStateDetail, CellStateUpdate, MeasuredParametersRequest, MeasuredParametersResult,
    PopulationDoublingsRequest, PopulationDoublingsResult,
};
use crate::storage::{CellState, NewCellState, Storage};

/// Error body returned by every failing request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
}

/// Health check body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `unhealthy`.
    pub status: String,
    /// `connected` or `disconnected`.
    pub database: String,
    /// RFC 3339 time of the check.
    pub timestamp: String,
}

/// `?skip=&limit=` paging.
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    /// Rows to skip.
    pub skip: Option<u32>,
    /// Page size.
    pub limit: Option<u32>,
}

/// `?direction=` for lineage queries.
#[derive(Debug, Default, Deserialize)]
pub struct LineageQuery {
    /// `ancestors`, `descendants` or `both`.
    pub direction: Option<String>,
}

/// `?policy=` for deletes.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    /// `reject` or `orphan`.
    pub policy: Option<String>,
}

/// HTTP status for an application error.
pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation { .. }
        | AppError::Storage(StorageError::InvalidParameters { .. }) => StatusCode::BAD_REQUEST,
        _ if err.is_not_found() => StatusCode::NOT_FOUND,
        _ if err.is_conflict() => StatusCode::CONFLICT,
        AppError::Kinetics(_)
        | AppError::Lineage(LineageError::LimitExceeded { .. })
        | AppError::Storage(StorageError::Lineage(LineageError::LimitExceeded { .. })) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
            client_message(&self)
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn client_message(err: &AppError) -> String {
    match err {
        AppError::Validation { field, reason } => format!("{}: {}", field, reason),
        AppError::Storage(inner) => inner.to_string(),
        AppError::Kinetics(inner) => inner.to_string(),
        AppError::Lineage(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::validation("body", rejection.body_text()))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> AppResult<T> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| AppError::validation("query", rejection.body_text()))
}

/// Service banner
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Cell Culture Tracker API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Database connectivity check
pub async fn health(State(state): State<SharedState>) -> (StatusCode, Json<HealthResponse>) {
    let timestamp = Utc::now().to_rfc3339();
    match state.storage.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                database: "connected".to_string(),
                timestamp,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".to_string(),
                    database: "disconnected".to_string(),
                    timestamp,
                }),
            )
        }
    }
}

/// `POST /states`
pub async fn create_state(
    State(state): State<SharedState>,
    payload: Result<Json<NewCellState>, JsonRejection>,
) -> AppResult<(StatusCode, Json<CellState>)> {
    let new_state = json_body(payload)?;
    let created = state.states.create(new_state).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /states`
pub async fn list_states(
    State(state): State<SharedState>,
    query: Result<Query<Pagination>, QueryRejection>,
) -> AppResult<Json<Vec<CellState>>> {
    let page = query_params(query)?;
    Ok(Json(state.states.list(page.skip, page.limit).await?))
}

/// `GET /states/:id`
pub async fn get_state(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> AppResult<Json<CellStateDetail>> {
    Ok(Json(state.states.get(id).await?))
}

/// `PATCH /states/:id`
pub async fn update_state(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    payload: Result<Json<CellStateUpdate>, JsonRejection>,
) -> AppResult<Json<CellState>> {
    let update = json_body(payload)?;
    Ok(Json(state.states.update(id, update).await?))
}

/// `DELETE /states/:id` and `DELETE /cell_states/:id`
pub async fn delete_state(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> AppResult<StatusCode> {
    let policy = match query_params(query)?.policy {
        Some(raw) => raw
            .parse::<DeletePolicy>()
            .map_err(|e| AppError::validation("policy", e))?,
        None => DeletePolicy::default(),
    };

    state.states.delete(id, policy).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /states/:id/lineage`
pub async fn get_lineage(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    query: Result<Query<LineageQuery>, QueryRejection>,
) -> AppResult<Json<Vec<CellState>>> {
    let direction = match query_params(query)?.direction {
        Some(raw) => raw
            .parse::<LineageDirection>()
            .map_err(|e| AppError::validation("direction", e))?,
        None => LineageDirection::default(),
    };

    Ok(Json(state.states.lineage(id, direction).await?))
}

/// `POST /calculate-measured-parameters`
pub async fn calculate_measured_parameters(
    State(state): State<SharedState>,
    payload: Result<Json<MeasuredParametersRequest>, JsonRejection>,
) -> AppResult<Json<MeasuredParametersResult>> {
    let request = json_body(payload)?;
    Ok(Json(state.states.calculate_measured_parameters(&request).await?))
}

/// `POST /calculate-population-doublings`
pub async fn calculate_population_doublings(
    State(state): State<SharedState>,
    payload: Result<Json<PopulationDoublingsRequest>, JsonRejection>,
) -> AppResult<Json<PopulationDoublingsResult>> {
    let request = json_body(payload)?;
    Ok(Json(state.states.record_population_doublings(&request).await?))
}

/// `GET /export/csv`
pub async fn export_csv(State(state): State<SharedState>) -> AppResult<Response> {
    let states = state
        .storage
        .list_all_states()
        .await
        .map_err(AppError::from)?;
    let body = render_csv(&states)?;
    let disposition = format!("attachment; filename=\"{}\"", export_filename(Utc::now()));

    debug!(rows = states.len(), "CSV export generated");

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// `GET /parameters/definitions`
pub async fn parameter_definitions() -> Json<Value> {
    Json(definitions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KineticsError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::validation("limit", "must be at least 1"), StatusCode::BAD_REQUEST),
            (
                StorageError::InvalidParameters {
                    field: "operation_type".to_string(),
                    reason: "must be a string".to_string(),
                }
                .into(),
                StatusCode::BAD_REQUEST,
            ),
            (StorageError::StateNotFound { id: 3 }.into(), StatusCode::NOT_FOUND),
            (StorageError::ParentNotFound { id: 3 }.into(), StatusCode::NOT_FOUND),
            (LineageError::NodeNotFound { id: 3 }.into(), StatusCode::NOT_FOUND),
            (
                StorageError::Lineage(LineageError::HasChildren { id: 1, child_count: 2 }).into(),
                StatusCode::CONFLICT,
            ),
            (KineticsError::NonIncreasingTime.into(), StatusCode::UNPROCESSABLE_ENTITY),
            (
                LineageError::LimitExceeded { limit: 10 }.into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                StorageError::Query { message: "boom".to_string() }.into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AppError::Internal { message: "boom".to_string() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{}", err);
        }
    }

    #[test]
    fn test_client_message_for_validation() {
        let err = AppError::validation("policy", "Unknown delete policy: purge");
        assert_eq!(client_message(&err), "policy: Unknown delete policy: purge");
    }

    #[test]
    fn test_client_message_for_conflict() {
        let err: AppError =
            StorageError::Lineage(LineageError::HasChildren { id: 1, child_count: 2 }).into();
        assert_eq!(
            client_message(&err),
            "Cannot delete state with children: 1 has 2 child state(s)"
        );
    }
}
