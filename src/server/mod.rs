//! HTTP server for the cell-state API.
//!
//! This module provides:
//! - Shared application state injected into every handler
//! - The axum router with CORS and request tracing layers
//! - The serve loop with graceful shutdown on Ctrl-C

mod handlers;

pub use handlers::*;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::states::CellStateManager;
use crate::storage::SqliteStorage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Cell-state operations.
    pub states: CellStateManager,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        let states = CellStateManager::new(storage.clone(), &config);
        Self {
            config,
            storage,
            states,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;

/// Build the API router.
pub fn router(state: SharedState) -> Router {
    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/states", post(create_state).get(list_states))
        .route("/states/", post(create_state).get(list_states))
        .route(
            "/states/:id",
            get(get_state).patch(update_state).delete(delete_state),
        )
        .route("/cell_states/:id", delete(delete_state))
        .route("/states/:id/lineage", get(get_lineage))
        .route(
            "/calculate-measured-parameters",
            post(calculate_measured_parameters),
        )
        .route(
            "/calculate-population-doublings",
            post(calculate_population_doublings),
        )
        .route("/export/csv", get(export_csv))
        .route("/parameters/definitions", get(parameter_definitions))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(state: SharedState) -> AppResult<()> {
    let address = state.config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| AppError::Internal {
            message: format!("Failed to bind {}: {}", address, e),
        })?;

    info!(address = %address, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Internal {
            message: format!("Server error: {}", e),
        })
}

async fn shutdown_signal() {
    wait_for_shutdown(tokio::signal::ctrl_c()).await
}

/// Resolve once `signal` fires. If the signal cannot be installed, never
/// resolve, so the server keeps running instead of shutting down.
async fn wait_for_shutdown<F>(signal: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, "Failed to listen for shutdown signal; running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, LineageConfig, LogFormat, LoggingConfig, ServerConfig};
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app(origins: &[&str]) -> Router {
        let config = Config {
            server: ServerConfig {
                cors_allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
                ..ServerConfig::default()
            },
            database: DatabaseConfig {
                path: ":memory:".into(),
                max_connections: 1,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: LogFormat::Pretty,
            },
            lineage: LineageConfig::default(),
        };
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        router(Arc::new(AppState::new(config, storage)))
    }

    async fn preflight(app: Router, origin: &str) -> Option<String> {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/states")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .map(|value| value.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_cors_allows_listed_origin_and_skips_invalid() {
        let app = app(&["http://localhost:3000", "bad\norigin"]).await;
        let allowed = preflight(app, "http://localhost:3000").await;
        assert_eq!(allowed.as_deref(), Some("http://localhost:3000"));
    }

    #[tokio::test]
    async fn test_cors_omits_header_for_unlisted_origin() {
        let app = app(&["http://localhost:3000"]).await;
        assert_eq!(preflight(app, "http://evil.test").await, None);
    }

    #[tokio::test]
    async fn test_cors_wildcard_allows_any_origin() {
        let app = app(&["*"]).await;
        let allowed = preflight(app, "http://anywhere.test").await;
        assert_eq!(allowed.as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn test_shutdown_waits_when_signal_unavailable() {
        let failing = async { Err(std::io::Error::other("no signal driver")) };
        let result = tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown(failing)).await;
        assert!(result.is_err(), "server must not shut down on a signal setup error");
    }

    #[tokio::test]
    async fn test_shutdown_resolves_on_signal() {
        let fired = async { Ok(()) };
        let result = tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(fired)).await;
        assert!(result.is_ok());
    }
}
