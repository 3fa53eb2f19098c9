//! # Culture Tracker
//!
//! An HTTP service that records laboratory cell-culture events as a lineage
//! forest of cell states and derives growth kinetics from them.
//!
//! ## Features
//!
//! - **Cell states**: create, list, merge-update and delete culture events
//! - **Lineage**: ancestors and descendants of any state, cycle-safe
//! - **Kinetics**: population doublings, doubling time, measured growth rate
//! - **Parameter registry**: per-operation applicable parameters and metadata
//! - **CSV export**: every state with `N/A` for inapplicable parameters
//!
//! ## Architecture
//!
//! ```text
//! HTTP Client → axum Router → CellStateManager → SQLite (sqlx)
//!                                   ↓
//!                        kinetics / lineage / parameters
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use culture_tracker::{AppState, Config};
//! use culture_tracker::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let state = Arc::new(AppState::new(config, storage));
//!     culture_tracker::server::serve(state).await?;
//!     Ok(())
//! }
//! ```

/// Configuration management for the service.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// CSV export of recorded states.
pub mod export;
/// Growth-kinetics formulas.
pub mod kinetics;
/// Lineage index, traversal and delete policies.
pub mod lineage;
/// Operation types, typed parameters and the parameter registry.
pub mod parameters;
/// HTTP router, handlers and serve loop.
pub mod server;
/// Cell-state operations over the store.
pub mod states;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{router, AppState, SharedState};
pub use states::CellStateManager;
