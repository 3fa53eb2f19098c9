use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Kinetics error: {0}")]
    Kinetics(#[from] KineticsError),

    #[error("Lineage error: {0}")]
    Lineage(#[from] LineageError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Cell state not found: {id}")]
    StateNotFound { id: i64 },

    #[error("Parent cell state not found: {id}")]
    ParentNotFound { id: i64 },

    #[error("Invalid parameters: {field} - {reason}")]
    InvalidParameters { field: String, reason: String },

    #[error(transparent)]
    Lineage(#[from] LineageError),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Growth-kinetics domain errors
#[derive(Debug, Error, PartialEq)]
pub enum KineticsError {
    #[error("Seed and harvest counts must be positive (seed: {seed_count}, harvest: {harvest_count})")]
    NonPositiveCount { seed_count: f64, harvest_count: f64 },

    #[error("Cell densities must be positive (start: {start}, end: {end})")]
    NonPositiveDensity { start: f64, end: f64 },

    #[error("End time must be after start time")]
    NonIncreasingTime,
}

/// Lineage tree errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineageError {
    #[error("Cell state not found: {id}")]
    NodeNotFound { id: i64 },

    #[error("Cannot delete state with children: {id} has {child_count} child state(s)")]
    HasChildren { id: i64, child_count: usize },

    #[error("Lineage exceeds the limit of {limit} states")]
    LimitExceeded { limit: usize },
}

impl AppError {
    /// Shorthand for a validation failure on a named field
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means a referenced state does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::Storage(StorageError::StateNotFound { .. })
                | AppError::Storage(StorageError::ParentNotFound { .. })
                | AppError::Storage(StorageError::Lineage(LineageError::NodeNotFound { .. }))
                | AppError::Lineage(LineageError::NodeNotFound { .. })
        )
    }

    /// Whether the error means a delete was blocked by existing children
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AppError::Storage(StorageError::Lineage(LineageError::HasChildren { .. }))
                | AppError::Lineage(LineageError::HasChildren { .. })
        )
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for kinetics calculations
pub type KineticsResult<T> = Result<T, KineticsError>;

/// Result type alias for lineage operations
pub type LineageResult<T> = Result<T, LineageError>;
