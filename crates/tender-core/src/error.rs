use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for the orchestration core.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Invalid task, scraper or orchestrator configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The source has no usable primary implementation and no usable fallback.
    #[error("Scraper unavailable for source '{0}'")]
    ScraperUnavailable(String),

    /// The extraction callable failed during a run.
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// The task deadline elapsed.
    #[error("Task timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Cooperative cancellation was observed.
    #[error("Cancellation requested")]
    Cancelled,

    /// The health monitor refused to admit new work.
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A task or session id is unknown (or was already cleaned up).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation is not allowed in the entity's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Handing records to the persistence layer failed.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The orchestrator is shutting down and no longer accepts commands.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}

impl AppError {
    /// Returns true if a failed attempt with this error may be retried.
    ///
    /// Timeouts and record hand-off failures retry like execution failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ExecutionError(_) | AppError::Timeout(_) | AppError::PersistenceError(_)
        )
    }

    /// Short machine-readable label, used in session metadata and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigError(_) => "config_error",
            AppError::ScraperUnavailable(_) => "scraper_unavailable",
            AppError::ExecutionError(_) => "execution_error",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled => "cancelled",
            AppError::ResourceExhausted(_) => "resource_exhausted",
            AppError::NotFound { .. } => "not_found",
            AppError::InvalidState(_) => "invalid_state",
            AppError::PersistenceError(_) => "persistence_error",
            AppError::SerializationError(_) => "serialization_error",
            AppError::ShuttingDown => "shutting_down",
        }
    }
}
