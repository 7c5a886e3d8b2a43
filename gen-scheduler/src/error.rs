//! Application-wide error types.

use thiserror::Error;

use crate::generation::GenerationError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// Admission was not granted before the caller gave up.
    #[error("{}", rate_limited_message(*deadline_exceeded))]
    RateLimited { deadline_exceeded: bool },

    #[error("Keep-alive stream closed: {0}")]
    KeepAlive(String),

    #[error("{0}")]
    Other(String),
}

fn rate_limited_message(deadline_exceeded: bool) -> &'static str {
    if deadline_exceeded {
        "timed out waiting for a model rate limit slot, try again shortly"
    } else {
        "wait for a model rate limit slot was cancelled"
    }
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True for the admission-denied signal surfaced after cancellation or timeout.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether a task that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Generation(e) if e.is_retryable())
    }
}
