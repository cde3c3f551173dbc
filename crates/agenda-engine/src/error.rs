//! Error types for agenda-engine operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgendaError {
    /// Malformed input rejected before touching the store.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Expansion error: {0}")]
    Expansion(String),

    /// Unknown master, standalone event or occurrence.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent writer changed the row first. Callers may retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AgendaError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether the same request may succeed if simply resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for AgendaError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgendaError>;
