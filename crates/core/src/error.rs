//! Core error model.

use thiserror::Error;

/// Result type used across the model layer.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Model-level error.
///
/// Keep this focused on deterministic failures (validation, illegal state
/// transitions, conflicts). Storage concerns belong to the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// A value failed validation (e.g. a record built without a handler).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A conflict occurred (e.g. optimistic ownership check failed).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl OutboxError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
