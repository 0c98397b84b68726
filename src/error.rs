use thiserror::Error;

/// Typed errors raised by the storage engine.
///
/// Callers above the store distinguish conflicts (yield and requeue) from
/// state errors (fatal, fail the snapshot) from plain database failures
/// (transient, retryable at the caller's discretion).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An illegal snapshot transition or integrity violation.
    #[error("illegal state: {0}")]
    State(String),

    /// Lost a race against a concurrent writer (activation, staging run).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
