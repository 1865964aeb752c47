//! The error taxonomy the engine surfaces across every module.

use thiserror::Error;

/// Errors a store implementation can return; kept separate from [`CoreError`] so
/// store crates don't need to depend on this one, only `From<StoreError>`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("change bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid canary rule: {0}")]
    InvalidCanaryRule(String),

    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => CoreError::NotFound(msg),
            StoreError::Backend(source) => CoreError::Internal(source),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
