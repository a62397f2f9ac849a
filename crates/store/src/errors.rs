//! Error types for the store crate

use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Only genuine trouble becomes an error: logical misses and rejected input
/// are `Ok(None)` / `Ok(false)` / empty collections at the operation
/// boundary, so callers can rely on `?` meaning "storage or upstream broke".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stored value is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("upstream resolution failed for {target}: {message}")]
    Upstream { target: String, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn upstream(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            target: target.into(),
            message: message.into(),
        }
    }
}
