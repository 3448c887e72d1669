//! Error types for relq.
//!
//! Expected outcomes of queue traffic (nothing to acquire, item not owned,
//! a lost acquire race) are not errors; they surface as `Ok(None)`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before touching the datastore (blank acquirer id, oversized identity).
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Failure reported by a non-SQL store backend.
    #[error("store error: {0}")]
    Store(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
