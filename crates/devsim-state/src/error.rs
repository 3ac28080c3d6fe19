//! Error types for the devsim state store.
//!
//! Every variant is an infrastructure failure. Lease contention is never an
//! error: the lease operations report it as `Ok(false)`.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("failed to encode record: {0}")]
    Serialize(String),

    #[error("failed to decode record: {0}")]
    Deserialize(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid id: {0}")]
    InvalidId(String),
}
