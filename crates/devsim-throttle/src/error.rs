//! Throttling error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("invalid cluster size: {0} (a cluster has at least one node)")]
    InvalidClusterSize(usize),
}

pub type ThrottleResult<T> = Result<T, ThrottleError>;
