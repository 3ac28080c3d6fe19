//! Cluster error types.

use thiserror::Error;

/// Errors raised by the membership and partition services.
///
/// Contention on a lease is not an error; see `DevicePartitions`.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("state store error: {0}")]
    State(#[from] devsim_state::StateError),

    #[error("simulation not found: {0}")]
    SimulationNotFound(String),

    #[error("invalid clustering configuration: {0}")]
    InvalidConfig(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
