//! Agent error types.

use thiserror::Error;

/// Errors raised by simulation managers and the agent loop.
///
/// `Cluster` and `State` wrap infrastructure failures: the cycle that hit
/// them fails and the next cycle retries. `NotInitialized`,
/// `AlreadyInitialized`, `InvalidConfig` and `Throttle` report invalid usage.
/// `ModelNotFound` is handled per device and never aborts a cycle.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("simulation manager used before init")]
    NotInitialized,

    #[error("simulation manager already initialized for simulation {0}")]
    AlreadyInitialized(String),

    #[error("device model not found: {model_id} (simulation {simulation_id})")]
    ModelNotFound {
        model_id: String,
        simulation_id: String,
    },

    #[error("invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] devsim_cluster::ClusterError),

    #[error("state store error: {0}")]
    State(#[from] devsim_state::StateError),

    #[error("throttling error: {0}")]
    Throttle(#[from] devsim_throttle::ThrottleError),
}

pub type AgentResult<T> = Result<T, AgentError>;
