//! Error types returned at the orchestrator boundary.
//!
//! Only conditions that stop a rollout from being recorded, or a request
//! that cannot be served, are errors. Breaches, timeouts and executor
//! failures inside a running rollout become recorded decisions that
//! route it to `RollingBack`.

use thiserror::Error;

use rollgate_core::PlanError;
use rollgate_state::StateError;

/// Result type alias for orchestrator operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("preflight NOGO: {reason}")]
    Validation {
        reason: String,
        failed_checks: Vec<String>,
    },

    #[error("target {target} is locked by rollout {owner}")]
    LeaseConflict { target: String, owner: String },

    #[error("rollout {0} not found")]
    NotFound(String),

    /// A non-terminal record with no executor in this process, left by
    /// an orchestrator that stopped. It ends when its lease is reclaimed.
    #[error("rollout {0} is not running in this orchestrator")]
    NotActive(String),

    #[error(transparent)]
    State(StateError),
}

impl From<StateError> for RolloutError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::LeaseConflict { target, owner } => Self::LeaseConflict { target, owner },
            other => Self::State(other),
        }
    }
}
