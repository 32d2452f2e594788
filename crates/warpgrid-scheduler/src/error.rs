//! Orchestrator error types.

use thiserror::Error;

use warpgrid_rollout::TriggerError;
use warpgrid_state::StateError;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that can occur while running rollout cycles or operator commands.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("a deployment spec is required to create application {0}")]
    MissingSpec(String),
}

impl OrchestratorError {
    /// Whether the next cycle may succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::State(e) if e.is_transient())
    }
}
