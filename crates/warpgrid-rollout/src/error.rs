//! Rollout engine error types.
//!
//! Evaluation itself never fails; these only surface from the operator
//! mutators on [`DeploymentTrigger`](crate::DeploymentTrigger).

use thiserror::Error;

/// Result type alias for rollout operations.
pub type TriggerResult<T> = Result<T, TriggerError>;

/// Errors that can occur during operator-issued rollout operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("job not in deployment spec: {0}")]
    UnknownJob(String),

    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("job has never been triggered: {0}")]
    NeverTriggered(String),

    #[error("job already running: {0}")]
    AlreadyRunning(String),

    #[error("pause only allowed for up to {max_hours} hours")]
    PauseTooLong { max_hours: i64 },

    #[error("refusing to downgrade {job} to {versions}")]
    Downgrade { job: String, versions: String },

    #[error("revision build-{build} is not newer than build-{latest}")]
    StaleRevision { build: u64, latest: u64 },
}
