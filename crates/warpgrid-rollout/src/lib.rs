//! WarpGrid rollout decision engine.
//!
//! Given an application's deployment spec, its rollout state and the
//! system's platform version status, this crate decides which pipeline jobs
//! to trigger, with which versions, and which running jobs to abort. Every
//! decision is a pure function of its inputs and the current time.
//!
//! # Components
//!
//! - **`status`**: the step graph of a deployment spec, and when each step
//!   completed or became ready for a change
//! - **`policy`**: splitting and joining of platform and revision changes
//! - **`backoff`**: retry cool-down for failing jobs
//! - **`upgrade`**: platform target selection from version confidence
//! - **`trigger`**: evaluation, commit and operator commands

pub mod backoff;
pub mod config;
pub mod error;
pub mod policy;
pub mod status;
pub mod trigger;
pub mod upgrade;

pub use backoff::RetryPolicy;
pub use config::TriggerConfig;
pub use error::{TriggerError, TriggerResult};
pub use policy::{RolloutState, Split};
pub use status::{DeploymentStatus, Job, JobsToRun, StepId, StepKind, StepStatus};
pub use trigger::{
    AbortAction, AbortReason, Actions, CancelScope, DeploymentTrigger, Dispatch, Evaluation, TriggerAction,
};
