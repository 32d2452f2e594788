//! warp-core: shared vocabulary for the WarpGrid rollout engine.
//!
//! - **`types`**: application revisions and identifiers
//! - **`job`**: pipeline job types and job ids
//! - **`spec`**: the deployment spec tree (instances, steps, policies, blockers)
//! - **`config`**: `deployment.toml` parsing into a validated [`DeploymentSpec`]

pub mod config;
pub mod error;
pub mod job;
pub mod spec;
pub mod types;

pub use error::{SpecError, SpecResult};
pub use job::{JobId, JobType};
pub use spec::{
    BlockWindow, ChangeBlocker, DeploymentSpec, InstanceSpec, RevisionPolicy, RolloutPolicy, Step,
    UpgradePolicy,
};
pub use types::*;
