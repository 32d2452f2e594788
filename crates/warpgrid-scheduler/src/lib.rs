//! warpgrid-scheduler: the rollout orchestration loop.
//!
//! Periodically, and whenever woken by an operator command, the
//! [`Orchestrator`] evaluates every application with the rollout engine,
//! commits the decisions under the application's lock and hands started
//! runs and aborts to a [`JobExecutor`].
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── StateStore (load, lock_and_store per application)
//!   ├── watch::Receiver<VersionStatus> (refreshed out of band)
//!   ├── DeploymentTrigger (pure decisions)
//!   ├── capacity (test job admission across applications)
//!   └── JobExecutor (deploy / abort, outside the lock)
//! ```

pub mod capacity;
pub mod error;
pub mod executor;
pub mod orchestrator;

pub use capacity::Admission;
pub use error::{OrchestratorError, OrchestratorResult};
pub use executor::{Completion, DryRunExecutor, ExecutorCall, JobExecutor, SimulatedExecutor};
pub use orchestrator::{
    Clock, CycleReport, Orchestrator, OrchestratorConfig, refresh_version_status, system_clock,
};
