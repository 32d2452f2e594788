//! Job executor: where triggered runs go.
//!
//! The orchestrator never runs jobs itself. It hands started runs and abort
//! requests to a [`JobExecutor`], whose results come back later through
//! [`Orchestrator::report_run`](crate::Orchestrator::report_run).
//!
//! Both calls may be repeated for the same run, so implementations must be
//! idempotent per run id.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use warpgrid_state::{Run, RunId, RunStatus};

/// External collaborator which executes deployment and test jobs.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Start `run` of a job of `application`.
    async fn deploy(&self, application: &str, run: &Run) -> anyhow::Result<()>;

    /// Ask a running job to stop. Its final status is reported later.
    async fn abort(&self, application: &str, run: &RunId) -> anyhow::Result<()>;
}

/// A call made to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    Deploy { application: String, run: Run },
    Abort { application: String, run: RunId },
}

/// Executor which only logs and records what it is asked to do.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    calls: Mutex<Vec<ExecutorCall>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls so far, oldest first.
    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.lock().clone()
    }

    /// Remove and return all calls so far.
    pub fn take(&self) -> Vec<ExecutorCall> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExecutorCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobExecutor for DryRunExecutor {
    async fn deploy(&self, application: &str, run: &Run) -> anyhow::Result<()> {
        info!(application, run = %run.id, versions = %run.versions, "dry run: deploy");
        self.lock().push(ExecutorCall::Deploy {
            application: application.to_string(),
            run: run.clone(),
        });
        Ok(())
    }

    async fn abort(&self, application: &str, run: &RunId) -> anyhow::Result<()> {
        info!(application, %run, "dry run: abort");
        self.lock().push(ExecutorCall::Abort {
            application: application.to_string(),
            run: run.clone(),
        });
        Ok(())
    }
}

/// A run outcome produced by a [`SimulatedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub application: String,
    pub run: RunId,
    pub status: RunStatus,
}

/// Executor which pretends every run succeeds after `run_duration`.
///
/// Outcomes are sent on the channel returned by [`SimulatedExecutor::new`];
/// [`Orchestrator::report_completions`](crate::Orchestrator::report_completions)
/// feeds them back so a daemon without real workers still makes progress.
/// Aborted runs are reported right away.
#[derive(Debug)]
pub struct SimulatedExecutor {
    run_duration: Duration,
    completions: mpsc::UnboundedSender<Completion>,
}

impl SimulatedExecutor {
    pub fn new(run_duration: Duration) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, receiver) = mpsc::unbounded_channel();
        (
            Self {
                run_duration,
                completions,
            },
            receiver,
        )
    }

    fn complete_after(&self, delay: Duration, completion: Completion) {
        let completions = self.completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if completions.send(completion).is_err() {
                debug!("completion receiver gone, dropping outcome");
            }
        });
    }
}

#[async_trait]
impl JobExecutor for SimulatedExecutor {
    async fn deploy(&self, application: &str, run: &Run) -> anyhow::Result<()> {
        info!(
            application,
            run = %run.id,
            versions = %run.versions,
            after_secs = self.run_duration.as_secs(),
            "simulated run started"
        );
        self.complete_after(
            self.run_duration,
            Completion {
                application: application.to_string(),
                run: run.id.clone(),
                status: RunStatus::Success,
            },
        );
        Ok(())
    }

    async fn abort(&self, application: &str, run: &RunId) -> anyhow::Result<()> {
        info!(application, %run, "simulated run aborted");
        self.complete_after(
            Duration::ZERO,
            Completion {
                application: application.to_string(),
                run: run.clone(),
                status: RunStatus::Aborted,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::DateTime;
    use warp_core::{JobId, JobType, RevisionId, Version};
    use warpgrid_state::Versions;

    #[tokio::test]
    async fn dry_run_records_calls_in_order() {
        let executor = DryRunExecutor::new();
        let id = RunId::new(JobId::new("default", JobType::SystemTest), 1);
        let run = Run::start(
            id.clone(),
            Versions::new(Version::new(1, 0, 0), RevisionId::new(1)),
            DateTime::UNIX_EPOCH,
        );

        executor.deploy("tenant.app", &run).await.unwrap();
        executor.abort("tenant.app", &id).await.unwrap();

        let calls = executor.take();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], ExecutorCall::Deploy { run: deployed, .. } if deployed.id == id));
        assert!(matches!(&calls[1], ExecutorCall::Abort { run: aborted, .. } if *aborted == id));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn simulated_runs_report_their_outcomes() {
        let (executor, mut completions) = SimulatedExecutor::new(Duration::from_millis(10));
        let deployed = RunId::new(JobId::new("default", JobType::SystemTest), 1);
        let aborted = RunId::new(JobId::new("default", JobType::StagingTest), 1);
        let run = Run::start(
            deployed.clone(),
            Versions::new(Version::new(1, 0, 0), RevisionId::new(1)),
            DateTime::UNIX_EPOCH,
        );

        executor.deploy("tenant.app", &run).await.unwrap();
        executor.abort("tenant.app", &aborted).await.unwrap();

        // The abort is reported first, without waiting for the run duration.
        let first = completions.recv().await.unwrap();
        assert_eq!((first.run, first.status), (aborted, RunStatus::Aborted));
        let second = completions.recv().await.unwrap();
        assert_eq!(second.application, "tenant.app");
        assert_eq!((second.run, second.status), (deployed, RunStatus::Success));
    }
}
