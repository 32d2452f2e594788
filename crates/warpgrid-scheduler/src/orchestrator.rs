//! Orchestrator: the rollout control loop.
//!
//! Each cycle ([`Orchestrator::maintain`]) runs in two phases:
//!
//! 1. **Plan**: every application is loaded and evaluated in parallel, and
//!    the candidate test triggers of all applications compete for test
//!    capacity.
//! 2. **Commit**: every application is evaluated again under its lock, its
//!    admitted actions are committed and the result stored. Started runs and
//!    aborts are dispatched to the [`JobExecutor`] after the lock is released.
//!
//! An application whose lock can't be taken in time is skipped until the
//! next cycle; a failure in one application never stops the others.
//!
//! Operator commands go through the same locked read-modify-write, and wake
//! the loop so their effects are acted upon right away.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use warp_core::{ApplicationRevision, DeploymentSpec, JobId};
use warpgrid_rollout::{CancelScope, DeploymentTrigger, Dispatch, Evaluation, TriggerResult};
use warpgrid_state::{Application, Change, FailureKind, RunId, RunStatus, StateStore, VersionStatus};

use crate::capacity::{self, Admission};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::executor::{Completion, JobExecutor};

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Time between cycles when nothing wakes the loop.
    pub interval: Duration,
    /// How long to wait for an application's lock before skipping it.
    pub lock_timeout: Duration,
    /// Maximum concurrent runs per test job type, across applications.
    pub test_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(10),
            test_capacity: 8,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub applications: usize,
    /// Runs handed to the executor.
    pub triggered: usize,
    pub aborted: usize,
    /// Test triggers held back for lack of capacity.
    pub deferred: usize,
    /// Runs the executor refused; these are marked as failed.
    pub dispatch_failures: usize,
    /// Applications left for the next cycle, e.g. on lock timeout.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct DispatchOutcome {
    triggered: usize,
    aborted: usize,
    failures: usize,
}

/// Drives rollouts of all applications in a [`StateStore`].
#[derive(Clone)]
pub struct Orchestrator {
    store: StateStore,
    executor: Arc<dyn JobExecutor>,
    trigger: Arc<DeploymentTrigger>,
    versions: watch::Receiver<VersionStatus>,
    config: OrchestratorConfig,
    clock: Clock,
    wake: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn JobExecutor>,
        versions: watch::Receiver<VersionStatus>,
        trigger: DeploymentTrigger,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            executor,
            trigger: Arc::new(trigger),
            versions,
            config,
            clock: system_clock(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Use `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Request a cycle as soon as possible.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// The latest version status snapshot.
    pub fn version_status(&self) -> VersionStatus {
        self.versions.borrow().clone()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    // ── Control loop ───────────────────────────────────────────────

    /// Run cycles every interval, or when woken, until `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            test_capacity = self.config.test_capacity,
            "orchestrator started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.wake.notified() => debug!("cycle requested"),
                _ = shutdown.changed() => {
                    info!("orchestrator shutting down");
                    break;
                }
            }
            if let Err(e) = self.maintain().await {
                error!(error = %e, "rollout cycle failed");
            }
        }
    }

    /// Run one rollout cycle over all applications.
    pub async fn maintain(&self) -> OrchestratorResult<CycleReport> {
        let now = self.now();
        let versions = self.version_status();
        let ids = self.store.list_application_ids()?;
        let mut report = CycleReport {
            applications: ids.len(),
            ..CycleReport::default()
        };

        let mut planning = JoinSet::new();
        for id in ids {
            let (store, trigger, versions) = (self.store.clone(), self.trigger.clone(), versions.clone());
            // Store reads and evaluation are synchronous.
            planning.spawn_blocking(move || {
                let planned = store.load(&id).map(|application| {
                    let actions = trigger.evaluate(&application, &versions, now).actions;
                    (application, actions)
                });
                (id, planned)
            });
        }
        let mut plans = Vec::new();
        while let Some(joined) = planning.join_next().await {
            match joined {
                Ok((id, Ok((application, actions)))) => plans.push((id, application, actions)),
                Ok((id, Err(e))) => {
                    warn!(application = %id, error = %e, "failed to load application, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(error = %e, "planning task failed");
                    report.failed += 1;
                }
            }
        }
        plans.sort_by(|a, b| a.0.cmp(&b.0));

        let running = capacity::running_tests(plans.iter().map(|(_, application, _)| application));
        let candidates = plans
            .iter()
            .flat_map(|(id, _, actions)| actions.to_trigger.iter().map(move |action| (id.as_str(), action)));
        let admission = Arc::new(capacity::admit(candidates, self.config.test_capacity, &running));
        report.deferred = admission.deferred;

        let mut committing = JoinSet::new();
        for (id, _, _) in plans {
            let (this, versions, admission) = (self.clone(), versions.clone(), admission.clone());
            committing.spawn(async move {
                let outcome = this.commit_application(&id, &versions, now, &admission).await;
                (id, outcome)
            });
        }
        while let Some(joined) = committing.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.triggered += outcome.triggered;
                    report.aborted += outcome.aborted;
                    report.dispatch_failures += outcome.failures;
                }
                Ok((id, Err(e))) if e.is_transient() => {
                    warn!(application = %id, error = %e, "application busy, retrying next cycle");
                    report.skipped += 1;
                }
                Ok((id, Err(e))) => {
                    error!(application = %id, error = %e, "rollout failed");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "rollout task failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            applications = report.applications,
            triggered = report.triggered,
            aborted = report.aborted,
            deferred = report.deferred,
            skipped = report.skipped,
            failed = report.failed,
            "rollout cycle complete"
        );
        Ok(report)
    }

    /// Evaluate and commit one application under its lock, then dispatch.
    async fn commit_application(
        &self,
        id: &str,
        versions: &VersionStatus,
        now: DateTime<Utc>,
        admission: &Admission,
    ) -> OrchestratorResult<DispatchOutcome> {
        let dispatch = self
            .store
            .lock_and_store(id, self.config.lock_timeout, |application| {
                let evaluation = self.trigger.evaluate(&application, versions, now);
                let mut actions = evaluation.actions;
                actions.to_trigger.retain(|action| admission.allows(id, action));
                Ok::<_, OrchestratorError>(self.trigger.commit(evaluation.application, &actions, now))
            })
            .await?;
        Ok(self.dispatch(id, dispatch).await)
    }

    async fn dispatch(&self, id: &str, dispatch: Dispatch) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for run in &dispatch.abort {
            match self.executor.abort(id, run).await {
                Ok(()) => outcome.aborted += 1,
                // The run's own report settles it either way.
                Err(e) => warn!(application = %id, %run, error = %e, "failed to abort run"),
            }
        }
        for run in &dispatch.deploy {
            match self.executor.deploy(id, run).await {
                Ok(()) => outcome.triggered += 1,
                Err(e) => {
                    warn!(application = %id, run = %run.id, error = %e, "dispatch failed, failing run");
                    outcome.failures += 1;
                    if let Err(e) = self.report_run(id, &run.id, RunStatus::Failed(FailureKind::Error)).await {
                        error!(application = %id, run = %run.id, error = %e, "failed to record dispatch failure");
                    }
                }
            }
        }
        outcome
    }

    // ── Operator commands ──────────────────────────────────────────

    /// Read-modify-write `id` under its lock, then wake the loop.
    async fn mutate<T, F>(&self, id: &str, mutator: F) -> OrchestratorResult<T>
    where
        F: FnOnce(&DeploymentTrigger, Application, &VersionStatus, DateTime<Utc>) -> TriggerResult<(Application, T)>,
    {
        let (versions, now) = (self.version_status(), self.now());
        let result = self
            .store
            .lock_and_store(id, self.config.lock_timeout, |application| {
                Ok::<_, OrchestratorError>(mutator(&self.trigger, application, &versions, now)?)
            })
            .await?;
        self.wake();
        Ok(result)
    }

    /// Register a revision of `id`, creating the application if `spec` is given
    /// and it doesn't exist yet.
    pub async fn submit(
        &self,
        id: &str,
        revision: ApplicationRevision,
        spec: Option<DeploymentSpec>,
    ) -> OrchestratorResult<()> {
        {
            let _lock = self.store.lock(id, self.config.lock_timeout).await?;
            let application = match self.store.get_application(id)? {
                Some(application) => application,
                None => {
                    let spec = spec.clone().ok_or_else(|| OrchestratorError::MissingSpec(id.to_string()))?;
                    info!(application = %id, "creating application");
                    Application::new(id, spec, self.now())
                }
            };
            let application = self.trigger.submit(application, revision, spec)?;
            self.store.put_application(&application)?;
        }
        self.wake();
        Ok(())
    }

    /// Record the outcome of a run reported by the executor.
    pub async fn report_run(&self, id: &str, run: &RunId, outcome: RunStatus) -> OrchestratorResult<()> {
        self.mutate(id, |trigger, application, versions, now| {
            Ok((trigger.notify_of_completion(application, run, outcome, now, versions)?, ()))
        })
        .await
    }

    pub async fn cancel_change(&self, id: &str, instance: &str, scope: CancelScope) -> OrchestratorResult<()> {
        self.mutate(id, |trigger, application, versions, now| {
            Ok((trigger.cancel_change(application, instance, scope, versions, now)?, ()))
        })
        .await
    }

    pub async fn force_change(&self, id: &str, instance: &str, change: &Change) -> OrchestratorResult<()> {
        self.mutate(id, |trigger, application, versions, now| {
            Ok((trigger.force_change(application, instance, change, versions, now)?, ()))
        })
        .await
    }

    pub async fn trigger_change(&self, id: &str, instance: &str, change: &Change) -> OrchestratorResult<()> {
        self.mutate(id, |trigger, application, versions, now| {
            Ok((trigger.trigger_change(application, instance, change, versions, now)?, ()))
        })
        .await
    }

    pub async fn pause_job(&self, id: &str, job: &JobId, until: DateTime<Utc>) -> OrchestratorResult<()> {
        self.mutate(id, |trigger, application, _, now| {
            Ok((trigger.pause_job(application, job, until, now)?, ()))
        })
        .await
    }

    pub async fn resume_job(&self, id: &str, job: &JobId) -> OrchestratorResult<()> {
        self.mutate(id, |trigger, application, _, _| Ok((trigger.resume_job(application, job)?, ())))
            .await
    }

    /// Trigger `job` now on behalf of `user`. Returns the started runs.
    pub async fn force_trigger(
        &self,
        id: &str,
        job: &JobId,
        user: &str,
        require_tests: bool,
    ) -> OrchestratorResult<Vec<RunId>> {
        let dispatch = self
            .mutate(id, |trigger, application, versions, now| {
                trigger.force_trigger(application, job, user, require_tests, versions, now)
            })
            .await?;
        let started = dispatch.deploy.iter().map(|run| run.id.clone()).collect();
        self.dispatch(id, dispatch).await;
        Ok(started)
    }

    /// Re-run `job` with the versions of its last run, aborting it first if
    /// it is still running.
    pub async fn re_trigger(&self, id: &str, job: &JobId) -> OrchestratorResult<()> {
        let dispatch = self
            .mutate(id, |trigger, application, _, now| trigger.re_trigger(application, job, now))
            .await?;
        self.dispatch(id, dispatch).await;
        Ok(())
    }

    /// Record outcomes from `completions` until `shutdown` changes or every
    /// sender is gone.
    pub async fn report_completions(
        &self,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                completion = completions.recv() => {
                    let Some(Completion { application, run, status }) = completion else {
                        break;
                    };
                    debug!(%application, %run, ?status, "run completed");
                    if let Err(e) = self.report_run(&application, &run, status).await {
                        warn!(%application, %run, error = %e, "failed to record run outcome");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("completion reporter stopped");
    }

    /// What the next cycle would do for `id`, without committing anything.
    pub fn evaluate(&self, id: &str) -> OrchestratorResult<Evaluation> {
        let application = self.store.load(id)?;
        Ok(self.trigger.evaluate(&application, &self.version_status(), self.now()))
    }
}

/// Keep `sender` up to date with the version status in `store`, polling
/// every `interval` until `shutdown` changes.
pub async fn refresh_version_status(
    store: StateStore,
    sender: watch::Sender<VersionStatus>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match store.get_version_status() {
                    Ok(Some(status)) => {
                        sender.send_if_modified(|current| {
                            if *current == status {
                                return false;
                            }
                            info!(system_version = %status.system_version, "version status changed");
                            *current = status;
                            true
                        });
                    }
                    Ok(None) => debug!("no version status stored yet"),
                    Err(e) => warn!(error = %e, "failed to read version status"),
                }
            }
            _ = shutdown.changed() => {
                debug!("version status refresher shutting down");
                break;
            }
        }
    }
}

