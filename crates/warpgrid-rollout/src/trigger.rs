//! Deployment trigger: turns rollout status into decisions.
//!
//! [`DeploymentTrigger::evaluate`] is a pure function of an application, the
//! system's version status and the current time. It settles each instance's
//! change, merges in new revisions and platform versions when the instance
//! is ready for them, and decides which jobs to trigger and which running
//! jobs to abort. [`DeploymentTrigger::commit`] then applies those
//! decisions, returning the runs that were started.
//!
//! Operator commands (cancel, pause, force and re-trigger, ...) are also
//! pure: they take an application and return the updated one. Persisting
//! it and dispatching started runs is the caller's business.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use warp_core::{
    ApplicationRevision, DeploymentSpec, InstanceName, InstanceSpec, JobId, JobType, RevisionId, RevisionPolicy, Step, Version,
};
use warpgrid_state::{
    Application, Change, Deployment, JobStatus, RetriggerEntry, Run, RunId, RunStatus, VersionStatus, Versions,
};

use crate::config::{TriggerConfig, after};
use crate::error::{TriggerError, TriggerResult};
use crate::policy::RolloutState;
use crate::status::{DeploymentStatus, Job, JobsToRun};
use crate::upgrade;

// ── Decisions ──────────────────────────────────────────────────────

/// A job run to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerAction {
    pub job: JobId,
    pub versions: Versions,
    /// When the job became ready to run these versions.
    pub ready_since: DateTime<Utc>,
    /// The job's last run was out of capacity.
    pub is_retry: bool,
    /// The instance is rolling out a new revision.
    pub is_revision_upgrade: bool,
    /// Operator who forced this run, if any.
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    /// The run's versions are no longer what the job should run.
    Outdated,
    /// The run targets a platform version marked broken.
    BrokenPlatform,
    /// The change the run was rolling out was cancelled.
    Cancelled,
    /// An operator asked for the job to run again.
    Retrigger,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outdated => write!(f, "outdated"),
            Self::BrokenPlatform => write!(f, "broken platform"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Retrigger => write!(f, "re-triggered"),
        }
    }
}

/// A running run to abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbortAction {
    pub run: RunId,
    pub reason: AbortReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Actions {
    pub to_trigger: Vec<TriggerAction>,
    pub to_abort: Vec<AbortAction>,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.to_trigger.is_empty() && self.to_abort.is_empty()
    }
}

/// Result of evaluating one application.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    /// The application with settled and newly merged changes.
    pub application: Application,
    pub actions: Actions,
    /// Changes waiting for an instance to become ready for them.
    pub outstanding: BTreeMap<InstanceName, Change>,
    pub states: BTreeMap<InstanceName, RolloutState>,
}

/// What a commit asks the job executor to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub deploy: Vec<Run>,
    pub abort: Vec<RunId>,
}

impl Dispatch {
    pub fn is_empty(&self) -> bool {
        self.deploy.is_empty() && self.abort.is_empty()
    }
}

/// What part of an instance's change to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelScope {
    /// The whole change.
    All,
    Platform,
    Revision,
    /// Only the pin, letting the change proceed normally.
    Pin,
    /// Both axes, but keep the instance pinned where it is.
    Versions,
}

impl fmt::Display for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Platform => "platform",
            Self::Revision => "revision",
            Self::Pin => "pin",
            Self::Versions => "versions",
        };
        f.write_str(name)
    }
}

impl FromStr for CancelScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "platform" => Ok(Self::Platform),
            "revision" => Ok(Self::Revision),
            "pin" => Ok(Self::Pin),
            "versions" => Ok(Self::Versions),
            other => Err(format!("unknown cancel scope: {other}")),
        }
    }
}

// ── Trigger ────────────────────────────────────────────────────────

/// The rollout decision engine.
#[derive(Debug, Clone, Default)]
pub struct DeploymentTrigger {
    config: TriggerConfig,
}

impl DeploymentTrigger {
    pub fn new(config: TriggerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Rollout status of `application` at `now`.
    pub fn status<'a>(
        &'a self,
        application: &'a Application,
        versions: &'a VersionStatus,
        now: DateTime<Utc>,
    ) -> DeploymentStatus<'a> {
        DeploymentStatus::new(application, &versions.system_version, now, &self.config)
    }

    /// Decide what to do for `application` at `now`.
    pub fn evaluate(&self, application: &Application, versions: &VersionStatus, now: DateTime<Utc>) -> Evaluation {
        let mut app = application.clone();
        let mut outstanding = BTreeMap::new();
        for name in application.spec.instance_names() {
            let Some(current) = app.instance(&name).map(|i| i.change.clone()) else {
                continue;
            };
            app = self.settle(app, &name, &current, versions, now);
            app = self.advance_revision(app, &name, versions, now, &mut outstanding);
            app = self.advance_platform(app, &name, versions, now, &mut outstanding);
        }

        let actions = {
            let status = self.status(&app, versions, now);
            self.actions(&status, versions)
        };
        let states = app
            .spec
            .instance_names()
            .into_iter()
            .filter_map(|name| {
                let instance = app.instance(&name)?;
                let state = RolloutState::of(&instance.change, instance.deployments.values());
                Some((name, state))
            })
            .collect();
        debug!(
            application = %app.id,
            triggers = actions.to_trigger.len(),
            aborts = actions.to_abort.len(),
            outstanding = outstanding.len(),
            "evaluated application"
        );
        Evaluation {
            application: app,
            actions,
            outstanding,
            states,
        }
    }

    /// Set `change` on `instance`, minus what is already rolled out.
    fn settle(
        &self,
        app: Application,
        instance: &str,
        change: &Change,
        versions: &VersionStatus,
        now: DateTime<Utc>,
    ) -> Application {
        let updated = self.status(&app, versions, now).with_remaining_change(instance, change);
        let Some(updated) = updated else {
            return app;
        };
        if let Some(previous) = app.instance(instance).map(|i| &i.change) {
            if *previous != updated.change {
                info!(
                    application = %app.id,
                    instance,
                    from = %previous,
                    to = %updated.change,
                    "instance change updated"
                );
            }
        }
        app.with_instance(updated)
    }

    fn advance_revision(
        &self,
        app: Application,
        name: &str,
        versions: &VersionStatus,
        now: DateTime<Utc>,
        outstanding: &mut BTreeMap<InstanceName, Change>,
    ) -> Application {
        let accepted = {
            let status = self.status(&app, versions, now);
            let change = status.outstanding_change(name);
            match change.revision() {
                None => None,
                Some(revision) => {
                    let ready = status.instance_ready_at(name, &change).is_some_and(|at| at <= now);
                    if ready && accepts_revision(&status, name, revision) {
                        Some(revision)
                    } else {
                        debug!(application = %app.id, instance = name, %revision, "revision outstanding");
                        outstanding.insert(name.to_string(), change);
                        None
                    }
                }
            }
        };
        let (Some(revision), Some(current)) = (accepted, app.instance(name).map(|i| i.change.clone())) else {
            return app;
        };
        info!(application = %app.id, instance = name, %revision, "rolling out new revision");
        self.settle(app, name, &current.with_revision(revision), versions, now)
    }

    fn advance_platform(
        &self,
        app: Application,
        name: &str,
        versions: &VersionStatus,
        now: DateTime<Utc>,
        outstanding: &mut BTreeMap<InstanceName, Change>,
    ) -> Application {
        let (Some(instance), Some(spec)) = (app.instance(name), app.spec.instance(name)) else {
            return app;
        };
        if instance.change.is_pinned() {
            return app;
        }
        let change = instance.change.clone();
        let upgrades_some = |target: &Version| instance.deployments.values().any(|d| d.platform < *target);

        if let Some(broken) = change.platform().filter(|p| versions.is_broken(p)).cloned() {
            let next = match upgrade::fallback_below(versions, &broken).filter(|v| upgrades_some(v)) {
                Some(fallback) => {
                    warn!(application = %app.id, instance = name, %broken, %fallback, "platform is broken, falling back");
                    change.with_platform(fallback)
                }
                None => {
                    warn!(application = %app.id, instance = name, %broken, "platform is broken, dropping upgrade");
                    change.without_platform()
                }
            };
            return self.settle(app, name, &next, versions, now);
        }

        let Some(target) = upgrade::target_platform(versions, spec.upgrade_policy) else {
            return app;
        };
        if !upgrades_some(&target) || change.platform().is_some_and(|current| *current >= target) {
            return app;
        }
        if instance.cancelled_platform.as_ref().is_some_and(|cancelled| target <= *cancelled) {
            debug!(application = %app.id, instance = name, platform = %target, "platform was cancelled");
            return app;
        }
        let platform = Change::of_platform(target.clone());
        let ready = self
            .status(&app, versions, now)
            .instance_ready_at(name, &platform)
            .is_some_and(|at| at <= now);
        if ready {
            info!(application = %app.id, instance = name, platform = %target, "upgrading platform");
            let next = change.with(&platform);
            self.settle(app, name, &next, versions, now)
        } else {
            debug!(application = %app.id, instance = name, platform = %target, "platform upgrade outstanding");
            let held = outstanding.remove(name).unwrap_or_default().with(&platform);
            outstanding.insert(name.to_string(), held);
            app
        }
    }

    // ── Actions ────────────────────────────────────────────────────

    fn actions(&self, status: &DeploymentStatus<'_>, versions: &VersionStatus) -> Actions {
        let now = status.now();
        let jobs = status.jobs_to_run();
        let mut actions = Actions::default();
        let mut aborts = BTreeMap::new();

        let retriggered = self.retriggers(status, &mut actions);
        for (job, planned) in jobs.iter() {
            let Some(next) = planned.first() else {
                continue;
            };
            let Some(ready_since) = next.ready_at.filter(|at| *at <= now) else {
                continue;
            };
            if retriggered.contains(job) {
                continue;
            }
            abort_if_outdated(status, &jobs, job, &mut aborts);
            let mut blocked = status.job(job).is_some_and(JobStatus::is_running);
            if let (true, Some(region)) = (job.job_type.is_production() && job.job_type.is_deployment(), job.job_type.region()) {
                // Verification of the zone must not run against other versions.
                let test = JobId::new(&job.instance, JobType::test(region));
                if status.is_declared(&test) {
                    abort_if_outdated(status, &jobs, &test, &mut aborts);
                    blocked |= jobs
                        .get(&test)
                        .and_then(<[Job]>::first)
                        .is_some_and(|verification| !verification.versions.targets_match(&next.versions));
                }
            }
            if blocked {
                continue;
            }
            if let Err(refusal) = check_downgrade(status.application(), job, &next.versions) {
                warn!(application = %status.application().id, %job, "{refusal}");
                continue;
            }
            actions
                .to_trigger
                .push(trigger_action(status, job, next.versions.clone(), ready_since, None));
        }

        abort_obsolete(status, &jobs, versions, &mut aborts);
        actions.to_abort = aborts
            .into_iter()
            .map(|(run, reason)| AbortAction { run, reason })
            .collect();
        actions
    }

    /// Trigger queued re-runs whose previous run has ended.
    fn retriggers(&self, status: &DeploymentStatus<'_>, actions: &mut Actions) -> HashSet<JobId> {
        let mut retriggered = HashSet::new();
        for entry in &status.application().retrigger_queue {
            let Some(job) = status.job(&entry.job) else {
                continue;
            };
            if job.is_running() || job.next_run_number() > entry.required_run {
                continue;
            }
            let Some(last) = job.last_triggered() else {
                continue;
            };
            if let Err(refusal) = check_downgrade(status.application(), &entry.job, &last.versions) {
                warn!(application = %status.application().id, job = %entry.job, "{refusal}");
                continue;
            }
            actions.to_trigger.push(trigger_action(
                status,
                &entry.job,
                last.versions.clone(),
                status.now(),
                None,
            ));
            retriggered.insert(entry.job.clone());
        }
        retriggered
    }

    /// Apply `actions` to `application`: mark aborted runs and start new
    /// ones. Triggers for jobs that are already running are skipped.
    pub fn commit(&self, application: Application, actions: &Actions, now: DateTime<Utc>) -> (Application, Dispatch) {
        let mut app = application;
        let mut dispatch = Dispatch::default();
        for abort in &actions.to_abort {
            let running = app
                .instance(&abort.run.job.instance)
                .and_then(|i| i.job(&abort.run.job.job_type))
                .and_then(|job| job.run(abort.run.number))
                .is_some_and(Run::is_running);
            if !running {
                debug!(run = %abort.run, "run already ended, not aborting");
                continue;
            }
            info!(application = %app.id, run = %abort.run, reason = %abort.reason, "aborting run");
            let number = abort.run.number;
            app = update_job(app, &abort.run.job, |job| job.with_abort_requested(number));
            dispatch.abort.push(abort.run.clone());
        }

        for trigger in &actions.to_trigger {
            let Some(instance) = app.instance(&trigger.job.instance) else {
                warn!(application = %app.id, job = %trigger.job, "unknown instance, not triggering");
                continue;
            };
            let job = instance.job_status(&trigger.job.job_type);
            if job.is_running() {
                debug!(application = %app.id, job = %trigger.job, "already running, not triggering");
                continue;
            }
            let mut run = Run::start(
                RunId::new(trigger.job.clone(), job.next_run_number()),
                trigger.versions.clone(),
                now,
            );
            run.triggered_by = trigger.triggered_by.clone();
            info!(
                application = %app.id,
                run = %run.id,
                versions = %run.versions,
                retry = trigger.is_retry,
                "triggering run"
            );
            let updated = instance.clone().with_job(job.with_run(run.clone()).with_pause(None));
            app = app.with_instance(updated);
            dispatch.deploy.push(run);
        }

        let queue = app
            .retrigger_queue
            .iter()
            .filter(|entry| {
                app.instance(&entry.job.instance)
                    .is_some_and(|i| i.job_status(&entry.job.job_type).next_run_number() <= entry.required_run)
            })
            .cloned()
            .collect();
        (app.with_retrigger_queue(queue), dispatch)
    }

    // ── Operator commands ──────────────────────────────────────────

    /// Register a new revision, and optionally a new deployment spec with it.
    pub fn submit(
        &self,
        application: Application,
        revision: ApplicationRevision,
        spec: Option<DeploymentSpec>,
    ) -> TriggerResult<Application> {
        if let Some(latest) = application.latest_revision() {
            if revision.id <= latest.id {
                return Err(TriggerError::StaleRevision {
                    build: revision.id.build,
                    latest: latest.id.build,
                });
            }
        }
        info!(application = %application.id, revision = %revision.id, "revision submitted");
        let application = match spec {
            Some(spec) => application.with_spec(spec),
            None => application,
        };
        Ok(application.with_revision(revision))
    }

    /// Record the outcome of a run. Outcomes for runs that already ended
    /// are ignored.
    pub fn notify_of_completion(
        &self,
        application: Application,
        run: &RunId,
        outcome: RunStatus,
        at: DateTime<Utc>,
        versions: &VersionStatus,
    ) -> TriggerResult<Application> {
        let unknown = || TriggerError::UnknownRun(run.to_string());
        let instance = application
            .instance(&run.job.instance)
            .ok_or_else(|| TriggerError::UnknownInstance(run.job.instance.clone()))?;
        let job = instance.job(&run.job.job_type).ok_or_else(unknown)?;
        let existing = job.run(run.number).ok_or_else(unknown)?;
        if existing.has_ended() || !outcome.is_terminal() {
            debug!(application = %application.id, %run, "run already ended, ignoring report");
            return Ok(application);
        }
        let target = existing.versions.clone();
        let finished = job.clone().with_run_finished(run.number, outcome, at).ok_or_else(unknown)?;
        let mut updated = instance.clone().with_job(finished);
        match outcome {
            RunStatus::Success => {
                info!(application = %application.id, %run, versions = %target, "run succeeded");
                if let JobType::Production(region) = &run.job.job_type {
                    updated = updated.with_deployment(Deployment {
                        region: region.clone(),
                        platform: target.target_platform,
                        revision: target.target_revision,
                        at,
                    });
                }
            }
            other => warn!(application = %application.id, %run, outcome = ?other, "run did not succeed"),
        }
        let change = updated.change.clone();
        let application = application.with_instance(updated);
        if application.spec.instance(&run.job.instance).is_none() {
            return Ok(application);
        }
        Ok(self.settle(application, &run.job.instance, &change, versions, at))
    }

    /// Cancel the `scope` part of an instance's change. Cancelled targets
    /// are not proposed again until a newer platform or revision appears.
    pub fn cancel_change(
        &self,
        application: Application,
        instance: &str,
        scope: CancelScope,
        versions: &VersionStatus,
        now: DateTime<Utc>,
    ) -> TriggerResult<Application> {
        let current = require_instance(&application, instance)?.clone();
        let (change, cancelled) = match scope {
            CancelScope::All => (Change::empty(), current.change.clone()),
            CancelScope::Versions => (Change::empty().with_pin(), current.change.clone()),
            CancelScope::Platform => (current.change.without_platform(), current.change.without_revision()),
            CancelScope::Revision => (current.change.without_revision(), current.change.without_platform()),
            CancelScope::Pin => (current.change.without_pin(), Change::empty()),
        };
        info!(application = %application.id, instance, %scope, cancelled = %cancelled, "cancelling change");
        let application = application.with_instance(current.with_cancelled(&cancelled));
        Ok(self.settle(application, instance, &change, versions, now))
    }

    /// Put `change` on top of an instance's current change.
    pub fn force_change(
        &self,
        application: Application,
        instance: &str,
        change: &Change,
        versions: &VersionStatus,
        now: DateTime<Utc>,
    ) -> TriggerResult<Application> {
        let current = require_instance(&application, instance)?.clone();
        let next = change.on_top_of(&current.change);
        info!(application = %application.id, instance, change = %next, "forcing change");
        let application = application.with_instance(current.without_cancelled(change));
        Ok(self.settle(application, instance, &next, versions, now))
    }

    /// Start `change` on an instance, unless it is already rolling something out.
    pub fn trigger_change(
        &self,
        application: Application,
        instance: &str,
        change: &Change,
        versions: &VersionStatus,
        now: DateTime<Utc>,
    ) -> TriggerResult<Application> {
        if require_instance(&application, instance)?.change.has_targets() {
            debug!(application = %application.id, instance, "change in progress, not triggering another");
            return Ok(application);
        }
        self.force_change(application, instance, change, versions, now)
    }

    pub fn pause_job(
        &self,
        application: Application,
        job: &JobId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TriggerResult<Application> {
        require_job(&application, job)?;
        if until > after(now, self.config.max_pause) {
            return Err(TriggerError::PauseTooLong {
                max_hours: i64::try_from(self.config.max_pause.as_secs() / 3600).unwrap_or(i64::MAX),
            });
        }
        info!(application = %application.id, %job, %until, "pausing job");
        Ok(update_job(application, job, |status| status.with_pause(Some(until))))
    }

    pub fn resume_job(&self, application: Application, job: &JobId) -> TriggerResult<Application> {
        require_job(&application, job)?;
        info!(application = %application.id, %job, "resuming job");
        Ok(update_job(application, job, |status| status.with_pause(None)))
    }

    /// Trigger `job` now, with the versions of its instance's change.
    ///
    /// With `require_tests`, the system and staging tests those versions
    /// still need are triggered instead, if there are any.
    pub fn force_trigger(
        &self,
        application: Application,
        job: &JobId,
        user: &str,
        require_tests: bool,
        versions: &VersionStatus,
        now: DateTime<Utc>,
    ) -> TriggerResult<(Application, Dispatch)> {
        require_job(&application, job)?;
        let actions = {
            let status = self.status(&application, versions, now);
            let change = status
                .instance(&job.instance)
                .map(|i| i.change.clone())
                .unwrap_or_default();
            let planned = Job {
                versions: status.versions_for(&change, status.deployment_for(job)),
                ready_at: Some(now),
                change,
            };
            let requested = JobsToRun::single(job.clone(), planned);
            let tests = if require_tests {
                status.test_jobs(&requested)
            } else {
                JobsToRun::default()
            };
            let selected = if tests.is_empty() { requested } else { tests };

            let mut actions = Actions::default();
            for (id, planned) in selected.iter() {
                let Some(next) = planned.first() else {
                    continue;
                };
                if status.job(id).is_some_and(JobStatus::is_running) {
                    if id == job {
                        return Err(TriggerError::AlreadyRunning(job.to_string()));
                    }
                    continue;
                }
                check_downgrade(&application, id, &next.versions)?;
                actions.to_trigger.push(trigger_action(
                    &status,
                    id,
                    next.versions.clone(),
                    now,
                    Some(user.to_string()),
                ));
            }
            actions
        };
        info!(application = %application.id, %job, user, require_tests, "forcing trigger");
        Ok(self.commit(application, &actions, now))
    }

    /// Run `job` again with the versions of its last run. A running job is
    /// aborted first, and re-run once the abort completes.
    pub fn re_trigger(
        &self,
        application: Application,
        job: &JobId,
        now: DateTime<Utc>,
    ) -> TriggerResult<(Application, Dispatch)> {
        require_job(&application, job)?;
        let last = application
            .instance(&job.instance)
            .and_then(|i| i.job(&job.job_type))
            .and_then(JobStatus::last_triggered)
            .cloned()
            .ok_or_else(|| TriggerError::NeverTriggered(job.to_string()))?;
        check_downgrade(&application, job, &last.versions)?;

        if last.is_running() {
            let required_run = last.id.number + 1;
            let mut queue = application.retrigger_queue.clone();
            queue.retain(|entry| entry.job != *job || entry.required_run >= required_run);
            if !queue.iter().any(|entry| entry.job == *job) {
                queue.push(RetriggerEntry {
                    job: job.clone(),
                    required_run,
                });
            }
            info!(application = %application.id, run = %last.id, "queueing re-trigger after abort");
            let actions = Actions {
                to_trigger: Vec::new(),
                to_abort: vec![AbortAction {
                    run: last.id,
                    reason: AbortReason::Retrigger,
                }],
            };
            return Ok(self.commit(application.with_retrigger_queue(queue), &actions, now));
        }

        info!(application = %application.id, %job, versions = %last.versions, "re-triggering job");
        let actions = Actions {
            to_trigger: vec![TriggerAction {
                job: job.clone(),
                is_retry: false,
                is_revision_upgrade: false,
                versions: last.versions,
                ready_since: now,
                triggered_by: None,
            }],
            to_abort: Vec::new(),
        };
        Ok(self.commit(application, &actions, now))
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// New revisions are accepted when the instance is idle on revisions, or
/// always rolls out the latest, or has jobs failing on older revisions.
fn accepts_revision(status: &DeploymentStatus<'_>, instance: &str, revision: RevisionId) -> bool {
    let (Some(current), Some(spec)) = (
        status.instance(instance),
        status.application().spec.instance(instance),
    ) else {
        return false;
    };
    if status.has_failures(revision) {
        return true;
    }
    current.change.revision().is_none() || spec.revision_policy == RevisionPolicy::Latest
}

fn abort_if_outdated(
    status: &DeploymentStatus<'_>,
    jobs: &JobsToRun,
    job: &JobId,
    aborts: &mut BTreeMap<RunId, AbortReason>,
) {
    let Some(last) = status
        .job(job)
        .and_then(JobStatus::last_triggered)
        .filter(|run| run.is_running() && !run.abort_requested)
    else {
        return;
    };
    let planned = jobs.get(job).unwrap_or_default();
    let wanted = planned.iter().any(|next| {
        next.versions.targets_match(&last.versions) && next.versions.sources_match_if_present(&last.versions)
    });
    if !wanted {
        aborts.entry(last.id.clone()).or_insert(AbortReason::Outdated);
    }
}

/// Abort runs on broken platforms, and production runs of changes that
/// were cancelled.
fn abort_obsolete(
    status: &DeploymentStatus<'_>,
    jobs: &JobsToRun,
    versions: &VersionStatus,
    aborts: &mut BTreeMap<RunId, AbortReason>,
) {
    let app = status.application();
    for job in status.all_jobs() {
        let Some(run) = job
            .last_triggered()
            .filter(|run| run.is_running() && !run.abort_requested)
        else {
            continue;
        };
        let Some(instance) = status.instance(&job.id.instance) else {
            continue;
        };
        let change = &instance.change;
        let platform = &run.versions.target_platform;
        let revision = run.versions.target_revision;
        let zone = status.deployment_for(&job.id);

        // Unless something already runs the broken version, nothing will
        // plan it again.
        let deployed = match job.id.job_type.region() {
            Some(_) => zone.is_some_and(|d| d.platform == *platform),
            None => app
                .instances
                .values()
                .flat_map(|i| i.deployments.values())
                .any(|d| d.platform == *platform),
        };
        let pinned_to = change.is_pinned() && change.platform() == Some(platform);
        if versions.is_broken(platform) && !pinned_to && !deployed {
            aborts.entry(run.id.clone()).or_insert(AbortReason::BrokenPlatform);
            continue;
        }

        if job.id.job_type.is_production() && !jobs.contains(&job.id) {
            let platform_wanted = change.platform() == Some(platform) || zone.is_none_or(|d| d.platform == *platform);
            let revision_wanted = change.revision() == Some(revision) || zone.is_none_or(|d| d.revision == revision);
            if !(platform_wanted && revision_wanted) {
                aborts.entry(run.id.clone()).or_insert(AbortReason::Cancelled);
            }
        }
    }
}

fn trigger_action(
    status: &DeploymentStatus<'_>,
    job: &JobId,
    versions: Versions,
    ready_since: DateTime<Utc>,
    triggered_by: Option<String>,
) -> TriggerAction {
    TriggerAction {
        job: job.clone(),
        versions,
        ready_since,
        is_retry: status.job(job).is_some_and(JobStatus::is_out_of_capacity),
        is_revision_upgrade: status
            .instance(&job.instance)
            .is_some_and(|i| i.change.revision().is_some()),
        triggered_by,
    }
}

/// Refuse versions older than what the job's zone runs, unless the
/// instance is pinned.
fn check_downgrade(application: &Application, job: &JobId, versions: &Versions) -> TriggerResult<()> {
    let Some(instance) = application.instance(&job.instance) else {
        return Ok(());
    };
    let downgrades = job
        .job_type
        .region()
        .and_then(|region| instance.deployment(region))
        .is_some_and(|deployment| versions.downgrades(deployment));
    if downgrades && !instance.change.is_pinned() {
        return Err(TriggerError::Downgrade {
            job: job.to_string(),
            versions: versions.to_string(),
        });
    }
    Ok(())
}

fn require_instance<'a>(application: &'a Application, instance: &str) -> TriggerResult<&'a warpgrid_state::Instance> {
    application
        .spec
        .instance(instance)
        .and_then(|_| application.instance(instance))
        .ok_or_else(|| TriggerError::UnknownInstance(instance.to_string()))
}

fn require_job(application: &Application, job: &JobId) -> TriggerResult<()> {
    let spec = application
        .spec
        .instance(&job.instance)
        .ok_or_else(|| TriggerError::UnknownInstance(job.instance.clone()))?;
    if declares(spec, &job.job_type) {
        Ok(())
    } else {
        Err(TriggerError::UnknownJob(job.to_string()))
    }
}

fn declares(spec: &InstanceSpec, job_type: &JobType) -> bool {
    let mut found = matches!(job_type, JobType::SystemTest | JobType::StagingTest);
    for step in &spec.steps {
        step.visit(&mut |s| {
            found |= match (s, job_type) {
                (Step::Region { region, .. }, JobType::Production(job_region)) => region == job_region,
                (Step::Test { region }, JobType::Test(job_region)) => region == job_region,
                _ => false,
            };
        });
    }
    found
}

fn update_job(application: Application, job: &JobId, update: impl FnOnce(JobStatus) -> JobStatus) -> Application {
    let Some(instance) = application.instance(&job.instance) else {
        return application;
    };
    let updated = instance.clone().with_job(update(instance.job_status(&job.job_type)));
    application.with_instance(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_scope_parses_its_display_form() {
        for scope in [
            CancelScope::All,
            CancelScope::Platform,
            CancelScope::Revision,
            CancelScope::Pin,
            CancelScope::Versions,
        ] {
            assert_eq!(scope.to_string().parse::<CancelScope>(), Ok(scope));
        }
        assert!("everything".parse::<CancelScope>().unwrap_err().contains("everything"));
    }

    #[test]
    fn abort_reasons_read_as_prose() {
        assert_eq!(AbortReason::BrokenPlatform.to_string(), "broken platform");
        assert_eq!(AbortReason::Retrigger.to_string(), "re-triggered");
    }

    #[test]
    fn empty_actions_dispatch_nothing() {
        assert!(Actions::default().is_empty());
        assert!(Dispatch::default().is_empty());
    }
}
