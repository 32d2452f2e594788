//! Deployment status: the topology evaluator.
//!
//! [`DeploymentStatus`] is a read-only view over one application, computed
//! fresh for every evaluation. It flattens the deployment spec tree into an
//! arena of steps, each knowing the steps it depends on:
//!
//! - **instance** steps gate every job of an instance on the instance before
//!   it, and on the instance's change blockers
//! - **delay** steps complete a fixed time after they became ready
//! - **test zone** steps are the system and staging tests; every instance
//!   gets implicit ones, which declared tests replace
//! - **production test** steps verify a production zone after deployment
//! - **deployment** steps roll a change out to a production zone
//!
//! For any candidate [`Change`], a step knows when it completed and when it
//! became ready. From that the status derives which jobs must run, and with
//! which versions, for the changes of all instances to complete.

use std::collections::HashSet;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use warp_core::{InstanceName, InstanceSpec, JobId, JobType, RevisionId, RolloutPolicy, Step, Version};
use warpgrid_state::{Application, Change, Deployment, Instance, JobStatus, Run, Versions};

use crate::config::{TriggerConfig, after};
use crate::policy;

/// Index of a step in the arena of a [`DeploymentStatus`].
pub type StepId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Instance,
    Delay(std::time::Duration),
    /// A system or staging test.
    TestZone,
    /// Verification of a production zone.
    ProductionTest,
    /// Deployment to a production zone.
    Deployment,
}

/// One node of the flattened step graph.
#[derive(Debug, Clone)]
pub struct StepStatus {
    pub kind: StepKind,
    /// Top-level delays between instances belong to no instance.
    pub instance: Option<InstanceName>,
    pub job: Option<JobId>,
    /// Steps that must complete before this one may start.
    pub dependencies: Vec<StepId>,
    /// False for the implicit test steps of an instance.
    pub declared: bool,
}

/// A run a job should make, and when it may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub versions: Versions,
    /// `None` while the job's dependencies have not completed.
    pub ready_at: Option<DateTime<Utc>>,
    /// The (partial) change this run rolls out.
    pub change: Change,
}

/// Jobs that must run, each with its planned runs in order.
///
/// Iteration follows insertion order, which is step order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobsToRun {
    entries: Vec<(JobId, Vec<Job>)>,
}

impl JobsToRun {
    pub fn single(job: JobId, planned: Job) -> Self {
        Self {
            entries: vec![(job, vec![planned])],
        }
    }

    pub fn get(&self, job: &JobId) -> Option<&[Job]> {
        self.entries
            .iter()
            .find(|(id, _)| id == job)
            .map(|(_, jobs)| jobs.as_slice())
    }

    pub fn contains(&self, job: &JobId) -> bool {
        self.get(job).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobId, &[Job])> {
        self.entries.iter().map(|(id, jobs)| (id, jobs.as_slice()))
    }

    /// Set the planned runs of `job`, replacing any already there.
    fn insert(&mut self, job: JobId, jobs: Vec<Job>) {
        match self.entries.iter_mut().find(|(id, _)| *id == job) {
            Some(entry) => entry.1 = jobs,
            None => self.entries.push((job, jobs)),
        }
    }

    /// Add planned runs to `job`, skipping duplicates.
    fn merge(&mut self, job: JobId, jobs: Vec<Job>) {
        match self.entries.iter_mut().find(|(id, _)| *id == job) {
            Some((_, existing)) => {
                for planned in jobs {
                    if !existing.contains(&planned) {
                        existing.push(planned);
                    }
                }
            }
            None => self.entries.push((job, jobs)),
        }
    }
}

impl IntoIterator for JobsToRun {
    type Item = (JobId, Vec<Job>);
    type IntoIter = std::vec::IntoIter<(JobId, Vec<Job>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Computed rollout status of one application at one instant.
pub struct DeploymentStatus<'a> {
    application: &'a Application,
    system_version: &'a Version,
    now: DateTime<Utc>,
    config: &'a TriggerConfig,
    steps: Vec<StepStatus>,
    /// Live steps in declaration order; replaced implicit tests are dropped.
    all_steps: Vec<StepId>,
    /// Job steps in declaration order.
    job_steps: Vec<(JobId, StepId)>,
}

impl<'a> DeploymentStatus<'a> {
    pub fn new(
        application: &'a Application,
        system_version: &'a Version,
        now: DateTime<Utc>,
        config: &'a TriggerConfig,
    ) -> Self {
        let mut status = Self {
            application,
            system_version,
            now,
            config,
            steps: Vec::new(),
            all_steps: Vec::new(),
            job_steps: Vec::new(),
        };
        let mut previous = Vec::new();
        for step in application.spec.steps() {
            previous = status.fill_step(step, previous, None);
        }
        status
    }

    // ── Graph construction ─────────────────────────────────────────

    /// Add the steps contained in `step`, depending on `previous`, and
    /// return what later steps depend on.
    fn fill_step(&mut self, step: &'a Step, previous: Vec<StepId>, instance: Option<&'a str>) -> Vec<StepId> {
        match step {
            Step::Instance(spec) => {
                let id = self.push(StepKind::Instance, Some(&spec.name), None, previous, true);
                for test in [JobType::SystemTest, JobType::StagingTest] {
                    let job = JobId::new(&spec.name, test);
                    if self.step_of(&job).is_none() {
                        let test = self.push(StepKind::TestZone, Some(&spec.name), Some(job.clone()), Vec::new(), false);
                        self.job_steps.push((job, test));
                    }
                }
                spec.steps
                    .iter()
                    .fold(vec![id], |previous, nested| self.fill_step(nested, previous, Some(&spec.name)))
            }
            Step::Steps(steps) => steps
                .iter()
                .fold(previous, |previous, nested| self.fill_step(nested, previous, instance)),
            Step::Parallel(steps) => {
                let mut parallel = Vec::new();
                for nested in steps {
                    parallel.extend(self.fill_step(nested, previous.clone(), instance));
                }
                if parallel.is_empty() { previous } else { parallel }
            }
            Step::Delay(delay) if delay.is_zero() => previous,
            Step::Delay(delay) => vec![self.push(StepKind::Delay(*delay), instance, None, previous, true)],
            // Tests and regions outside instances are rejected by the spec parser.
            _ => {
                let Some(instance) = instance else {
                    return previous;
                };
                match step {
                    Step::SystemTest | Step::StagingTest => {
                        let job_type = match step {
                            Step::SystemTest => JobType::SystemTest,
                            _ => JobType::StagingTest,
                        };
                        let job = JobId::new(instance, job_type);
                        let id = self.push(StepKind::TestZone, Some(instance), Some(job.clone()), Vec::new(), true);
                        self.register(job, id);
                        let mut previous = previous;
                        previous.push(id);
                        previous
                    }
                    Step::Test { region } => {
                        let job = JobId::new(instance, JobType::test(region));
                        let id = self.push(StepKind::ProductionTest, Some(instance), Some(job.clone()), previous, true);
                        self.register(job, id);
                        vec![id]
                    }
                    Step::Region { region, .. } => {
                        let job = JobId::new(instance, JobType::production(region));
                        let id = self.push(StepKind::Deployment, Some(instance), Some(job.clone()), previous, true);
                        self.register(job, id);
                        vec![id]
                    }
                    _ => previous,
                }
            }
        }
    }

    fn push(
        &mut self,
        kind: StepKind,
        instance: Option<&str>,
        job: Option<JobId>,
        dependencies: Vec<StepId>,
        declared: bool,
    ) -> StepId {
        let id = self.steps.len();
        self.steps.push(StepStatus {
            kind,
            instance: instance.map(str::to_string),
            job,
            dependencies,
            declared,
        });
        self.all_steps.push(id);
        id
    }

    /// Make `id` the step of `job`; a declared test replaces the implicit
    /// one in place.
    fn register(&mut self, job: JobId, id: StepId) {
        match self.job_steps.iter_mut().find(|(existing, _)| *existing == job) {
            Some(entry) => {
                let replaced = entry.1;
                entry.1 = id;
                self.all_steps.retain(|step| *step != replaced);
            }
            None => self.job_steps.push((job, id)),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn application(&self) -> &'a Application {
        self.application
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn step(&self, id: StepId) -> &StepStatus {
        &self.steps[id]
    }

    /// All job steps, in declaration order.
    pub fn job_steps(&self) -> impl Iterator<Item = (&JobId, StepId)> {
        self.job_steps.iter().map(|(job, id)| (job, *id))
    }

    pub fn step_of(&self, job: &JobId) -> Option<StepId> {
        self.job_steps
            .iter()
            .find(|(existing, _)| existing == job)
            .map(|(_, id)| *id)
    }

    pub fn instance_step(&self, instance: &str) -> Option<StepId> {
        self.all_steps.iter().copied().find(|id| {
            let step = &self.steps[*id];
            step.kind == StepKind::Instance && step.instance.as_deref() == Some(instance)
        })
    }

    pub fn is_declared(&self, job: &JobId) -> bool {
        self.step_of(job).is_some_and(|id| self.steps[id].declared)
    }

    pub fn instance(&self, name: &str) -> Option<&'a Instance> {
        self.application.instances.get(name)
    }

    fn spec(&self, instance: &str) -> Option<&'a InstanceSpec> {
        self.application.spec.instance(instance)
    }

    fn rollout(&self, instance: &str) -> RolloutPolicy {
        self.spec(instance).map(|spec| spec.rollout).unwrap_or_default()
    }

    pub fn job(&self, job: &JobId) -> Option<&'a JobStatus> {
        self.instance(&job.instance)?.job(&job.job_type)
    }

    /// Job statuses of all instances in the deployment spec.
    pub fn all_jobs(&self) -> impl Iterator<Item = &'a JobStatus> + '_ {
        let application = self.application;
        application
            .instances
            .values()
            .filter(move |instance| application.spec.instance(&instance.name).is_some())
            .flat_map(|instance| instance.jobs.values())
    }

    /// What is live in the zone of `job`, if it has one.
    pub fn deployment_for(&self, job: &JobId) -> Option<&'a Deployment> {
        self.instance(&job.instance)?.deployment(job.job_type.region()?)
    }

    /// Versions to roll out `change` to a zone holding `deployment`.
    pub fn versions_for(&self, change: &Change, deployment: Option<&Deployment>) -> Versions {
        Versions::for_change(change, self.application, deployment, self.system_version)
    }

    // ── Completion and readiness ───────────────────────────────────

    /// When `id` completed for `change`, if it has.
    ///
    /// `dependent` is the job asking. A job asking about its own step
    /// signals the strict criterion: it must itself have run the change.
    pub fn completed_at(&self, id: StepId, change: &Change, dependent: Option<&JobId>) -> Option<DateTime<Utc>> {
        let step = &self.steps[id];
        match (&step.kind, &step.job) {
            (StepKind::Instance, _) => self.instance_completed_at(id, change, dependent),
            (StepKind::Delay(delay), _) => self.ready_at(id, change, dependent).map(|ready| after(ready, *delay)),
            (StepKind::TestZone, Some(job)) => self.test_completed_at(job, change, dependent),
            (StepKind::ProductionTest, Some(job)) => self.verification_completed_at(job, change, dependent),
            (StepKind::Deployment, Some(job)) => self.deployment_completed_at(job, change, dependent),
            _ => None,
        }
    }

    /// When `id` is ready to run `change`: its dependencies completed, and
    /// it is neither blocked, paused nor cooling down. A deployment is also
    /// not ready before its versions were verified by tests.
    pub fn ready_at(&self, id: StepId, change: &Change, dependent: Option<&JobId>) -> Option<DateTime<Utc>> {
        let ready = self.dependencies_completed_at(id, change, dependent)?;
        let ready = [
            self.blocked_until(id, change),
            self.paused_until(id),
            self.cooling_down_until(id, change),
        ]
        .into_iter()
        .flatten()
        .fold(ready, Ord::max);
        let step = &self.steps[id];
        match (&step.kind, &step.job) {
            (StepKind::Deployment, Some(job)) => {
                let versions = self.versions_for(change, self.deployment_for(job));
                self.verified_at(job, &versions).map(|verified| ready.max(verified))
            }
            _ => Some(ready),
        }
    }

    /// When all dependencies of `id` completed for `change`; the epoch if it
    /// has none.
    pub fn dependencies_completed_at(
        &self,
        id: StepId,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        self.steps[id]
            .dependencies
            .iter()
            .try_fold(DateTime::UNIX_EPOCH, |latest, dependency| {
                self.completed_at(*dependency, change, dependent)
                    .map(|completed| latest.max(completed))
            })
    }

    /// When the instance step of `instance` is ready for `change`.
    pub fn instance_ready_at(&self, instance: &str, change: &Change) -> Option<DateTime<Utc>> {
        self.ready_at(self.instance_step(instance)?, change, None)
    }

    /// Complete when the instance's own change contains `change`, or when
    /// the instance has no production jobs.
    fn instance_completed_at(&self, id: StepId, change: &Change, dependent: Option<&JobId>) -> Option<DateTime<Utc>> {
        let name = self.steps[id].instance.as_deref()?;
        let instance = self.instance(name)?;
        let contained = change.platform().is_none_or(|platform| instance.change.platform() == Some(platform))
            && change.revision().is_none_or(|revision| instance.change.revision() == Some(revision));
        let concerns_production = self.spec(name).is_some_and(InstanceSpec::concerns_production);
        if contained || !concerns_production {
            self.dependencies_completed_at(id, change, dependent)
        } else {
            None
        }
    }

    /// Latest success on the targets `change` would have in the zone of
    /// `dependent`.
    fn test_completed_at(&self, job: &JobId, change: &Change, dependent: Option<&JobId>) -> Option<DateTime<Utc>> {
        let versions = self.versions_for(change, dependent.and_then(|d| self.deployment_for(d)));
        self.job(job)?
            .runs()
            .iter()
            .filter(|run| run.has_succeeded() && run.versions.targets_match(&versions))
            .filter_map(|run| run.end)
            .max()
    }

    fn verification_completed_at(
        &self,
        job: &JobId,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let status = self.job(job)?;
        let versions = self.versions_for(change, self.deployment_for(job));
        if dependent == Some(job) {
            // The verification must have started after the zone last deployed.
            let deployment = JobId::new(&job.instance, job.job_type.deployment_job()?);
            let deployed_at = self
                .job(&deployment)
                .and_then(JobStatus::last_completed)
                .and_then(|run| run.end);
            status
                .last_success()
                .filter(|run| versions.targets_match(&run.versions))
                .filter(|run| deployed_at.is_some_and(|end| end <= run.start))
                .and_then(|run| run.end)
        } else {
            status
                .runs()
                .iter()
                .find(|run| run.has_succeeded() && versions.targets_match(&run.versions))
                .and_then(|run| run.end)
        }
    }

    fn deployment_completed_at(
        &self,
        job: &JobId,
        change: &Change,
        dependent: Option<&JobId>,
    ) -> Option<DateTime<Utc>> {
        let existing = self.deployment_for(job);
        if change.is_pinned() && change.platform().is_some() && existing.map(|d| &d.platform) != change.platform() {
            return None;
        }
        // The job itself should (re-)run, but other dependents need not wait.
        if change.revision().is_some() && existing.map(|d| d.revision) != change.revision() && dependent == Some(job) {
            return None;
        }
        let status = self.job(job);
        if let (Some(deployment), Some(instance)) = (existing, self.instance(&job.instance)) {
            let full = &instance.change;
            let upgrades =
                change.upgrades_platform(&deployment.platform) || change.upgrades_revision(deployment.revision);
            let downgrades = full.downgrades_platform(&deployment.platform) || full.downgrades_revision(deployment.revision);
            if !upgrades && downgrades {
                return status.and_then(JobStatus::last_completed).and_then(|run| run.end);
            }
        }
        let status = status?;
        let successes: Vec<&Run> = if dependent == Some(job) {
            status.last_success().into_iter().collect()
        } else {
            status.runs().iter().filter(|run| run.has_succeeded()).collect()
        };
        successes
            .into_iter()
            .filter(|run| targets_change(change, &run.versions))
            .filter_map(|run| run.end)
            .min()
    }

    /// End of the change blocker windows holding `change` back at the
    /// instance of `id`, if it is blocked now.
    fn blocked_until(&self, id: StepId, change: &Change) -> Option<DateTime<Utc>> {
        let step = &self.steps[id];
        if matches!(step.kind, StepKind::Delay(_) | StepKind::TestZone) {
            return None;
        }
        let spec = self.spec(step.instance.as_deref()?)?;
        let blockers: Vec<_> = spec
            .change_blockers
            .iter()
            .filter(|blocker| {
                change.platform().is_some() && blocker.blocks_platform
                    || change.revision().is_some() && blocker.blocks_revision
            })
            .collect();
        if blockers.is_empty() {
            return None;
        }
        let end = after(self.now, self.config.block_lookahead);
        let mut current = self.now;
        while current < end {
            let mut blocked = false;
            for blocker in &blockers {
                while current < end && blocker.window.includes(current) {
                    blocked = true;
                    current = next_hour(current);
                }
            }
            if !blocked {
                return (current != self.now).then_some(current);
            }
        }
        Some(end)
    }

    fn paused_until(&self, id: StepId) -> Option<DateTime<Utc>> {
        self.job(self.steps[id].job.as_ref()?)?.paused_until()
    }

    fn cooling_down_until(&self, id: StepId, change: &Change) -> Option<DateTime<Utc>> {
        let job = self.job(self.steps[id].job.as_ref()?)?;
        self.config.retry.cooling_down_until(job, change, self.now)
    }

    /// Earliest of when `job` was first triggered on exactly `versions`,
    /// and when both system and staging tests had passed on them.
    pub fn verified_at(&self, job: &JobId, versions: &Versions) -> Option<DateTime<Utc>> {
        let triggered_at = self
            .job(job)
            .and_then(|status| status.runs().iter().find(|run| run.versions == *versions))
            .map(|run| run.start);
        let tested_at = self
            .tested_at(&job.instance, &JobType::SystemTest, versions)
            .zip(self.tested_at(&job.instance, &JobType::StagingTest, versions))
            .map(|(system, staging)| system.max(staging));
        match (triggered_at, tested_at) {
            (Some(triggered), Some(tested)) => Some(triggered.min(tested)),
            (triggered, tested) => triggered.or(tested),
        }
    }

    /// Earliest start of a successful `test` on `versions`. An instance
    /// with a declared test only trusts its own.
    fn tested_at(&self, instance: &str, test: &JobType, versions: &Versions) -> Option<DateTime<Utc>> {
        let declared = JobId::new(instance, test.clone());
        let jobs: Vec<&JobStatus> = if self.is_declared(&declared) {
            self.job(&declared).into_iter().collect()
        } else {
            self.all_jobs().filter(|job| job.id.job_type == *test).collect()
        };
        jobs.into_iter()
            .flat_map(JobStatus::runs)
            .filter(|run| run.has_succeeded() && run.versions == *versions)
            .map(|run| run.start)
            .min()
    }

    // ── Failures ───────────────────────────────────────────────────

    /// Whether any job on a path from `dependency` to `dependent` is
    /// failing hard.
    fn has_failures_between(&self, dependency: StepId, dependent: StepId) -> bool {
        let mut visited = HashSet::new();
        let mut dependents = HashSet::new();
        self.fill_dependents(dependency, &mut visited, &mut dependents, dependent);
        dependents
            .into_iter()
            .filter_map(|id| self.steps[id].job.as_ref())
            .filter_map(|job| self.job(job))
            .any(JobStatus::is_failing_hard)
    }

    fn fill_dependents(
        &self,
        dependency: StepId,
        visited: &mut HashSet<StepId>,
        dependents: &mut HashSet<StepId>,
        current: StepId,
    ) -> bool {
        if visited.contains(&current) {
            return dependents.contains(&current);
        }
        if dependency == current {
            dependents.insert(current);
        } else {
            for dep in &self.steps[current].dependencies {
                if self.fill_dependents(dependency, visited, dependents, *dep) {
                    dependents.insert(current);
                }
            }
        }
        visited.insert(current);
        dependents.contains(&current)
    }

    /// Whether any job failing hard last ran a revision older than
    /// `revision`.
    pub fn has_failures(&self, revision: RevisionId) -> bool {
        self.all_jobs().filter(|job| job.is_failing_hard()).any(|job| {
            job.last_triggered()
                .is_some_and(|run| run.versions.target_revision < revision)
        })
    }

    // ── Jobs to run ────────────────────────────────────────────────

    /// Changes to roll out with `job`, possibly split in two runs.
    fn changes(&self, job: &JobId, step: StepId, change: &Change) -> Vec<Change> {
        if self.completed_at(step, change, Some(job)).is_some() {
            return Vec::new();
        }
        if change.platform().is_none() || change.revision().is_none() || change.is_pinned() {
            return vec![change.clone()];
        }
        if self.completed_at(step, &change.without_revision(), Some(job)).is_some()
            || self.completed_at(step, &change.without_platform(), Some(job)).is_some()
        {
            return vec![change.clone()];
        }

        let rollout = self.rollout(&job.instance);
        if let JobType::Test(region) = &job.job_type {
            let deployment = JobId::new(&job.instance, JobType::production(region));
            if let Some(deployment_step) = self.step_of(&deployment) {
                let platform_deployed = self
                    .completed_at(deployment_step, &change.without_revision(), Some(&deployment))
                    .is_some();
                let revision_deployed = self
                    .completed_at(deployment_step, &change.without_platform(), Some(&deployment))
                    .is_some();
                let caught_up = self
                    .ready_at(deployment_step, change, Some(&deployment))
                    .is_some_and(|ready| ready <= self.now);
                let split = policy::split_verification(rollout, platform_deployed, revision_deployed, caught_up, || {
                    self.has_failures_between(deployment_step, step)
                });
                if let Some(split) = split {
                    return split.changes(change);
                }
            }
        }

        let platform_ready = self.dependencies_completed_at(step, &change.without_revision(), Some(job));
        let revision_ready = self.dependencies_completed_at(step, &change.without_platform(), Some(job));
        let failing = self.job(job).and_then(JobStatus::first_failing).is_some();
        policy::split_deployment(rollout, platform_ready, revision_ready, failing).changes(change)
    }

    /// Production jobs needed to roll `change` out to `instance`.
    ///
    /// With `assume_upgrades_succeed`, zones are taken to already run the
    /// platform of `change`; used when planning tests ahead of time.
    fn production_jobs(&self, instance: &str, change: &Change, assume_upgrades_succeed: bool) -> JobsToRun {
        let mut jobs = JobsToRun::default();
        for (job, step) in &self.job_steps {
            if job.instance != instance || !job.job_type.is_production() {
                continue;
            }
            let changes = self.changes(job, *step, change);
            if changes.is_empty() {
                continue;
            }
            let mut deployment = self.deployment_for(job).map(|existing| {
                if assume_upgrades_succeed {
                    existing.with_change(&change.without_revision())
                } else {
                    existing.clone()
                }
            });
            let mut planned = Vec::with_capacity(changes.len());
            for partial in changes {
                planned.push(Job {
                    versions: self.versions_for(&partial, deployment.as_ref()),
                    ready_at: self.ready_at(*step, &partial, Some(job)),
                    change: partial.clone(),
                });
                // The first part is assumed to be applied before the second.
                deployment = deployment.map(|existing| existing.with_change(&partial));
            }
            jobs.insert(job.clone(), planned);
        }
        jobs
    }

    /// Test jobs needed before the production deployments in `jobs`.
    ///
    /// An instance's declared tests must pass on its own versions. Other
    /// versions need one success of each test type, in any instance.
    pub fn test_jobs(&self, jobs: &JobsToRun) -> JobsToRun {
        let mut tests = JobsToRun::default();
        let deployments: Vec<_> = jobs
            .iter()
            .filter(|(job, _)| job.job_type.is_production() && job.job_type.is_deployment())
            .collect();
        for test_type in [JobType::SystemTest, JobType::StagingTest] {
            for (job, planned) in &deployments {
                let declared = JobId::new(&job.instance, test_type.clone());
                if !self.is_declared(&declared) {
                    continue;
                }
                for production in planned.iter() {
                    if self.job(&declared).and_then(|s| s.success_on(&production.versions)).is_none() {
                        tests.merge(declared.clone(), vec![self.test_job(&declared, production)]);
                    }
                }
            }
            for (_, planned) in &deployments {
                for production in planned.iter() {
                    let tested = self
                        .all_jobs()
                        .any(|s| s.id.job_type == test_type && s.success_on(&production.versions).is_some());
                    let scheduled = tests.iter().any(|(test, runs)| {
                        test.job_type == test_type && runs.iter().any(|run| run.versions == production.versions)
                    });
                    if tested || scheduled {
                        continue;
                    }
                    if let Some(test) = self.first_declared_or_implicit(&test_type) {
                        let planned = self.test_job(&test, production);
                        tests.merge(test, vec![planned]);
                    }
                }
            }
        }
        tests
    }

    fn test_job(&self, test: &JobId, production: &Job) -> Job {
        Job {
            versions: production.versions.clone(),
            ready_at: self
                .step_of(test)
                .and_then(|step| self.ready_at(step, &production.change, None)),
            change: production.change.clone(),
        }
    }

    /// The first instance's declared test of this type, or else the first
    /// instance's implicit one.
    fn first_declared_or_implicit(&self, test: &JobType) -> Option<JobId> {
        let candidates: Vec<JobId> = self
            .application
            .spec
            .instance_names()
            .iter()
            .map(|name| JobId::new(name, test.clone()))
            .collect();
        candidates
            .iter()
            .find(|job| self.is_declared(job))
            .or(candidates.first())
            .cloned()
    }

    /// Jobs needed for each instance to complete its given change.
    pub fn jobs_to_run_for(&self, changes: &[(InstanceName, Change)], eager_tests: bool) -> JobsToRun {
        let mut production = JobsToRun::default();
        for (instance, change) in changes {
            if !change.has_targets() {
                continue;
            }
            for (job, planned) in self.production_jobs(instance, change, eager_tests) {
                production.insert(job, planned);
            }
        }
        let mut jobs = self.test_jobs(&production);
        for (job, planned) in production {
            jobs.insert(job, planned);
        }

        // Declared tests which are idle on their instance's change still run.
        let first_deployed = self
            .job_steps
            .iter()
            .map(|(job, _)| job)
            .find(|job| {
                job.job_type.is_production() && job.job_type.is_deployment() && self.deployment_for(job).is_some()
            });
        for (job, step) in &self.job_steps {
            if !self.steps[*step].declared || jobs.contains(job) {
                continue;
            }
            let Some((_, change)) = changes.iter().find(|(instance, _)| *instance == job.instance) else {
                continue;
            };
            if !change.has_targets() {
                continue;
            }
            if self.completed_at(*step, change, first_deployed).is_none() {
                let versions = self.versions_for(change, first_deployed.and_then(|d| self.deployment_for(d)));
                let planned = Job {
                    versions,
                    ready_at: self.ready_at(*step, change, None),
                    change: change.clone(),
                };
                jobs.merge(job.clone(), vec![planned]);
            }
        }
        jobs
    }

    /// Jobs needed to complete the current changes of all instances, plus
    /// tests for what is outstanding on top of them.
    pub fn jobs_to_run(&self) -> JobsToRun {
        let current: Vec<(InstanceName, Change)> = self
            .application
            .spec
            .instance_names()
            .into_iter()
            .filter_map(|name| {
                let change = self.instance(&name)?.change.clone();
                Some((name, change))
            })
            .collect();
        let mut jobs = self.jobs_to_run_for(&current, false);

        let eager: Vec<(InstanceName, Change)> = current
            .iter()
            .map(|(name, change)| (name.clone(), self.outstanding_change(name).on_top_of(change)))
            .collect();
        for (job, planned) in self.jobs_to_run_for(&eager, true) {
            if !job.job_type.is_production() {
                jobs.merge(job, planned);
            }
        }
        jobs
    }

    // ── Changes ────────────────────────────────────────────────────

    /// The next revision for `instance`, if it would upgrade its current
    /// change and still needs jobs to run.
    pub fn outstanding_change(&self, instance: &str) -> Change {
        let (Some(current), Some(next)) = (self.instance(instance), self.next_revision(instance)) else {
            return Change::empty();
        };
        if current.cancelled_revision.is_some_and(|cancelled| next <= cancelled) {
            return Change::empty();
        }
        let change = Change::of_revision(next);
        if current.change.revision().is_some_and(|revision| !change.upgrades_revision(revision)) {
            return Change::empty();
        }
        if self
            .jobs_to_run_for(&[(instance.to_string(), change.clone())], false)
            .is_empty()
        {
            return Change::empty();
        }
        change
    }

    /// The oldest revision completed by an upstream instance, or the latest
    /// submitted revision if there is none.
    fn next_revision(&self, instance: &str) -> Option<RevisionId> {
        self.instance_step(instance)
            .map(|step| self.upstream_instances(step))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|name| self.instance(name).and_then(|i| i.latest_deployed))
            .min()
            .or_else(|| self.application.latest_revision().map(|revision| revision.id))
    }

    /// Instances `step` transitively depends on.
    fn upstream_instances(&self, step: StepId) -> Vec<&str> {
        let mut upstream = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = self.steps[step].dependencies.clone();
        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let dependency = &self.steps[id];
            if dependency.kind == StepKind::Instance {
                if let Some(name) = dependency.instance.as_deref() {
                    upstream.push(name);
                }
            }
            pending.extend(dependency.dependencies.iter().copied());
        }
        upstream
    }

    /// `instance` with `change` as its change, minus the axes which no
    /// longer need any job to run. A completed revision becomes the
    /// instance's latest deployed revision.
    pub fn with_remaining_change(&self, instance: &str, change: &Change) -> Option<Instance> {
        let mut updated = self.instance(instance)?.clone();
        let mut remaining = change.clone();
        let name = instance.to_string();
        if self
            .jobs_to_run_for(&[(name.clone(), change.without_revision())], false)
            .is_empty()
        {
            remaining = remaining.without_platform();
        }
        if self
            .jobs_to_run_for(&[(name, change.without_platform())], false)
            .is_empty()
        {
            remaining = remaining.without_revision();
            if let Some(revision) = change.revision() {
                updated = updated.with_latest_deployed(revision);
            }
        }
        Some(updated.with_change(remaining))
    }
}

/// Whether `versions` targets every axis `change` has.
fn targets_change(change: &Change, versions: &Versions) -> bool {
    change.platform().is_none_or(|platform| *platform == versions.target_platform)
        && change.revision().is_none_or(|revision| revision == versions.target_revision)
}

fn next_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    let next = instant + TimeDelta::hours(1);
    next.duration_trunc(TimeDelta::hours(1)).unwrap_or(next)
}
