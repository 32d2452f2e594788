//! Domain types stored in the WarpGrid state store.
//!
//! All types are immutable snapshots: operations return an updated copy and
//! the caller commits it through [`StateStore::lock_and_store`].
//!
//! [`StateStore::lock_and_store`]: crate::StateStore::lock_and_store

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warp_core::{
    ApplicationId, ApplicationRevision, DeploymentSpec, InstanceName, JobId, JobType, RegionName,
    RevisionId, Version,
};

// ── Change ─────────────────────────────────────────────────────────

/// A desired platform version and/or application revision for an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Change {
    platform: Option<Version>,
    revision: Option<RevisionId>,
    #[serde(default)]
    pinned: bool,
}

impl Change {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of_platform(platform: Version) -> Self {
        Self {
            platform: Some(platform),
            ..Self::default()
        }
    }

    pub fn of_revision(revision: RevisionId) -> Self {
        Self {
            revision: Some(revision),
            ..Self::default()
        }
    }

    pub fn platform(&self) -> Option<&Version> {
        self.platform.as_ref()
    }

    pub fn revision(&self) -> Option<RevisionId> {
        self.revision
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Whether this change has a platform or revision to roll out.
    pub fn has_targets(&self) -> bool {
        self.platform.is_some() || self.revision.is_some()
    }

    /// No targets and no pin.
    pub fn is_empty(&self) -> bool {
        !self.has_targets() && !self.pinned
    }

    pub fn with_platform(&self, platform: Version) -> Self {
        Self {
            platform: Some(platform),
            ..self.clone()
        }
    }

    pub fn with_revision(&self, revision: RevisionId) -> Self {
        Self {
            revision: Some(revision),
            ..self.clone()
        }
    }

    pub fn without_platform(&self) -> Self {
        Self {
            platform: None,
            ..self.clone()
        }
    }

    pub fn without_revision(&self) -> Self {
        Self {
            revision: None,
            ..self.clone()
        }
    }

    pub fn with_pin(&self) -> Self {
        Self {
            pinned: true,
            ..self.clone()
        }
    }

    pub fn without_pin(&self) -> Self {
        Self {
            pinned: false,
            ..self.clone()
        }
    }

    /// Merge the axes of `other` into this change, preferring `other`'s.
    pub fn with(&self, other: &Change) -> Self {
        Self {
            platform: other.platform.clone().or_else(|| self.platform.clone()),
            revision: other.revision.or(self.revision),
            pinned: self.pinned || other.pinned,
        }
    }

    /// This change, with any axis it lacks taken from `other`.
    pub fn on_top_of(&self, other: &Change) -> Self {
        other.with(self)
    }

    pub fn upgrades_platform(&self, from: &Version) -> bool {
        self.platform.as_ref().is_some_and(|platform| platform > from)
    }

    pub fn downgrades_platform(&self, from: &Version) -> bool {
        self.platform.as_ref().is_some_and(|platform| platform < from)
    }

    pub fn upgrades_revision(&self, from: RevisionId) -> bool {
        self.revision.is_some_and(|revision| revision > from)
    }

    pub fn downgrades_revision(&self, from: RevisionId) -> bool {
        self.revision.is_some_and(|revision| revision < from)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(platform) = &self.platform {
            parts.push(format!("upgrade to {platform}"));
        }
        if let Some(revision) = self.revision {
            parts.push(format!("revision {revision}"));
        }
        if self.pinned {
            parts.push("pinned".to_string());
        }
        if parts.is_empty() {
            write!(f, "no change")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

// ── Versions ───────────────────────────────────────────────────────

/// Source and target versions of a job run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Versions {
    pub target_platform: Version,
    pub target_revision: RevisionId,
    pub source_platform: Option<Version>,
    pub source_revision: Option<RevisionId>,
}

impl Versions {
    pub fn new(target_platform: Version, target_revision: RevisionId) -> Self {
        Self {
            target_platform,
            target_revision,
            source_platform: None,
            source_revision: None,
        }
    }

    pub fn with_sources(mut self, platform: Version, revision: RevisionId) -> Self {
        self.source_platform = Some(platform);
        self.source_revision = Some(revision);
        self
    }

    /// Resolve the versions a job should run with to roll out `change` to a
    /// zone holding `deployment`.
    ///
    /// Unless the change is pinned, the target platform never goes below what
    /// the zone already runs. Missing axes fall back to the zone's current
    /// versions, then to the oldest versions deployed anywhere, then to
    /// `default_platform` and the latest submitted revision.
    pub fn for_change(
        change: &Change,
        application: &Application,
        deployment: Option<&Deployment>,
        default_platform: &Version,
    ) -> Self {
        let target_platform = match change.platform() {
            Some(platform) if change.is_pinned() => platform.clone(),
            platform => platform
                .into_iter()
                .chain(deployment.map(|d| &d.platform))
                .max()
                .cloned()
                .or_else(|| application.oldest_deployed_platform())
                .unwrap_or_else(|| default_platform.clone()),
        };
        let target_revision = change
            .revision()
            .or_else(|| deployment.map(|d| d.revision))
            .or_else(|| application.oldest_deployed_revision())
            .or_else(|| application.latest_revision().map(|r| r.id))
            .unwrap_or(RevisionId::UNKNOWN);
        Self {
            target_platform,
            target_revision,
            source_platform: deployment.map(|d| d.platform.clone()),
            source_revision: deployment.map(|d| d.revision),
        }
    }

    pub fn targets_match(&self, other: &Versions) -> bool {
        self.target_platform == other.target_platform && self.target_revision == other.target_revision
    }

    /// Whether this run's sources are compatible with `other`: each source
    /// present here must equal either `other`'s target or its source.
    pub fn sources_match_if_present(&self, other: &Versions) -> bool {
        let platform = match &self.source_platform {
            None => true,
            Some(source) => *source == other.target_platform || self.source_platform == other.source_platform,
        };
        let revision = match self.source_revision {
            None => true,
            Some(source) => source == other.target_revision || self.source_revision == other.source_revision,
        };
        platform && revision
    }

    /// Whether running these versions in `deployment`'s zone would move it
    /// back to an older platform or revision.
    pub fn downgrades(&self, deployment: &Deployment) -> bool {
        self.target_platform < deployment.platform || self.target_revision < deployment.revision
    }
}

impl fmt::Display for Versions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform {}, revision {}", self.target_platform, self.target_revision)?;
        if let (Some(platform), Some(revision)) = (&self.source_platform, self.source_revision) {
            write!(f, " (from {platform}, {revision})")?;
        }
        Ok(())
    }
}

// ── Runs ───────────────────────────────────────────────────────────

/// Identifies one run of a job; numbers increase per job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub job: JobId,
    pub number: u64,
}

impl RunId {
    pub fn new(job: JobId, number: u64) -> Self {
        Self { job, number }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.number)
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Deployment,
    Installation,
    Tests,
    Error,
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Success,
    Failed(FailureKind),
    Aborted,
    OutOfCapacity,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub versions: Versions,
    pub status: RunStatus,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Set when the engine asked the executor to abort this run.
    #[serde(default)]
    pub abort_requested: bool,
    /// Operator who forced this run, if any.
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl Run {
    pub fn start(id: RunId, versions: Versions, at: DateTime<Utc>) -> Self {
        Self {
            id,
            versions,
            status: RunStatus::Running,
            start: at,
            end: None,
            abort_requested: false,
            triggered_by: None,
        }
    }

    pub fn has_ended(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.end.is_none()
    }

    pub fn has_succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.status, RunStatus::Failed(_) | RunStatus::OutOfCapacity)
    }

    /// Ended and not aborted.
    pub fn has_completed(&self) -> bool {
        self.has_ended() && self.status != RunStatus::Aborted
    }

    fn finished(mut self, status: RunStatus, at: DateTime<Utc>) -> Self {
        self.status = status;
        self.end = Some(at);
        self
    }
}

// ── Job status ─────────────────────────────────────────────────────

/// Run history of one job of one instance, oldest run first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    #[serde(default)]
    runs: Vec<Run>,
    #[serde(default)]
    paused_until: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            runs: Vec::new(),
            paused_until: None,
        }
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn run(&self, number: u64) -> Option<&Run> {
        self.runs.iter().find(|run| run.id.number == number)
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        self.paused_until
    }

    pub fn last_triggered(&self) -> Option<&Run> {
        self.runs.last()
    }

    /// The last run which ended without being aborted.
    pub fn last_completed(&self) -> Option<&Run> {
        self.runs.iter().rev().find(|run| run.has_completed())
    }

    pub fn last_success(&self) -> Option<&Run> {
        self.runs.iter().rev().find(|run| run.has_succeeded())
    }

    /// The first failure after the last success, while the job still fails.
    pub fn first_failing(&self) -> Option<&Run> {
        if !self.last_completed().is_some_and(Run::has_failed) {
            return None;
        }
        let after_success = self
            .runs
            .iter()
            .rposition(Run::has_succeeded)
            .map_or(0, |index| index + 1);
        self.runs[after_success..]
            .iter()
            .find(|run| run.has_completed() && run.has_failed())
    }

    pub fn is_running(&self) -> bool {
        self.last_triggered().is_some_and(Run::is_running)
    }

    pub fn is_out_of_capacity(&self) -> bool {
        self.last_completed()
            .is_some_and(|run| run.status == RunStatus::OutOfCapacity)
    }

    /// Failing for a reason other than a lack of test capacity.
    pub fn is_failing_hard(&self) -> bool {
        self.last_completed().is_some_and(Run::has_failed)
            && !(self.id.job_type.is_test_environment() && self.is_out_of_capacity())
    }

    /// The earliest successful run on exactly these versions.
    pub fn success_on(&self, versions: &Versions) -> Option<&Run> {
        self.runs
            .iter()
            .find(|run| run.has_succeeded() && run.versions == *versions)
    }

    pub fn next_run_number(&self) -> u64 {
        self.last_triggered().map_or(1, |run| run.id.number + 1)
    }

    pub fn with_pause(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.paused_until = until;
        self
    }

    pub fn with_run(mut self, run: Run) -> Self {
        self.runs.push(run);
        self
    }

    /// Flag a running run as asked to abort.
    pub fn with_abort_requested(mut self, number: u64) -> Self {
        if let Some(run) = self.runs.iter_mut().find(|run| run.id.number == number && run.is_running()) {
            run.abort_requested = true;
        }
        self
    }

    /// Record the terminal status of a running run. Terminal runs are never
    /// changed; `None` is returned if the run is unknown or already ended.
    pub fn with_run_finished(mut self, number: u64, status: RunStatus, at: DateTime<Utc>) -> Option<Self> {
        let index = self
            .runs
            .iter()
            .position(|run| run.id.number == number && run.is_running())?;
        let run = self.runs.remove(index);
        self.runs.insert(index, run.finished(status, at));
        Some(self)
    }
}

// ── Deployments ────────────────────────────────────────────────────

/// What is currently live in one production zone of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub region: RegionName,
    pub platform: Version,
    pub revision: RevisionId,
    pub at: DateTime<Utc>,
}

impl Deployment {
    /// This deployment as it would look with `change` applied.
    pub fn with_change(&self, change: &Change) -> Self {
        Self {
            region: self.region.clone(),
            platform: change.platform().cloned().unwrap_or_else(|| self.platform.clone()),
            revision: change.revision().unwrap_or(self.revision),
            at: self.at,
        }
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// Rollout state of one instance of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: InstanceName,
    #[serde(default)]
    pub change: Change,
    #[serde(default)]
    pub deployments: BTreeMap<RegionName, Deployment>,
    /// The last revision this instance completed rolling out.
    #[serde(default)]
    pub latest_deployed: Option<RevisionId>,
    /// Platform cancelled by an operator; not proposed again until a newer
    /// one is released.
    #[serde(default)]
    pub cancelled_platform: Option<Version>,
    /// Revision cancelled by an operator; not proposed again until a newer
    /// build is submitted.
    #[serde(default)]
    pub cancelled_revision: Option<RevisionId>,
    #[serde(default)]
    pub jobs: BTreeMap<JobType, JobStatus>,
}

impl Instance {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            change: Change::empty(),
            deployments: BTreeMap::new(),
            latest_deployed: None,
            cancelled_platform: None,
            cancelled_revision: None,
            jobs: BTreeMap::new(),
        }
    }

    pub fn job(&self, job_type: &JobType) -> Option<&JobStatus> {
        self.jobs.get(job_type)
    }

    /// The job's status, or an empty one if it never ran.
    pub fn job_status(&self, job_type: &JobType) -> JobStatus {
        self.jobs
            .get(job_type)
            .cloned()
            .unwrap_or_else(|| JobStatus::new(JobId::new(&self.name, job_type.clone())))
    }

    pub fn deployment(&self, region: &str) -> Option<&Deployment> {
        self.deployments.get(region)
    }

    pub fn with_change(mut self, change: Change) -> Self {
        self.change = change;
        self
    }

    pub fn with_latest_deployed(mut self, revision: RevisionId) -> Self {
        self.latest_deployed = Some(revision);
        self
    }

    /// Remember what `change` targeted, so it isn't proposed again.
    pub fn with_cancelled(mut self, change: &Change) -> Self {
        if let Some(platform) = change.platform() {
            self.cancelled_platform = Some(platform.clone());
        }
        if let Some(revision) = change.revision() {
            self.cancelled_revision = Some(revision);
        }
        self
    }

    /// Forget cancellations of the axes `change` targets.
    pub fn without_cancelled(mut self, change: &Change) -> Self {
        if change.platform().is_some() {
            self.cancelled_platform = None;
        }
        if change.revision().is_some() {
            self.cancelled_revision = None;
        }
        self
    }

    pub fn with_job(mut self, status: JobStatus) -> Self {
        self.jobs.insert(status.id.job_type.clone(), status);
        self
    }

    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployments.insert(deployment.region.clone(), deployment);
        self
    }
}

/// A job queued for re-triggering once its current run has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetriggerEntry {
    pub job: JobId,
    /// The run number the retrigger must create; earlier runs don't count.
    pub required_run: u64,
}

// ── Applications ───────────────────────────────────────────────────

/// An application, its spec, submitted revisions and per-instance state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub spec: DeploymentSpec,
    /// Submitted revisions, oldest first.
    #[serde(default)]
    pub revisions: Vec<ApplicationRevision>,
    #[serde(default)]
    pub instances: BTreeMap<InstanceName, Instance>,
    #[serde(default)]
    pub retrigger_queue: Vec<RetriggerEntry>,
    pub created_at: DateTime<Utc>,
}

impl Application {
    pub fn new(id: &str, spec: DeploymentSpec, created_at: DateTime<Utc>) -> Self {
        let app = Self {
            id: id.to_string(),
            spec: DeploymentSpec::empty(),
            revisions: Vec::new(),
            instances: BTreeMap::new(),
            retrigger_queue: Vec::new(),
            created_at,
        };
        app.with_spec(spec)
    }

    /// Replace the spec, adding state for any newly declared instances.
    /// State of instances no longer in the spec is kept, but ignored by the
    /// rollout engine.
    pub fn with_spec(mut self, spec: DeploymentSpec) -> Self {
        for name in spec.instance_names() {
            self.instances
                .entry(name.clone())
                .or_insert_with(|| Instance::new(&name));
        }
        self.spec = spec;
        self
    }

    pub fn with_revision(mut self, revision: ApplicationRevision) -> Self {
        self.revisions.push(revision);
        self
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instances.insert(instance.name.clone(), instance);
        self
    }

    pub fn with_retrigger_queue(mut self, queue: Vec<RetriggerEntry>) -> Self {
        self.retrigger_queue = queue;
        self
    }

    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn latest_revision(&self) -> Option<&ApplicationRevision> {
        self.revisions.last()
    }

    fn all_deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.instances.values().flat_map(|i| i.deployments.values())
    }

    pub fn oldest_deployed_platform(&self) -> Option<Version> {
        self.all_deployments().map(|d| &d.platform).min().cloned()
    }

    pub fn oldest_deployed_revision(&self) -> Option<RevisionId> {
        self.all_deployments().map(|d| d.revision).min()
    }
}

// ── Version status ─────────────────────────────────────────────────

/// How much a platform version is trusted for automatic upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    Broken,
    Low,
    Normal,
    High,
}

/// A released platform version and its confidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformVersion {
    pub version: Version,
    pub confidence: Confidence,
}

/// System-wide platform version information, refreshed out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStatus {
    /// The version the system recommends; nothing newer is rolled out.
    pub system_version: Version,
    #[serde(default)]
    pub versions: Vec<PlatformVersion>,
}

impl VersionStatus {
    pub fn new(system_version: Version) -> Self {
        Self {
            system_version,
            versions: Vec::new(),
        }
    }

    /// Add or reclassify a version.
    pub fn with_version(mut self, version: Version, confidence: Confidence) -> Self {
        self.versions.retain(|v| v.version != version);
        self.versions.push(PlatformVersion { version, confidence });
        self.versions.sort_by(|a, b| a.version.cmp(&b.version));
        self
    }

    pub fn with_system_version(mut self, version: Version) -> Self {
        self.system_version = version;
        self
    }

    pub fn confidence(&self, version: &Version) -> Option<Confidence> {
        self.versions
            .iter()
            .find(|v| v.version == *version)
            .map(|v| v.confidence)
    }

    pub fn is_broken(&self, version: &Version) -> bool {
        self.confidence(version) == Some(Confidence::Broken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn run(number: u64, status: RunStatus, end: Option<i64>) -> Run {
        Run {
            id: RunId::new(JobId::new("default", JobType::production("a")), number),
            versions: Versions::new(v("1.0.0"), RevisionId::new(1)),
            status,
            start: at(number as i64 * 100),
            end: end.map(at),
            abort_requested: false,
            triggered_by: None,
        }
    }

    fn job_with(runs: Vec<Run>) -> JobStatus {
        runs.into_iter()
            .fold(JobStatus::new(JobId::new("default", JobType::production("a"))), JobStatus::with_run)
    }

    #[test]
    fn change_merges_axes() {
        let platform = Change::of_platform(v("2.0.0"));
        let revision = Change::of_revision(RevisionId::new(3));
        let both = platform.with(&revision);
        assert_eq!(both.platform(), Some(&v("2.0.0")));
        assert_eq!(both.revision(), Some(RevisionId::new(3)));
        assert_eq!(both.without_platform(), revision);
        assert_eq!(Change::empty().with(&platform), platform);
        assert!(!Change::empty().with_pin().has_targets());
        assert!(!Change::empty().with_pin().is_empty());
    }

    #[test]
    fn change_on_top_of_keeps_own_axes() {
        let current = Change::of_platform(v("2.0.0")).with_revision(RevisionId::new(1));
        let outstanding = Change::of_revision(RevisionId::new(2));
        let merged = outstanding.on_top_of(&current);
        assert_eq!(merged.platform(), Some(&v("2.0.0")));
        assert_eq!(merged.revision(), Some(RevisionId::new(2)));
    }

    #[test]
    fn change_upgrade_comparisons() {
        let change = Change::of_platform(v("2.0.0")).with_revision(RevisionId::new(5));
        assert!(change.upgrades_platform(&v("1.9.0")));
        assert!(!change.upgrades_platform(&v("2.0.0")));
        assert!(change.downgrades_platform(&v("2.1.0")));
        assert!(change.upgrades_revision(RevisionId::new(4)));
        assert!(change.downgrades_revision(RevisionId::new(6)));
        assert!(!Change::empty().downgrades_revision(RevisionId::new(6)));
    }

    #[test]
    fn job_status_accessors() {
        let job = job_with(vec![
            run(1, RunStatus::Success, Some(150)),
            run(2, RunStatus::Failed(FailureKind::Tests), Some(250)),
            run(3, RunStatus::Aborted, Some(350)),
            run(4, RunStatus::Failed(FailureKind::Deployment), Some(450)),
            run(5, RunStatus::Running, None),
        ]);
        assert_eq!(job.last_triggered().unwrap().id.number, 5);
        assert_eq!(job.last_completed().unwrap().id.number, 4);
        assert_eq!(job.last_success().unwrap().id.number, 1);
        assert_eq!(job.first_failing().unwrap().id.number, 2);
        assert!(job.is_running());
        assert!(job.is_failing_hard());
        assert_eq!(job.next_run_number(), 6);
    }

    #[test]
    fn no_first_failing_after_recovery() {
        let job = job_with(vec![
            run(1, RunStatus::Failed(FailureKind::Tests), Some(150)),
            run(2, RunStatus::Success, Some(250)),
        ]);
        assert!(job.first_failing().is_none());
        assert!(job.last_completed().is_some_and(Run::has_succeeded));
    }

    #[test]
    fn terminal_runs_are_immutable() {
        let job = job_with(vec![run(1, RunStatus::Running, None)]);
        let done = job.with_run_finished(1, RunStatus::Success, at(200)).unwrap();
        assert_eq!(done.last_success().unwrap().end, Some(at(200)));
        assert!(done.clone().with_run_finished(1, RunStatus::Aborted, at(300)).is_none());
        assert!(done.with_run_finished(7, RunStatus::Success, at(300)).is_none());
    }

    #[test]
    fn out_of_capacity_in_test_environment_is_not_hard_failure() {
        let mut job = JobStatus::new(JobId::new("default", JobType::SystemTest));
        let mut capacity = run(1, RunStatus::OutOfCapacity, Some(150));
        capacity.id.job = job.id.clone();
        job = job.with_run(capacity);
        assert!(job.is_out_of_capacity());
        assert!(!job.is_failing_hard());
    }

    #[test]
    fn versions_never_downgrade_unpinned_platform() {
        let app = Application::new("t.a", DeploymentSpec::empty(), at(0));
        let deployed = Deployment {
            region: "a".into(),
            platform: v("2.0.0"),
            revision: RevisionId::new(4),
            at: at(10),
        };
        let change = Change::of_platform(v("1.5.0"));
        let versions = Versions::for_change(&change, &app, Some(&deployed), &v("1.0.0"));
        assert_eq!(versions.target_platform, v("2.0.0"));
        assert_eq!(versions.target_revision, RevisionId::new(4));
        assert_eq!(versions.source_platform, Some(v("2.0.0")));

        let pinned = Versions::for_change(&change.with_pin(), &app, Some(&deployed), &v("1.0.0"));
        assert_eq!(pinned.target_platform, v("1.5.0"));
        assert!(pinned.downgrades(&deployed));
    }

    #[test]
    fn versions_fall_back_to_defaults() {
        let app = Application::new("t.a", DeploymentSpec::empty(), at(0))
            .with_revision(ApplicationRevision::new(7, at(5)));
        let versions = Versions::for_change(&Change::empty(), &app, None, &v("1.0.0"));
        assert_eq!(versions, Versions::new(v("1.0.0"), RevisionId::new(7)));
    }

    #[test]
    fn sources_match_if_present() {
        let run = Versions::new(v("2.0.0"), RevisionId::new(2)).with_sources(v("1.0.0"), RevisionId::new(1));
        let same_source = Versions::new(v("2.0.0"), RevisionId::new(2)).with_sources(v("1.0.0"), RevisionId::new(1));
        let moved = Versions::new(v("2.0.0"), RevisionId::new(2)).with_sources(v("1.5.0"), RevisionId::new(1));
        assert!(run.sources_match_if_present(&same_source));
        assert!(!run.sources_match_if_present(&moved));
        assert!(Versions::new(v("2.0.0"), RevisionId::new(2)).sources_match_if_present(&moved));
    }

    #[test]
    fn version_status_reclassifies() {
        let status = VersionStatus::new(v("2.0.0"))
            .with_version(v("2.0.0"), Confidence::High)
            .with_version(v("1.0.0"), Confidence::Normal)
            .with_version(v("2.0.0"), Confidence::Broken);
        assert!(status.is_broken(&v("2.0.0")));
        assert_eq!(status.versions.len(), 2);
        assert_eq!(status.versions[0].version, v("1.0.0"));
    }

    #[test]
    fn application_tracks_spec_instances() {
        let spec = DeploymentSpec::single(warp_core::InstanceSpec::new("beta", vec![])).unwrap();
        let app = Application::new("t.a", spec, at(0));
        assert!(app.instance("beta").is_some());
        let json = serde_json::to_string(&app).unwrap();
        let back: Application = serde_json::from_str(&json).unwrap();
        assert_eq!(back, app);
    }
}
