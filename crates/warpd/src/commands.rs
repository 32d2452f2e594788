//! Subcommand implementations.
//!
//! One-shot commands open the state store directly, so they can't run next
//! to a daemon holding the same data directory. The daemon therefore runs jobs
//! with a [`SimulatedExecutor`] which reports every run as successful after
//! the configured run duration; `run --once` only records the runs it starts,
//! and their outcomes come from `warpd report`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use warp_core::{ApplicationRevision, DeploymentSpec, JobId, RevisionId, Version};
use warpgrid_rollout::{CancelScope, DeploymentStatus, DeploymentTrigger};
use warpgrid_scheduler::{DryRunExecutor, Orchestrator, SimulatedExecutor, refresh_version_status};
use warpgrid_state::{Application, Confidence, RunId, RunStatus, StateStore, VersionStatus};

use crate::config::DaemonConfig;

fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    Ok(StateStore::open(&config.db_path())?)
}

fn require_versions(store: &StateStore) -> anyhow::Result<VersionStatus> {
    store
        .get_version_status()?
        .context("no platform version released yet; run `warpd release-version` first")
}

fn orchestrator(store: StateStore, config: &DaemonConfig, versions: VersionStatus) -> Orchestrator {
    // The watch sender is dropped: one-shot commands only read the snapshot.
    let (_, receiver) = watch::channel(versions);
    Orchestrator::new(
        store,
        Arc::new(DryRunExecutor::new()),
        receiver,
        DeploymentTrigger::new(config.trigger.clone()),
        config.orchestrator.clone(),
    )
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Daemon ─────────────────────────────────────────────────────────

/// Run rollout cycles until interrupted, or a single cycle with `once`.
pub async fn run(config: &DaemonConfig, once: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let versions = require_versions(&store)?;
    info!(
        data_dir = %config.data_dir.display(),
        system_version = %versions.system_version,
        "warpd starting"
    );

    if once {
        let report = orchestrator(store, config, versions).maintain().await?;
        return print_json(&report);
    }

    let (versions_tx, versions_rx) = watch::channel(versions);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (executor, completions) = SimulatedExecutor::new(config.run_duration);
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(executor),
        versions_rx,
        DeploymentTrigger::new(config.trigger.clone()),
        config.orchestrator.clone(),
    );

    let refresher = tokio::spawn(refresh_version_status(
        store,
        versions_tx,
        config.orchestrator.interval,
        shutdown_rx.clone(),
    ));
    let reporter = {
        let (orchestrator, shutdown_rx) = (orchestrator.clone(), shutdown_rx.clone());
        tokio::spawn(async move { orchestrator.report_completions(completions, shutdown_rx).await })
    };
    let cycles = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };
    orchestrator.wake();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = refresher.await;
    let _ = cycles.await;
    let _ = reporter.await;

    info!("warpd stopped");
    Ok(())
}

// ── Applications ───────────────────────────────────────────────────

/// Parse and validate a deployment spec, and list the jobs it declares.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let spec = DeploymentSpec::from_file(path)?;
    let application = Application::new("validate", spec, Utc::now());
    let version = Version::new(0, 0, 0);
    let trigger = DeploymentTrigger::default();
    let status = DeploymentStatus::new(&application, &version, Utc::now(), trigger.config());

    println!("{}: valid", path.display());
    for name in application.spec.instance_names() {
        let jobs: Vec<String> = status
            .job_steps()
            .filter(|(job, _)| job.instance == name)
            .map(|(job, _)| job.job_type.to_string())
            .collect();
        println!("  {name}: {}", jobs.join(", "));
    }
    Ok(())
}

/// Submit build `build` of `application`, with a new spec if given.
pub async fn submit(config: &DaemonConfig, application: &str, build: u64, spec: Option<&Path>) -> anyhow::Result<()> {
    let spec = spec.map(DeploymentSpec::from_file).transpose()?;
    let store = open_store(config)?;
    // Submission doesn't look at platform versions.
    let versions = store
        .get_version_status()?
        .unwrap_or_else(|| VersionStatus::new(Version::new(0, 0, 0)));
    let revision = ApplicationRevision::new(build, Utc::now());
    orchestrator(store, config, versions)
        .submit(application, revision, spec)
        .await?;
    println!("submitted {} of {application}", RevisionId::new(build));
    Ok(())
}

/// Dry-run evaluation: what the next cycle would decide for `application`.
pub fn evaluate(config: &DaemonConfig, application: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let versions = require_versions(&store)?;
    let evaluation = orchestrator(store, config, versions).evaluate(application)?;
    print_json(&evaluation)
}

// ── Platform versions ──────────────────────────────────────────────

/// Record `version` with `confidence`. A newer, non-broken version also
/// becomes the system version.
pub fn release_version(config: &DaemonConfig, version: Version, confidence: Confidence) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let status = match store.get_version_status()? {
        Some(status) => status,
        None if confidence == Confidence::Broken => bail!("the first released version can't be broken"),
        None => VersionStatus::new(version.clone()),
    };
    let mut status = status.with_version(version.clone(), confidence);
    if confidence != Confidence::Broken && version > status.system_version {
        status = status.with_system_version(version.clone());
    }
    if confidence == Confidence::Broken {
        warn!(%version, "platform version marked broken");
    }
    store.put_version_status(&status)?;
    println!("released {version} ({confidence:?}), system version {}", status.system_version);
    Ok(())
}

// ── Operator commands ──────────────────────────────────────────────

/// Record the outcome of run `number` of `job`.
pub async fn report(config: &DaemonConfig, application: &str, job: JobId, number: u64, outcome: RunStatus) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let versions = require_versions(&store)?;
    let run = RunId::new(job, number);
    orchestrator(store, config, versions)
        .report_run(application, &run, outcome)
        .await?;
    println!("reported {run}: {outcome:?}");
    Ok(())
}

pub async fn cancel(config: &DaemonConfig, application: &str, instance: &str, scope: CancelScope) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let versions = require_versions(&store)?;
    orchestrator(store, config, versions)
        .cancel_change(application, instance, scope)
        .await?;
    println!("cancelled {scope} change of {application}.{instance}");
    Ok(())
}

pub async fn pause(config: &DaemonConfig, application: &str, job: &JobId, duration: Duration) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let versions = require_versions(&store)?;
    let until = Utc::now() + TimeDelta::from_std(duration)?;
    orchestrator(store, config, versions)
        .pause_job(application, job, until)
        .await?;
    println!("paused {job} of {application} until {until}");
    Ok(())
}

pub async fn resume(config: &DaemonConfig, application: &str, job: &JobId) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let versions = require_versions(&store)?;
    orchestrator(store, config, versions).resume_job(application, job).await?;
    println!("resumed {job} of {application}");
    Ok(())
}

