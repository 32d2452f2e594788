//! warpd: the WarpGrid rollout daemon.
//!
//! Single binary that assembles the rollout subsystems:
//! - State store (redb)
//! - Version status refresher
//! - Orchestrator with a simulated job executor
//!
//! It also carries the operator commands, which act on the same store.
//!
//! # Usage
//!
//! ```text
//! warpd release-version 8.1.0 --confidence high
//! warpd submit tenant.app --build 1 --spec deployment.toml
//! warpd run --config /etc/warpgrid/warpd.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use warp_core::config::parse_duration;
use warp_core::{JobId, JobType, Version};
use warpgrid_rollout::CancelScope;
use warpgrid_state::{Confidence, FailureKind, RunStatus};

mod commands;
mod config;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "warpd", about = "WarpGrid rollout daemon", version, propagate_version = true)]
struct Cli {
    /// Daemon configuration file (warpd.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state, overriding the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log JSON lines instead of text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run rollout cycles until interrupted.
    Run {
        /// Time between cycles, e.g. 30s.
        #[arg(long, value_parser = parse_duration)]
        interval: Option<Duration>,

        /// Maximum concurrent runs per test job type.
        #[arg(long)]
        test_capacity: Option<usize>,

        /// How long simulated runs take before succeeding, e.g. 10s.
        #[arg(long, value_parser = parse_duration)]
        run_duration: Option<Duration>,

        /// Run a single cycle and print its report.
        #[arg(long)]
        once: bool,
    },
    /// Check a deployment.toml and list the jobs it declares.
    Validate {
        spec: PathBuf,
    },
    /// Submit a new revision of an application.
    Submit {
        application: String,

        /// Build number; must be higher than any submitted before.
        #[arg(long)]
        build: u64,

        /// Deployment spec; required for the first submission.
        #[arg(long)]
        spec: Option<PathBuf>,
    },
    /// Release a platform version, or change the confidence in one.
    ReleaseVersion {
        #[arg(id = "platform_version", value_name = "VERSION")]
        version: Version,

        #[arg(long, value_enum, default_value = "normal")]
        confidence: ConfidenceArg,
    },
    /// Report how a job run ended.
    Report {
        application: String,

        #[arg(long, default_value = "default")]
        instance: String,

        /// Job type, e.g. system-test or production-us-east-1.
        #[arg(long)]
        job: JobType,

        /// Run number.
        #[arg(long)]
        run: u64,

        #[arg(long, value_enum)]
        outcome: OutcomeArg,
    },
    /// Print what the next cycle would do for an application, as JSON.
    Evaluate {
        application: String,
    },
    /// Cancel (part of) the change an instance is rolling out.
    Cancel {
        application: String,

        #[arg(long, default_value = "default")]
        instance: String,

        /// all, platform, revision, pin or versions.
        #[arg(long, default_value = "all")]
        scope: CancelScope,
    },
    /// Stop automatic triggering of a job for a while.
    Pause {
        application: String,

        #[arg(long, default_value = "default")]
        instance: String,

        #[arg(long)]
        job: JobType,

        /// How long to pause, e.g. 2h.
        #[arg(long, value_parser = parse_duration)]
        duration: Duration,
    },
    /// Resume automatic triggering of a paused job.
    Resume {
        application: String,

        #[arg(long, default_value = "default")]
        instance: String,

        #[arg(long)]
        job: JobType,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ConfidenceArg {
    Broken,
    Low,
    Normal,
    High,
}

impl From<ConfidenceArg> for Confidence {
    fn from(arg: ConfidenceArg) -> Self {
        match arg {
            ConfidenceArg::Broken => Self::Broken,
            ConfidenceArg::Low => Self::Low,
            ConfidenceArg::Normal => Self::Normal,
            ConfidenceArg::High => Self::High,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Success,
    /// Deployment to the zone failed.
    DeploymentFailed,
    InstallationFailed,
    TestsFailed,
    Error,
    Aborted,
    OutOfCapacity,
}

impl From<OutcomeArg> for RunStatus {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Success => Self::Success,
            OutcomeArg::DeploymentFailed => Self::Failed(FailureKind::Deployment),
            OutcomeArg::InstallationFailed => Self::Failed(FailureKind::Installation),
            OutcomeArg::TestsFailed => Self::Failed(FailureKind::Tests),
            OutcomeArg::Error => Self::Failed(FailureKind::Error),
            OutcomeArg::Aborted => Self::Aborted,
            OutcomeArg::OutOfCapacity => Self::OutOfCapacity,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,warpd=debug,warpgrid=debug"));
    // Logs go to stderr; stdout carries command output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Command::Run {
            interval,
            test_capacity,
            run_duration,
            once,
        } => {
            if let Some(interval) = interval {
                config.orchestrator.interval = interval;
            }
            if let Some(capacity) = test_capacity {
                anyhow::ensure!(capacity > 0, "--test-capacity must be at least 1");
                config.orchestrator.test_capacity = capacity;
            }
            if let Some(run_duration) = run_duration {
                config.run_duration = run_duration;
            }
            commands::run(&config, once).await
        }
        Command::Validate { spec } => commands::validate(&spec),
        Command::Submit {
            application,
            build,
            spec,
        } => commands::submit(&config, &application, build, spec.as_deref()).await,
        Command::ReleaseVersion {
            version,
            confidence,
        } => commands::release_version(&config, version, confidence.into()),
        Command::Report {
            application,
            instance,
            job,
            run,
            outcome,
        } => commands::report(&config, &application, JobId::new(&instance, job), run, outcome.into()).await,
        Command::Evaluate { application } => commands::evaluate(&config, &application),
        Command::Cancel {
            application,
            instance,
            scope,
        } => commands::cancel(&config, &application, &instance, scope).await,
        Command::Pause {
            application,
            instance,
            job,
            duration,
        } => commands::pause(&config, &application, &JobId::new(&instance, job), duration).await,
        Command::Resume {
            application,
            instance,
            job,
        } => commands::resume(&config, &application, &JobId::new(&instance, job)).await,
    }
}
