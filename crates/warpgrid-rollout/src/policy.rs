//! Platform/revision joining.
//!
//! When an instance's change carries both a platform and a revision, each
//! job decides whether to run them together or one after the other. The
//! decision depends on the instance's [`RolloutPolicy`] and on when each
//! axis became ready for the job:
//!
//! - `separate`: whichever axis got to the job first keeps going alone
//! - `leading`: the platform may run ahead, but the axes join once both
//!   are ready
//! - `simultaneous`: the axes start joined, and the revision may then run
//!   ahead of the platform

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warp_core::RolloutPolicy;
use warpgrid_state::{Change, Deployment};

/// How a dual change is split into consecutive runs of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// One run with both axes.
    Together,
    /// The platform alone, then both.
    PlatformFirst,
    /// The revision alone, then both.
    RevisionFirst,
}

impl Split {
    /// The changes to run, in order.
    pub fn changes(self, change: &Change) -> Vec<Change> {
        match self {
            Self::Together => vec![change.clone()],
            Self::PlatformFirst => vec![change.without_revision(), change.clone()],
            Self::RevisionFirst => vec![change.without_platform(), change.clone()],
        }
    }
}

/// Split for a deployment job, given when each axis alone had all its
/// dependencies completed. `failing` tells whether the job is failing.
pub fn split_deployment(
    rollout: RolloutPolicy,
    platform_ready: Option<DateTime<Utc>>,
    revision_ready: Option<DateTime<Utc>>,
    failing: bool,
) -> Split {
    let (platform, revision) = match (platform_ready, revision_ready) {
        // Neither is ready yet, so guess from the policy.
        (None, None) => {
            return match rollout {
                RolloutPolicy::Separate => Split::PlatformFirst,
                RolloutPolicy::Leading => Split::Together,
                RolloutPolicy::Simultaneous => Split::RevisionFirst,
            };
        }
        (None, Some(_)) => return Split::RevisionFirst,
        (Some(_), None) => return Split::PlatformFirst,
        (Some(platform), Some(revision)) => (platform, revision),
    };
    match rollout {
        RolloutPolicy::Separate => {
            // Nothing ran yet when the platform is ready at the epoch; it counts as first.
            if platform < revision || platform == DateTime::UNIX_EPOCH {
                if failing { Split::Together } else { Split::PlatformFirst }
            } else if revision < platform {
                Split::RevisionFirst
            } else {
                Split::Together
            }
        }
        RolloutPolicy::Leading => Split::Together,
        RolloutPolicy::Simultaneous => {
            if platform < revision {
                Split::Together
            } else {
                Split::RevisionFirst
            }
        }
    }
}

/// Split for a production verification job, based on what its zone has
/// deployed. `None` means the deployment's rules apply.
///
/// `caught_up` is set when the zone's deployment job is ready for both
/// axes; `failing` is only consulted under the `separate` policy then.
pub fn split_verification(
    rollout: RolloutPolicy,
    platform_deployed: bool,
    revision_deployed: bool,
    caught_up: bool,
    failing: impl FnOnce() -> bool,
) -> Option<Split> {
    match (platform_deployed, revision_deployed) {
        (false, true) => Some(Split::RevisionFirst),
        (true, false) if !caught_up => Some(Split::PlatformFirst),
        (true, false) => Some(match rollout {
            // Keep verifying the upgrade alone, unless something between the
            // deployment and this test fails on it.
            RolloutPolicy::Separate => {
                if failing() { Split::Together } else { Split::PlatformFirst }
            }
            RolloutPolicy::Leading => Split::Together,
            RolloutPolicy::Simultaneous => Split::RevisionFirst,
        }),
        _ => None,
    }
}

/// Where an instance is with its platform and revision axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutState {
    /// No change in progress.
    Idle,
    PlatformOnly,
    RevisionOnly,
    /// Both axes travel through the same jobs.
    Joined,
    /// Some zones run the new platform on an old revision.
    #[serde(rename = "platform-leading-revision-catching-up")]
    PlatformLeading,
    /// Some zones run the new revision on an old platform.
    #[serde(rename = "revision-leading-platform-catching-up")]
    RevisionLeading,
}

impl RolloutState {
    /// Classify an instance from its change and current deployments.
    pub fn of<'a>(change: &Change, deployments: impl IntoIterator<Item = &'a Deployment>) -> Self {
        let (platform, revision) = match (change.platform(), change.revision()) {
            (None, None) => return Self::Idle,
            (Some(_), None) => return Self::PlatformOnly,
            (None, Some(_)) => return Self::RevisionOnly,
            (Some(platform), Some(revision)) => (platform, revision),
        };
        let (mut platform_ahead, mut revision_ahead) = (false, false);
        for deployment in deployments {
            let on_platform = deployment.platform == *platform;
            let on_revision = deployment.revision == revision;
            platform_ahead |= on_platform && !on_revision;
            revision_ahead |= on_revision && !on_platform;
        }
        match (platform_ahead, revision_ahead) {
            (true, false) => Self::PlatformLeading,
            (false, true) => Self::RevisionLeading,
            _ => Self::Joined,
        }
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PlatformOnly => "platform only",
            Self::RevisionOnly => "revision only",
            Self::Joined => "joined",
            Self::PlatformLeading => "platform leading, revision catching up",
            Self::RevisionLeading => "revision leading, platform catching up",
        };
        f.write_str(name)
    }
}
