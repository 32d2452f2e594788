//! Platform target selection from the system's version status.

use warp_core::{UpgradePolicy, Version};
use warpgrid_state::{Confidence, VersionStatus};

/// The lowest confidence at which an instance with `policy` upgrades.
pub fn min_confidence(policy: UpgradePolicy) -> Confidence {
    match policy {
        UpgradePolicy::Canary => Confidence::Low,
        UpgradePolicy::Default => Confidence::Normal,
        UpgradePolicy::Conservative => Confidence::High,
    }
}

/// Versions an instance with `policy` may upgrade to: trusted enough, not
/// broken, and not newer than the system version.
pub fn eligible(status: &VersionStatus, policy: UpgradePolicy) -> impl Iterator<Item = &Version> {
    let min = min_confidence(policy);
    status
        .versions
        .iter()
        .filter(move |v| v.confidence != Confidence::Broken && v.confidence >= min)
        .filter(move |v| v.version <= status.system_version)
        .map(|v| &v.version)
}

/// The platform an instance with `policy` should be on.
pub fn target_platform(status: &VersionStatus, policy: UpgradePolicy) -> Option<Version> {
    eligible(status, policy).max().cloned()
}

/// The newest version below `broken` which is not itself broken.
pub fn fallback_below(status: &VersionStatus, broken: &Version) -> Option<Version> {
    status
        .versions
        .iter()
        .filter(|v| v.confidence != Confidence::Broken && v.version < *broken)
        .map(|v| &v.version)
        .max()
        .cloned()
}
