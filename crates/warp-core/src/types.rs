//! Shared types used across WarpGrid crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use semver::Version;

/// Application identifier, `{tenant}.{application}`.
pub type ApplicationId = String;

/// Name of an instance of an application, e.g. `default` or `beta`.
pub type InstanceName = String;

/// Name of a production region, e.g. `us-west-1`.
pub type RegionName = String;

/// Identifies a built application artifact by its build number.
///
/// Build numbers increase monotonically per application. Build `0` is the
/// "unknown" sentinel, used where no revision has been deployed or submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionId {
    pub build: u64,
}

impl RevisionId {
    pub const UNKNOWN: RevisionId = RevisionId { build: 0 };

    pub fn new(build: u64) -> Self {
        Self { build }
    }

    pub fn is_unknown(&self) -> bool {
        self.build == 0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "unknown")
        } else {
            write!(f, "build-{}", self.build)
        }
    }
}

/// Where a revision was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevision {
    pub repository: String,
    pub branch: String,
    pub commit: String,
}

/// A submitted application revision with its build metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRevision {
    pub id: RevisionId,
    pub source: Option<SourceRevision>,
    pub submitted_at: DateTime<Utc>,
}

impl ApplicationRevision {
    pub fn new(build: u64, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: RevisionId::new(build),
            source: None,
            submitted_at,
        }
    }

    pub fn with_source(mut self, source: SourceRevision) -> Self {
        self.source = Some(source);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_revision_sorts_first() {
        assert!(RevisionId::UNKNOWN < RevisionId::new(1));
        assert!(RevisionId::UNKNOWN.is_unknown());
        assert_eq!(RevisionId::UNKNOWN.to_string(), "unknown");
        assert_eq!(RevisionId::new(42).to_string(), "build-42");
    }
}
