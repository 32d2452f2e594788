//! Pipeline job types.
//!
//! A job is a recurring pipeline stage for one instance. Job types render as
//! short strings (`system-test`, `staging-test`, `production-us-west-1`,
//! `test-us-west-1`) so they can be used directly as keys in persisted maps.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::types::{InstanceName, RegionName};

/// A pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobType {
    /// Functional tests against a fresh deployment of the target versions.
    SystemTest,
    /// Upgrade tests from the source versions to the target versions.
    StagingTest,
    /// Deployment to a production region.
    Production(RegionName),
    /// Verification of a production region after it was deployed.
    Test(RegionName),
}

impl JobType {
    pub fn production(region: &str) -> Self {
        Self::Production(region.to_string())
    }

    pub fn test(region: &str) -> Self {
        Self::Test(region.to_string())
    }

    /// Whether this job runs against a production region, either deploying
    /// to it or verifying it.
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production(_) | Self::Test(_))
    }

    /// Whether this job runs in one of the shared test environments.
    pub fn is_test_environment(&self) -> bool {
        matches!(self, Self::SystemTest | Self::StagingTest)
    }

    /// Whether this job deploys something, as opposed to only verifying a
    /// production region.
    pub fn is_deployment(&self) -> bool {
        !matches!(self, Self::Test(_))
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Production(region) | Self::Test(region) => Some(region),
            Self::SystemTest | Self::StagingTest => None,
        }
    }

    /// The production deployment job in the same region as this job.
    pub fn deployment_job(&self) -> Option<JobType> {
        self.region().map(JobType::production)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemTest => write!(f, "system-test"),
            Self::StagingTest => write!(f, "staging-test"),
            Self::Production(region) => write!(f, "production-{region}"),
            Self::Test(region) => write!(f, "test-{region}"),
        }
    }
}

impl FromStr for JobType {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system-test" => return Ok(Self::SystemTest),
            "staging-test" => return Ok(Self::StagingTest),
            _ => {}
        }
        let job = if let Some(region) = s.strip_prefix("production-") {
            Self::Production(region.to_string())
        } else if let Some(region) = s.strip_prefix("test-") {
            Self::Test(region.to_string())
        } else {
            return Err(SpecError::UnknownJobType(s.to_string()));
        };
        match job.region() {
            Some(region) if !region.is_empty() => Ok(job),
            _ => Err(SpecError::UnknownJobType(s.to_string())),
        }
    }
}

impl From<JobType> for String {
    fn from(job: JobType) -> Self {
        job.to_string()
    }
}

impl TryFrom<String> for JobType {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A job of a specific instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId {
    pub instance: InstanceName,
    pub job_type: JobType,
}

impl JobId {
    pub fn new(instance: &str, job_type: JobType) -> Self {
        Self {
            instance: instance.to_string(),
            job_type,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instance, self.job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_types_parse_from_display() {
        for job in [
            JobType::SystemTest,
            JobType::StagingTest,
            JobType::production("us-west-1"),
            JobType::test("eu-west-1"),
        ] {
            assert_eq!(job.to_string().parse::<JobType>().unwrap(), job);
        }
    }

    #[test]
    fn rejects_unknown_job_types() {
        assert!("deploy-us-west-1".parse::<JobType>().is_err());
        assert!("production-".parse::<JobType>().is_err());
    }

    #[test]
    fn classifies_jobs() {
        assert!(JobType::SystemTest.is_test_environment());
        assert!(JobType::SystemTest.is_deployment());
        assert!(!JobType::SystemTest.is_production());
        assert!(JobType::test("a").is_production());
        assert!(!JobType::test("a").is_deployment());
        assert_eq!(
            JobType::test("a").deployment_job(),
            Some(JobType::production("a"))
        );
    }

    #[test]
    fn job_type_serializes_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(JobType::production("us-east-3"), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"production-us-east-3":1}"#);
        let back: std::collections::BTreeMap<JobType, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
