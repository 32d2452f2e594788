//! The deployment spec: a recursive tree of rollout steps.
//!
//! An application's spec holds one or more instances, optionally grouped in
//! parallel. Each instance lists its own steps (region deployments,
//! production tests, delays, declared test environments, parallel groups)
//! together with its upgrade, rollout and revision policies and its change
//! blockers. A spec is validated once when built, so the rollout engine can
//! assume it is well formed.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{SpecError, SpecResult};
use crate::types::{InstanceName, RegionName};

/// Which platform versions an instance upgrades to automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradePolicy {
    /// Upgrades as soon as a version is released, before confidence is known.
    Canary,
    /// Upgrades once a version has normal confidence.
    #[default]
    Default,
    /// Upgrades only to versions with high confidence.
    Conservative,
}

/// How platform and revision changes travel through an instance together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutPolicy {
    /// Whichever change reaches a step first proceeds alone.
    #[default]
    Separate,
    /// Platform may run ahead, but the next step joins both changes.
    Leading,
    /// Both changes are joined from the first step.
    Simultaneous,
}

/// When a newer revision may replace the one currently rolling out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionPolicy {
    /// Wait until the current revision has rolled out.
    #[default]
    Separate,
    /// Always roll out the latest revision.
    Latest,
}

macro_rules! policy_from_str {
    ($ty:ty { $($name:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = SpecError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(SpecError::InvalidPolicy(other.to_string())),
                }
            }
        }
    };
}

policy_from_str!(UpgradePolicy {
    "canary" => UpgradePolicy::Canary,
    "default" => UpgradePolicy::Default,
    "conservative" => UpgradePolicy::Conservative,
});

policy_from_str!(RolloutPolicy {
    "separate" => RolloutPolicy::Separate,
    "leading" => RolloutPolicy::Leading,
    "simultaneous" => RolloutPolicy::Simultaneous,
});

policy_from_str!(RevisionPolicy {
    "separate" => RevisionPolicy::Separate,
    "latest" => RevisionPolicy::Latest,
});

/// A recurring weekly time window at a fixed UTC offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub days: Vec<Weekday>,
    /// Hours of the day, `0..=23`, in the window's local time.
    pub hours: Vec<u32>,
    pub utc_offset_secs: i32,
}

impl BlockWindow {
    pub fn new(days: Vec<Weekday>, hours: Vec<u32>, utc_offset_secs: i32) -> SpecResult<Self> {
        if days.is_empty() {
            return Err(SpecError::InvalidWindow("no days given".into()));
        }
        if hours.is_empty() {
            return Err(SpecError::InvalidWindow("no hours given".into()));
        }
        if let Some(hour) = hours.iter().find(|hour| **hour > 23) {
            return Err(SpecError::InvalidWindow(format!("hour {hour} is out of range")));
        }
        if FixedOffset::east_opt(utc_offset_secs).is_none() {
            return Err(SpecError::InvalidWindow(format!(
                "utc offset of {utc_offset_secs}s is out of range"
            )));
        }
        Ok(Self {
            days,
            hours,
            utc_offset_secs,
        })
    }

    /// Whether the given instant falls inside this window.
    pub fn includes(&self, instant: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_secs) else {
            return false;
        };
        let local = instant.with_timezone(&offset);
        self.days.contains(&local.weekday()) && self.hours.contains(&local.hour())
    }
}

/// Blocks automatic platform and/or revision changes during a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBlocker {
    pub blocks_platform: bool,
    pub blocks_revision: bool,
    pub window: BlockWindow,
}

/// One node of the deployment spec tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Instance(InstanceSpec),
    /// A declared system test, replacing the instance's implicit one.
    SystemTest,
    /// A declared staging test, replacing the instance's implicit one.
    StagingTest,
    Region { region: RegionName, active: bool },
    /// Verification of a region which was deployed earlier in the instance.
    Test { region: RegionName },
    Delay(Duration),
    /// Steps that run one after another.
    Steps(Vec<Step>),
    /// Steps that run side by side; the group completes when all do.
    Parallel(Vec<Step>),
}

impl Step {
    pub fn region(region: &str) -> Self {
        Self::Region {
            region: region.to_string(),
            active: true,
        }
    }

    pub fn test(region: &str) -> Self {
        Self::Test {
            region: region.to_string(),
        }
    }

    /// Visit this step and all nested steps in declaration order.
    pub fn visit<'a>(&'a self, visitor: &mut impl FnMut(&'a Step)) {
        visitor(self);
        let nested: &'a [Step] = match self {
            Self::Instance(instance) => &instance.steps,
            Self::Steps(steps) | Self::Parallel(steps) => steps,
            _ => &[],
        };
        for step in nested {
            step.visit(&mut *visitor);
        }
    }
}

/// Rollout configuration of one instance of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: InstanceName,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub upgrade_policy: UpgradePolicy,
    #[serde(default)]
    pub rollout: RolloutPolicy,
    #[serde(default)]
    pub revision_policy: RevisionPolicy,
    #[serde(default)]
    pub change_blockers: Vec<ChangeBlocker>,
}

impl InstanceSpec {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps,
            upgrade_policy: UpgradePolicy::default(),
            rollout: RolloutPolicy::default(),
            revision_policy: RevisionPolicy::default(),
            change_blockers: Vec::new(),
        }
    }

    pub fn with_upgrade_policy(mut self, policy: UpgradePolicy) -> Self {
        self.upgrade_policy = policy;
        self
    }

    pub fn with_rollout(mut self, rollout: RolloutPolicy) -> Self {
        self.rollout = rollout;
        self
    }

    pub fn with_revision_policy(mut self, policy: RevisionPolicy) -> Self {
        self.revision_policy = policy;
        self
    }

    pub fn with_blocker(mut self, blocker: ChangeBlocker) -> Self {
        self.change_blockers.push(blocker);
        self
    }

    /// Whether this instance has any production steps at all.
    pub fn concerns_production(&self) -> bool {
        let mut production = false;
        for step in &self.steps {
            step.visit(&mut |s| {
                production |= matches!(s, Step::Region { .. } | Step::Test { .. });
            });
        }
        production
    }

    fn validate(&self) -> SpecResult<()> {
        let mut deployed: HashSet<&str> = HashSet::new();
        let mut tested: HashSet<&str> = HashSet::new();
        let mut error = None;
        for step in &self.steps {
            step.visit(&mut |s| {
                if error.is_some() {
                    return;
                }
                error = match s {
                    Step::Instance(nested) => Some(SpecError::InvalidStep(format!(
                        "instance '{}' is nested inside instance '{}'",
                        nested.name, self.name
                    ))),
                    Step::Region { region, .. } if !deployed.insert(region.as_str()) => {
                        Some(SpecError::DuplicateRegion {
                            instance: self.name.clone(),
                            region: region.clone(),
                        })
                    }
                    Step::Test { region } if !deployed.contains(region.as_str()) => {
                        Some(SpecError::TestBeforeDeployment {
                            instance: self.name.clone(),
                            region: region.clone(),
                        })
                    }
                    Step::Test { region } if !tested.insert(region.as_str()) => Some(SpecError::DuplicateTest {
                        instance: self.name.clone(),
                        region: region.clone(),
                    }),
                    _ => None,
                };
            });
        }
        if let Some(error) = error {
            return Err(error);
        }
        validate_blockers(&self.change_blockers, |b| b.blocks_platform, "platform upgrades")?;
        validate_blockers(&self.change_blockers, |b| b.blocks_revision, "revision changes")
    }
}

/// Rejects blocker sets which together cover every hour of the week, as such
/// an axis could never advance again.
fn validate_blockers(
    blockers: &[ChangeBlocker],
    blocks: impl Fn(&ChangeBlocker) -> bool,
    axis: &str,
) -> SpecResult<()> {
    let relevant: Vec<_> = blockers.iter().filter(|b| blocks(b)).collect();
    if relevant.is_empty() {
        return Ok(());
    }
    // 2024-01-01 was a Monday; any full week will do.
    let start = DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap_or_default();
    let always_blocked = (0..7 * 24)
        .map(|hour| start + chrono::TimeDelta::hours(hour))
        .all(|instant| relevant.iter().any(|b| b.window.includes(instant)));
    if always_blocked {
        return Err(SpecError::InvalidWindow(format!(
            "change blockers block {axis} at all times"
        )));
    }
    Ok(())
}

/// The validated deployment spec of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    steps: Vec<Step>,
}

impl DeploymentSpec {
    /// Builds a spec from its top-level steps, which run in order.
    pub fn new(steps: Vec<Step>) -> SpecResult<Self> {
        let spec = Self { steps };
        spec.validate()?;
        Ok(spec)
    }

    /// A spec with a single instance.
    pub fn single(instance: InstanceSpec) -> SpecResult<Self> {
        Self::new(vec![Step::Instance(instance)])
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.instances().is_empty()
    }

    /// All instances, in declaration order.
    pub fn instances(&self) -> Vec<&InstanceSpec> {
        let mut instances = Vec::new();
        for step in &self.steps {
            step.visit(&mut |s| {
                if let Step::Instance(instance) = s {
                    instances.push(instance);
                }
            });
        }
        instances
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceSpec> {
        self.instances().into_iter().find(|i| i.name == name)
    }

    pub fn instance_names(&self) -> Vec<InstanceName> {
        self.instances().iter().map(|i| i.name.clone()).collect()
    }

    fn validate(&self) -> SpecResult<()> {
        let mut names = HashSet::new();
        for step in &self.steps {
            validate_top_level(step)?;
        }
        for instance in self.instances() {
            if instance.name.is_empty() {
                return Err(SpecError::InvalidStep("instance without a name".into()));
            }
            if !names.insert(instance.name.as_str()) {
                return Err(SpecError::DuplicateInstance(instance.name.clone()));
            }
            instance.validate()?;
        }
        Ok(())
    }
}

fn validate_top_level(step: &Step) -> SpecResult<()> {
    match step {
        Step::Region { region, .. } | Step::Test { region } => Err(SpecError::InvalidStep(
            format!("region '{region}' must be declared inside an instance"),
        )),
        Step::Steps(steps) | Step::Parallel(steps) => steps.iter().try_for_each(validate_top_level),
        _ => Ok(()),
    }
}

impl fmt::Display for UpgradePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Canary => "canary",
            Self::Default => "default",
            Self::Conservative => "conservative",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(days: Vec<Weekday>, hours: Vec<u32>) -> BlockWindow {
        BlockWindow::new(days, hours, 0).unwrap()
    }

    #[test]
    fn window_respects_offset() {
        // Tuesday 17:30 UTC is Tuesday 18:30 at +01:00.
        let instant = DateTime::parse_from_rfc3339("2017-09-26T17:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let utc = window(vec![Weekday::Tue], vec![18]);
        let cet = BlockWindow::new(vec![Weekday::Tue], vec![18], 3600).unwrap();
        assert!(!utc.includes(instant));
        assert!(cet.includes(instant));
    }

    #[test]
    fn rejects_region_tested_before_deployment() {
        let instance = InstanceSpec::new("default", vec![Step::test("a"), Step::region("a")]);
        assert_eq!(
            DeploymentSpec::single(instance),
            Err(SpecError::TestBeforeDeployment {
                instance: "default".into(),
                region: "a".into()
            })
        );
    }

    #[test]
    fn rejects_duplicate_regions_and_instances() {
        let instance = InstanceSpec::new("default", vec![Step::region("a"), Step::region("a")]);
        assert!(matches!(
            DeploymentSpec::single(instance),
            Err(SpecError::DuplicateRegion { .. })
        ));

        let twice = DeploymentSpec::new(vec![
            Step::Instance(InstanceSpec::new("beta", vec![])),
            Step::Instance(InstanceSpec::new("beta", vec![])),
        ]);
        assert_eq!(twice, Err(SpecError::DuplicateInstance("beta".into())));
    }

    #[test]
    fn rejects_permanent_blockers() {
        let all_days = vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        let instance = InstanceSpec::new("default", vec![Step::region("a")]).with_blocker(ChangeBlocker {
            blocks_platform: true,
            blocks_revision: false,
            window: window(all_days, (0..24).collect()),
        });
        assert!(matches!(
            DeploymentSpec::single(instance),
            Err(SpecError::InvalidWindow(_))
        ));
    }

    #[test]
    fn lists_instances_in_parallel_groups() {
        let spec = DeploymentSpec::new(vec![
            Step::Instance(InstanceSpec::new("canary", vec![Step::region("a")])),
            Step::Parallel(vec![
                Step::Instance(InstanceSpec::new("blue", vec![Step::region("b")])),
                Step::Instance(InstanceSpec::new("green", vec![Step::region("b")])),
            ]),
        ])
        .unwrap();
        assert_eq!(spec.instance_names(), vec!["canary", "blue", "green"]);
        assert_eq!(spec.instance("green").unwrap().steps, vec![Step::region("b")]);
    }
}
