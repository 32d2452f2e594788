//! deployment.toml parser.
//!
//! A minimal spec with one instance:
//!
//! ```toml
//! [[instance]]
//! name = "default"
//! upgrade-policy = "canary"
//!
//! [[instance.step]]
//! region = "us-west-1"
//!
//! [[instance.step]]
//! delay = "1h"
//!
//! [[instance.step]]
//! parallel = [{ region = "us-east-3" }, { region = "eu-west-1" }]
//!
//! [[instance.block-change]]
//! revision = true
//! days = "mon-fri"
//! hours = "16-23"
//! time-zone = "+01:00"
//! ```
//!
//! Instances may instead be listed as top-level `[[step]]` entries, which
//! also accept `parallel`, `steps` and `delay` to group instances.

use std::path::Path;
use std::time::Duration;

use chrono::Weekday;
use serde::Deserialize;

use crate::error::{SpecError, SpecResult};
use crate::spec::{
    BlockWindow, ChangeBlocker, DeploymentSpec, InstanceSpec, RevisionPolicy, RolloutPolicy, Step,
    UpgradePolicy,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawSpec {
    upgrade_policy: Option<String>,
    rollout: Option<String>,
    revision: Option<String>,
    #[serde(default)]
    instance: Vec<RawInstance>,
    #[serde(default)]
    step: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawInstance {
    name: String,
    upgrade_policy: Option<String>,
    rollout: Option<String>,
    revision: Option<String>,
    #[serde(default)]
    step: Vec<RawStep>,
    #[serde(default)]
    block_change: Vec<RawBlocker>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawStep {
    instance: Option<RawInstance>,
    region: Option<String>,
    active: Option<bool>,
    test: Option<String>,
    delay: Option<String>,
    parallel: Option<Vec<RawStep>>,
    steps: Option<Vec<RawStep>>,
    system_test: Option<bool>,
    staging_test: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawBlocker {
    #[serde(default)]
    revision: bool,
    #[serde(default)]
    version: bool,
    days: String,
    hours: String,
    time_zone: Option<String>,
}

/// Policies inherited by instances which don't declare their own.
#[derive(Clone, Copy, Default)]
struct Defaults {
    upgrade_policy: UpgradePolicy,
    rollout: RolloutPolicy,
    revision_policy: RevisionPolicy,
}

impl DeploymentSpec {
    /// Read and validate a `deployment.toml` file.
    pub fn from_file(path: &Path) -> SpecResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SpecError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a spec from TOML text.
    pub fn from_toml(content: &str) -> SpecResult<Self> {
        let raw: RawSpec = toml::from_str(content).map_err(|e| SpecError::Parse(e.to_string()))?;
        let defaults = Defaults {
            upgrade_policy: parse_policy(raw.upgrade_policy.as_deref())?,
            rollout: parse_policy(raw.rollout.as_deref())?,
            revision_policy: parse_policy(raw.revision.as_deref())?,
        };

        let steps = match (raw.instance.is_empty(), raw.step.is_empty()) {
            (false, false) => {
                return Err(SpecError::InvalidStep(
                    "use either [[instance]] or [[step]] at the top level, not both".into(),
                ));
            }
            (false, true) => raw
                .instance
                .into_iter()
                .map(|instance| convert_instance(instance, defaults).map(Step::Instance))
                .collect::<SpecResult<Vec<_>>>()?,
            _ => raw
                .step
                .into_iter()
                .map(|step| convert_step(step, defaults, true))
                .collect::<SpecResult<Vec<_>>>()?,
        };
        DeploymentSpec::new(steps)
    }
}

fn parse_policy<T: std::str::FromStr<Err = SpecError> + Default>(value: Option<&str>) -> SpecResult<T> {
    value.map_or_else(|| Ok(T::default()), str::parse)
}

fn convert_instance(raw: RawInstance, defaults: Defaults) -> SpecResult<InstanceSpec> {
    let steps = raw
        .step
        .into_iter()
        .map(|step| convert_step(step, defaults, false))
        .collect::<SpecResult<Vec<_>>>()?;
    let change_blockers = raw
        .block_change
        .into_iter()
        .map(convert_blocker)
        .collect::<SpecResult<Vec<_>>>()?;
    Ok(InstanceSpec {
        name: raw.name,
        steps,
        upgrade_policy: raw
            .upgrade_policy
            .as_deref()
            .map_or(Ok(defaults.upgrade_policy), str::parse)?,
        rollout: raw
            .rollout
            .as_deref()
            .map_or(Ok(defaults.rollout), str::parse)?,
        revision_policy: raw
            .revision
            .as_deref()
            .map_or(Ok(defaults.revision_policy), str::parse)?,
        change_blockers,
    })
}

fn convert_step(raw: RawStep, defaults: Defaults, top_level: bool) -> SpecResult<Step> {
    let kinds = [
        raw.instance.is_some(),
        raw.region.is_some(),
        raw.test.is_some(),
        raw.delay.is_some(),
        raw.parallel.is_some(),
        raw.steps.is_some(),
        raw.system_test.is_some(),
        raw.staging_test.is_some(),
    ];
    if kinds.iter().filter(|k| **k).count() != 1 {
        return Err(SpecError::InvalidStep(format!(
            "a step must declare exactly one of instance, region, test, delay, parallel, steps, \
             system-test or staging-test: {raw:?}"
        )));
    }
    if raw.active.is_some() && raw.region.is_none() {
        return Err(SpecError::InvalidStep("'active' only applies to region steps".into()));
    }

    let nested = |steps: Vec<RawStep>| {
        steps
            .into_iter()
            .map(|step| convert_step(step, defaults, top_level))
            .collect::<SpecResult<Vec<_>>>()
    };

    if let Some(instance) = raw.instance {
        if !top_level {
            return Err(SpecError::InvalidStep(format!(
                "instance '{}' must be declared at the top level",
                instance.name
            )));
        }
        return convert_instance(instance, defaults).map(Step::Instance);
    }
    if let Some(region) = raw.region {
        return Ok(Step::Region {
            region,
            active: raw.active.unwrap_or(true),
        });
    }
    if let Some(region) = raw.test {
        return Ok(Step::Test { region });
    }
    if let Some(delay) = raw.delay {
        return parse_duration(&delay).map(Step::Delay);
    }
    if let Some(steps) = raw.parallel {
        return nested(steps).map(Step::Parallel);
    }
    if let Some(steps) = raw.steps {
        return nested(steps).map(Step::Steps);
    }
    if raw.system_test == Some(true) {
        return Ok(Step::SystemTest);
    }
    if raw.staging_test == Some(true) {
        return Ok(Step::StagingTest);
    }
    Err(SpecError::InvalidStep(
        "system-test and staging-test steps must be set to true".into(),
    ))
}

fn convert_blocker(raw: RawBlocker) -> SpecResult<ChangeBlocker> {
    if !raw.revision && !raw.version {
        return Err(SpecError::InvalidWindow(
            "a change blocker must block revision, version or both".into(),
        ));
    }
    let window = BlockWindow::new(
        parse_days(&raw.days)?,
        parse_hours(&raw.hours)?,
        parse_utc_offset(raw.time_zone.as_deref().unwrap_or("UTC"))?,
    )?;
    Ok(ChangeBlocker {
        blocks_platform: raw.version,
        blocks_revision: raw.revision,
        window,
    })
}

/// Parse a human-readable duration such as `30s`, `10m`, `2h` or `1d`.
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> SpecResult<Duration> {
    let s = s.trim();
    let invalid = || SpecError::InvalidDuration(s.to_string());
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((index, _)) => s.split_at(index),
        None => (s, "s"),
    };
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Parse days such as `mon-fri` or `sat,sun`.
pub fn parse_days(s: &str) -> SpecResult<Vec<Weekday>> {
    let mut days = Vec::new();
    parse_ranges(s, |token| {
        token
            .parse::<Weekday>()
            .map(|day| day.num_days_from_monday())
            .map_err(|_| SpecError::InvalidWindow(format!("invalid day '{token}'")))
    })?
    .into_iter()
    .for_each(|index| {
        let mut day = Weekday::Mon;
        for _ in 0..index {
            day = day.succ();
        }
        days.push(day);
    });
    Ok(days)
}

/// Parse hours such as `0-8` or `9,12,16-17`.
pub fn parse_hours(s: &str) -> SpecResult<Vec<u32>> {
    parse_ranges(s, |token| {
        token
            .parse::<u32>()
            .ok()
            .filter(|hour| *hour < 24)
            .ok_or_else(|| SpecError::InvalidWindow(format!("invalid hour '{token}'")))
    })
}

fn parse_ranges(s: &str, parse: impl Fn(&str) -> SpecResult<u32>) -> SpecResult<Vec<u32>> {
    let mut values = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (from, to) = match part.split_once('-') {
            Some((from, to)) => (parse(from.trim())?, parse(to.trim())?),
            None => {
                let value = parse(part)?;
                (value, value)
            }
        };
        if from > to {
            return Err(SpecError::InvalidWindow(format!("range '{part}' is reversed")));
        }
        for value in from..=to {
            if !values.contains(&value) {
                values.push(value);
            }
        }
    }
    if values.is_empty() {
        return Err(SpecError::InvalidWindow(format!("empty range '{s}'")));
    }
    Ok(values)
}

/// Parse a fixed UTC offset: `UTC`, `Z`, `+01:00` or `-0530`.
pub fn parse_utc_offset(s: &str) -> SpecResult<i32> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("utc") || s == "Z" {
        return Ok(0);
    }
    let invalid = || SpecError::InvalidWindow(format!("invalid time zone '{s}'"));
    let (sign, rest) = match s.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    Ok(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;

    #[test]
    fn parses_instances_with_nested_steps() {
        let spec = DeploymentSpec::from_toml(
            r#"
upgrade-policy = "conservative"

[[instance]]
name = "beta"
rollout = "leading"

[[instance.step]]
region = "us-east-3"

[[instance.step]]
test = "us-east-3"

[[instance.step]]
delay = "1h"

[[instance.step]]
parallel = [{ region = "us-west-1" }, { steps = [{ region = "eu-west-1" }, { delay = "30m" }] }]

[[instance]]
name = "default"
upgrade-policy = "canary"

[[instance.step]]
region = "us-central-1"
"#,
        )
        .unwrap();

        let beta = spec.instance("beta").unwrap();
        assert_eq!(beta.upgrade_policy, UpgradePolicy::Conservative);
        assert_eq!(beta.rollout, RolloutPolicy::Leading);
        assert_eq!(beta.steps.len(), 4);
        assert_eq!(beta.steps[0], Step::region("us-east-3"));
        assert_eq!(beta.steps[2], Step::Delay(Duration::from_secs(3600)));

        let default = spec.instance("default").unwrap();
        assert_eq!(default.upgrade_policy, UpgradePolicy::Canary);
        assert_eq!(default.rollout, RolloutPolicy::Separate);
        assert_eq!(spec.instance_names(), vec!["beta", "default"]);
    }

    #[test]
    fn parses_parallel_instances() {
        let spec = DeploymentSpec::from_toml(
            r#"
[[step]]
instance = { name = "canary", step = [{ region = "us-east-3" }] }

[[step]]
parallel = [
    { instance = { name = "blue", step = [{ region = "us-west-1" }] } },
    { instance = { name = "green", step = [{ region = "eu-west-1" }] } },
]
"#,
        )
        .unwrap();
        assert_eq!(spec.instance_names(), vec!["canary", "blue", "green"]);
        assert!(matches!(spec.steps()[1], Step::Parallel(_)));
    }

    #[test]
    fn parses_change_blockers() {
        let spec = DeploymentSpec::from_toml(
            r#"
[[instance]]
name = "default"
step = [{ region = "us-west-1" }]

[[instance.block-change]]
revision = true
days = "tue"
hours = "18-19"
time-zone = "UTC"

[[instance.block-change]]
version = true
days = "sat,sun"
hours = "0-23"
time-zone = "+01:00"
"#,
        )
        .unwrap();
        let blockers = &spec.instance("default").unwrap().change_blockers;
        assert_eq!(blockers.len(), 2);
        assert!(blockers[0].blocks_revision && !blockers[0].blocks_platform);
        assert_eq!(blockers[0].window.hours, vec![18, 19]);
        assert_eq!(blockers[1].window.days, vec![Weekday::Sat, Weekday::Sun]);
        assert_eq!(blockers[1].window.utc_offset_secs, 3600);
    }

    #[test]
    fn rejects_misconfigured_specs() {
        let ambiguous = r#"
[[instance]]
name = "default"
step = [{ region = "a", test = "a" }]
"#;
        assert!(matches!(
            DeploymentSpec::from_toml(ambiguous),
            Err(SpecError::InvalidStep(_))
        ));

        let untested = r#"
[[instance]]
name = "default"
step = [{ test = "a" }]
"#;
        assert!(matches!(
            DeploymentSpec::from_toml(untested),
            Err(SpecError::TestBeforeDeployment { .. })
        ));

        let bad_policy = r#"
rollout = "sometimes"
"#;
        assert_eq!(
            DeploymentSpec::from_toml(bad_policy),
            Err(SpecError::InvalidPolicy("sometimes".into()))
        );
    }

    #[test]
    fn empty_document_is_an_empty_spec() {
        let spec = DeploymentSpec::from_toml("").unwrap();
        assert!(spec.is_empty());
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn parse_window_values() {
        assert_eq!(
            parse_days("mon-wed,fri").unwrap(),
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Fri]
        );
        assert_eq!(parse_hours("0-2,22").unwrap(), vec![0, 1, 2, 22]);
        assert!(parse_hours("20-4").is_err());
        assert!(parse_hours("24").is_err());
        assert_eq!(parse_utc_offset("-05:30").unwrap(), -(5 * 3600 + 30 * 60));
        assert!(parse_utc_offset("Europe/Oslo").is_err());
    }

    #[test]
    fn declared_test_steps_parse() {
        let spec = DeploymentSpec::from_toml(
            r#"
[[instance]]
name = "default"
step = [{ system-test = true }, { region = "a" }]
"#,
        )
        .unwrap();
        assert_eq!(spec.instance("default").unwrap().steps[0], Step::SystemTest);
        assert!(JobType::SystemTest.is_test_environment());
    }
}
