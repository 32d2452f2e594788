//! warpd.toml: daemon configuration.
//!
//! Every field is optional:
//!
//! ```toml
//! data-dir = "/var/lib/warpgrid"
//! interval = "60s"
//! lock-timeout = "10s"
//! test-capacity = 8
//! max-pause = "3d"
//! block-lookahead = "7d"
//! run-duration = "30s"
//!
//! [retry]
//! min-backoff = "10m"
//! max-backoff = "6h"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use warp_core::config::parse_duration;
use warpgrid_rollout::{RetryPolicy, TriggerConfig};
use warpgrid_scheduler::OrchestratorConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    data_dir: Option<PathBuf>,
    interval: Option<String>,
    lock_timeout: Option<String>,
    test_capacity: Option<usize>,
    max_pause: Option<String>,
    block_lookahead: Option<String>,
    run_duration: Option<String>,
    #[serde(default)]
    retry: RawRetry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRetry {
    min_backoff: Option<String>,
    max_backoff: Option<String>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub orchestrator: OrchestratorConfig,
    pub trigger: TriggerConfig,
    /// How long the daemon's simulated runs take before they succeed.
    pub run_duration: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/warpgrid"),
            orchestrator: OrchestratorConfig::default(),
            trigger: TriggerConfig::default(),
            run_duration: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// Read `path`, or use the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        let defaults = Self::default();
        let duration = |value: Option<String>, default: Duration| -> anyhow::Result<Duration> {
            match value {
                Some(value) => Ok(parse_duration(&value)?),
                None => Ok(default),
            }
        };

        let orchestrator = OrchestratorConfig {
            interval: duration(raw.interval, defaults.orchestrator.interval)?,
            lock_timeout: duration(raw.lock_timeout, defaults.orchestrator.lock_timeout)?,
            test_capacity: raw.test_capacity.unwrap_or(defaults.orchestrator.test_capacity),
        };
        let trigger = TriggerConfig {
            retry: RetryPolicy {
                min_backoff: duration(raw.retry.min_backoff, defaults.trigger.retry.min_backoff)?,
                max_backoff: duration(raw.retry.max_backoff, defaults.trigger.retry.max_backoff)?,
            },
            max_pause: duration(raw.max_pause, defaults.trigger.max_pause)?,
            block_lookahead: duration(raw.block_lookahead, defaults.trigger.block_lookahead)?,
        };
        let config = Self {
            data_dir: raw.data_dir.unwrap_or(defaults.data_dir),
            orchestrator,
            trigger,
            run_duration: duration(raw.run_duration, defaults.run_duration)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.orchestrator.interval.is_zero() {
            bail!("interval must be positive");
        }
        if self.orchestrator.test_capacity == 0 {
            bail!("test-capacity must be at least 1");
        }
        if self.trigger.retry.min_backoff > self.trigger.retry.max_backoff {
            bail!("retry min-backoff must not exceed max-backoff");
        }
        Ok(())
    }

    /// The state store file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("warpgrid.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        assert_eq!(DaemonConfig::from_toml("").unwrap(), DaemonConfig::default());
        assert_eq!(DaemonConfig::load(None).unwrap(), DaemonConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            data-dir = "/tmp/warpgrid"
            interval = "30s"
            test-capacity = 2
            max-pause = "1d"
            run-duration = "5s"

            [retry]
            min-backoff = "1m"
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/warpgrid/warpgrid.redb"));
        assert_eq!(config.orchestrator.interval, Duration::from_secs(30));
        assert_eq!(config.orchestrator.test_capacity, 2);
        assert_eq!(config.orchestrator.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.trigger.max_pause, Duration::from_secs(24 * 3600));
        assert_eq!(config.trigger.retry.min_backoff, Duration::from_secs(60));
        assert_eq!(config.trigger.retry.max_backoff, RetryPolicy::default().max_backoff);
        assert_eq!(config.run_duration, Duration::from_secs(5));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(DaemonConfig::from_toml("interval = \"soon\"").is_err());
        assert!(DaemonConfig::from_toml("interval = \"0s\"").is_err());
        assert!(DaemonConfig::from_toml("test-capacity = 0").is_err());
        assert!(DaemonConfig::from_toml("unknown = 1").is_err());
        assert!(DaemonConfig::from_toml("[retry]\nmin-backoff = \"2h\"\nmax-backoff = \"1h\"").is_err());
    }
}
