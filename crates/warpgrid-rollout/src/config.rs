//! Rollout engine tuning.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::backoff::RetryPolicy;

/// Tunables of the decision engine. Defaults match production use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    pub retry: RetryPolicy,
    /// Longest pause an operator may put on a job.
    pub max_pause: Duration,
    /// How far ahead change blocker windows are searched for their end.
    pub block_lookahead: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_pause: Duration::from_secs(3 * 24 * 3600),
            block_lookahead: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// `instant + duration`, saturating at the far future.
pub(crate) fn after(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
