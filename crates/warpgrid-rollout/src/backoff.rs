//! Retry backoff for failing jobs.
//!
//! The first retry after a failure is immediate. After that, a job waits
//! half the time it has been failing, at least `min_backoff` and at most
//! `max_backoff`, measured from its last completed run.

use std::time::Duration;

use chrono::{DateTime, Utc};

use warpgrid_state::{Change, JobStatus};

use crate::config::delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(10 * 60),
            max_backoff: Duration::from_secs(6 * 3600),
        }
    }
}

impl RetryPolicy {
    /// When a job that started failing at `first_failure`, and last failed
    /// at `last_failure`, may run again.
    pub fn next_attempt(&self, first_failure: DateTime<Utc>, last_failure: DateTime<Utc>) -> DateTime<Utc> {
        if first_failure >= last_failure {
            return last_failure;
        }
        let wait = ((last_failure - first_failure) / 2)
            .max(delta(self.min_backoff))
            .min(delta(self.max_backoff));
        last_failure.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// The instant until which `job` must wait before retrying `change`, if
    /// it is currently cooling down.
    ///
    /// Only failures on the targets of `change` count, and a shared test
    /// environment running out of capacity is never penalized.
    pub fn cooling_down_until(&self, job: &JobStatus, change: &Change, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last = job.last_completed()?;
        let first = job.first_failing()?;
        if change.platform().is_some_and(|platform| *platform != last.versions.target_platform) {
            return None;
        }
        if change.revision().is_some_and(|revision| revision != last.versions.target_revision) {
            return None;
        }
        if job.id.job_type.is_test_environment() && job.is_out_of_capacity() {
            return None;
        }
        let (first_end, last_end) = (first.end?, last.end?);
        if first_end == last_end {
            return Some(last_end);
        }
        Some(self.next_attempt(first_end, last_end)).filter(|until| now < *until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeDelta;
    use warp_core::{JobId, JobType, RevisionId, Version};
    use warpgrid_state::{FailureKind, Run, RunId, RunStatus, Versions};

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + TimeDelta::minutes(minutes)
    }

    fn job(job_type: JobType, outcomes: &[(RunStatus, i64)]) -> JobStatus {
        let id = JobId::new("default", job_type);
        outcomes
            .iter()
            .enumerate()
            .fold(JobStatus::new(id.clone()), |job, (i, (status, end))| {
                let mut run = Run::start(
                    RunId::new(id.clone(), i as u64 + 1),
                    Versions::new(Version::new(1, 0, 0), RevisionId::new(1)),
                    at(*end - 1),
                );
                run.status = *status;
                run.end = Some(at(*end));
                job.with_run(run)
            })
    }

    const FAILED: RunStatus = RunStatus::Failed(FailureKind::Tests);

    #[test]
    fn first_retry_is_immediate() {
        let job = job(JobType::production("a"), &[(FAILED, 100)]);
        assert_eq!(
            RetryPolicy::default().cooling_down_until(&job, &Change::empty(), at(100)),
            Some(at(100))
        );
    }

    #[test]
    fn later_retries_wait_half_the_failing_time() {
        let policy = RetryPolicy::default();
        let job = job(JobType::production("a"), &[(FAILED, 100), (FAILED, 101)]);
        assert_eq!(policy.cooling_down_until(&job, &Change::empty(), at(101)), Some(at(111)));

        let job = job_with_gap(60);
        assert_eq!(policy.cooling_down_until(&job, &Change::empty(), at(160)), Some(at(190)));
        assert_eq!(policy.cooling_down_until(&job, &Change::empty(), at(190)), None);
    }

    fn job_with_gap(gap: i64) -> JobStatus {
        job(JobType::production("a"), &[(FAILED, 100), (FAILED, 100 + gap)])
    }

    #[test]
    fn backoff_never_shrinks_and_is_capped() {
        let policy = RetryPolicy::default();
        let mut previous = TimeDelta::zero();
        for elapsed in [1, 5, 30, 120, 600, 6000] {
            let wait = policy.next_attempt(at(0), at(elapsed)) - at(elapsed);
            assert!(wait >= previous);
            assert!(wait <= TimeDelta::hours(6));
            previous = wait;
        }
        assert_eq!(previous, TimeDelta::hours(6));
    }

    #[test]
    fn success_resets_backoff() {
        let job = job(
            JobType::production("a"),
            &[(FAILED, 100), (RunStatus::Success, 110), (FAILED, 120)],
        );
        assert_eq!(
            RetryPolicy::default().cooling_down_until(&job, &Change::empty(), at(120)),
            Some(at(120))
        );
    }

    #[test]
    fn failures_on_other_targets_do_not_count() {
        let job = job_with_gap(60);
        let change = Change::of_revision(RevisionId::new(2));
        assert_eq!(RetryPolicy::default().cooling_down_until(&job, &change, at(160)), None);
    }

    #[test]
    fn out_of_capacity_in_test_environment_is_retried_at_once() {
        let job = job(
            JobType::SystemTest,
            &[(RunStatus::OutOfCapacity, 100), (RunStatus::OutOfCapacity, 160)],
        );
        assert_eq!(RetryPolicy::default().cooling_down_until(&job, &Change::empty(), at(160)), None);
    }
}
