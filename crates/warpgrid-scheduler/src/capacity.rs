//! Test capacity admission.
//!
//! System and staging tests run in shared environments, so each cycle only
//! admits as many new test runs per test job type as there is capacity left
//! after the runs already in progress. Competing candidates are ordered:
//!
//! 1. retries of runs that were out of capacity
//! 2. runs for instances rolling out a new revision
//! 3. earliest readiness

use std::collections::{HashMap, HashSet};

use warp_core::{JobId, JobType};
use warpgrid_rollout::TriggerAction;
use warpgrid_state::Application;

/// Outcome of admitting one cycle's test triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// `(application, job)` pairs which may start this cycle.
    pub admitted: HashSet<(String, JobId)>,
    /// Test triggers held back for lack of capacity.
    pub deferred: usize,
}

impl Admission {
    /// Whether `action` of `application` may be triggered. Jobs outside the
    /// test environments are always admitted.
    pub fn allows(&self, application: &str, action: &TriggerAction) -> bool {
        !action.job.job_type.is_test_environment()
            || self.admitted.contains(&(application.to_string(), action.job.clone()))
    }
}

/// Count of running test jobs per test job type.
pub fn running_tests<'a>(applications: impl IntoIterator<Item = &'a Application>) -> HashMap<JobType, usize> {
    let mut running = HashMap::new();
    for application in applications {
        for instance in application.instances.values() {
            for (job_type, status) in &instance.jobs {
                if job_type.is_test_environment() && status.is_running() {
                    *running.entry(job_type.clone()).or_insert(0) += 1;
                }
            }
        }
    }
    running
}

/// Admit the best candidates of each test job type, up to `capacity`
/// concurrent runs of that type.
pub fn admit<'a>(
    candidates: impl IntoIterator<Item = (&'a str, &'a TriggerAction)>,
    capacity: usize,
    running: &HashMap<JobType, usize>,
) -> Admission {
    let mut tests: Vec<(&str, &TriggerAction)> = candidates
        .into_iter()
        .filter(|(_, action)| action.job.job_type.is_test_environment())
        .collect();
    tests.sort_by(|(a_app, a), (b_app, b)| {
        b.is_retry
            .cmp(&a.is_retry)
            .then(b.is_revision_upgrade.cmp(&a.is_revision_upgrade))
            .then(a.ready_since.cmp(&b.ready_since))
            .then(a_app.cmp(b_app))
            .then(a.job.cmp(&b.job))
    });

    let mut used = running.clone();
    let mut admission = Admission::default();
    for (application, action) in tests {
        let count = used.entry(action.job.job_type.clone()).or_insert(0);
        if *count < capacity {
            *count += 1;
            admission.admitted.insert((application.to_string(), action.job.clone()));
        } else {
            admission.deferred += 1;
        }
    }
    admission
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, TimeDelta, Utc};
    use warp_core::{RevisionId, Version};
    use warpgrid_state::Versions;

    fn action(job: JobType, minutes: i64) -> TriggerAction {
        TriggerAction {
            job: JobId::new("default", job),
            versions: Versions::new(Version::new(1, 0, 0), RevisionId::new(1)),
            ready_since: DateTime::<Utc>::UNIX_EPOCH + TimeDelta::minutes(minutes),
            is_retry: false,
            is_revision_upgrade: false,
            triggered_by: None,
        }
    }

    #[test]
    fn production_jobs_bypass_capacity() {
        let production = action(JobType::production("us-east-1"), 0);
        let admission = admit([("a", &production)], 0, &HashMap::new());
        assert!(admission.admitted.is_empty());
        assert_eq!(admission.deferred, 0);
        assert!(admission.allows("a", &production));
    }

    #[test]
    fn earliest_ready_wins_within_capacity() {
        let early = action(JobType::SystemTest, 1);
        let late = action(JobType::SystemTest, 5);
        let staging = action(JobType::StagingTest, 9);
        let admission = admit([("late", &late), ("early", &early), ("late", &staging)], 1, &HashMap::new());

        assert!(admission.allows("early", &early));
        assert!(!admission.allows("late", &late));
        // Capacity is counted per test job type.
        assert!(admission.allows("late", &staging));
        assert_eq!(admission.deferred, 1);
    }

    #[test]
    fn retries_then_revision_upgrades_go_first() {
        let ordinary = action(JobType::StagingTest, 0);
        let upgrade = TriggerAction {
            is_revision_upgrade: true,
            ..action(JobType::StagingTest, 5)
        };
        let retry = TriggerAction {
            is_retry: true,
            ..action(JobType::StagingTest, 10)
        };
        let candidates = [("a", &ordinary), ("b", &upgrade), ("c", &retry)];

        let admission = admit(candidates, 1, &HashMap::new());
        assert!(admission.allows("c", &retry));
        assert_eq!(admission.deferred, 2);

        let admission = admit(candidates, 2, &HashMap::new());
        assert!(admission.allows("b", &upgrade));
        assert!(!admission.allows("a", &ordinary));
    }

    #[test]
    fn running_tests_use_up_capacity() {
        let system = action(JobType::SystemTest, 0);
        let running = HashMap::from([(JobType::SystemTest, 2)]);
        let admission = admit([("a", &system)], 2, &running);
        assert!(!admission.allows("a", &system));
        assert_eq!(admission.deferred, 1);
    }
}
