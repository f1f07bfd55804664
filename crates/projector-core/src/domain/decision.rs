//! Decision model: what happens to a task after a failed attempt.
//!
//! Success needs no decision (the task is deleted). Failures go through a
//! [`Decider`], which is pure: it reads the task, returns the next action, and
//! leaves persisting it to the processor.

use std::time::Duration;

use super::retry::RetryPolicy;
use super::task::ProjectionTask;

/// The next action for a task whose attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Keep the task as `Retrying` and pick it up again after `delay`.
    Retry { retry_count: u32, delay: Duration },

    /// Move the task to the dead-letter store.
    DeadLetter { retry_count: u32, reason: String },
}

impl Decision {
    pub fn retry_count(&self) -> u32 {
        match self {
            Decision::Retry { retry_count, .. } | Decision::DeadLetter { retry_count, .. } => {
                *retry_count
            }
        }
    }
}

pub trait Decider: Send + Sync {
    /// Decide for `task` as it was loaded, i.e. before this failure is counted.
    fn decide(&self, task: &ProjectionTask) -> Decision;
}

/// Budget-based decider: `retry_count + 1 < max_retry` retries, anything else
/// dead-letters.
///
/// With `max_retry = 8`, failures 1 through 7 reschedule and the 8th failure
/// dead-letters.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &ProjectionTask) -> Decision {
        let next = task.retry_count.saturating_add(1);
        if next >= self.policy.max_retry {
            Decision::DeadLetter {
                retry_count: next,
                reason: format!("retry budget spent: {next}/{}", self.policy.max_retry),
            }
        } else {
            Decision::Retry {
                retry_count: next,
                delay: self.policy.backoff.delay(next),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::TaskId;
    use crate::domain::subject::Subject;
    use chrono::Utc;
    use rstest::rstest;
    use ulid::Ulid;

    fn task_with_retries(retry_count: u32) -> ProjectionTask {
        let mut task = ProjectionTask::new(TaskId::from_ulid(Ulid::new()), Subject::project(1), Utc::now());
        task.retry_count = retry_count;
        task
    }

    #[rstest]
    #[case(0, 1, 1)]
    #[case(1, 2, 2)]
    #[case(2, 3, 4)]
    #[case(6, 7, 64)]
    fn failures_within_budget_retry(
        #[case] current: u32,
        #[case] expected_count: u32,
        #[case] expected_secs: u64,
    ) {
        let decision = DefaultDecider::default().decide(&task_with_retries(current));
        assert_eq!(
            decision,
            Decision::Retry {
                retry_count: expected_count,
                delay: Duration::from_secs(expected_secs),
            }
        );
    }

    #[test]
    fn eighth_failure_dead_letters() {
        let decision = DefaultDecider::default().decide(&task_with_retries(7));
        assert!(matches!(decision, Decision::DeadLetter { retry_count: 8, .. }));
    }

    #[test]
    fn over_budget_rows_dead_letter_immediately() {
        let decider = DefaultDecider::new(RetryPolicy {
            max_retry: 3,
            ..RetryPolicy::default()
        });
        assert!(matches!(
            decider.decide(&task_with_retries(10)),
            Decision::DeadLetter { retry_count: 11, .. }
        ));
    }
}
