//! Dead-letter entries: terminal snapshots of tasks that spent their retry budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DeadLetterId, TaskId};
use super::subject::Subject;
use super::task::{Deltas, ProjectionTask};

/// Immutable snapshot of a poisoned task.
///
/// Carries the payload and the last error only; there is no status or retry
/// state because nothing in this crate reprocesses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,

    /// The queue entry this snapshot replaced.
    pub task_id: TaskId,

    pub subject: Subject,
    pub deltas: Deltas,
    pub set_deleted: Option<bool>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_task(
        id: DeadLetterId,
        task: &ProjectionTask,
        last_error: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id: task.id,
            subject: task.subject,
            deltas: task.deltas,
            set_deleted: task.set_deleted,
            last_error: last_error.into(),
            created_at,
        }
    }
}

/// Which dead letters `purge` removes.
#[derive(Debug, Clone, PartialEq)]
pub enum PurgeFilter {
    All,
    Ids(Vec<DeadLetterId>),
    /// Entries created strictly before the timestamp.
    OlderThan(DateTime<Utc>),
}

impl PurgeFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        match self {
            PurgeFilter::All => true,
            PurgeFilter::Ids(ids) => ids.contains(&entry.id),
            PurgeFilter::OlderThan(cutoff) => entry.created_at < *cutoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subject::CounterField;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    #[test]
    fn snapshot_copies_payload_and_error() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut task = ProjectionTask::new(TaskId::from_ulid(Ulid::new()), Subject::project(7), now)
            .with_delta(CounterField::Like, -1)
            .with_set_deleted(false);
        task.schedule_retry(7, now, "older error");

        let entry = DeadLetterEntry::from_task(
            DeadLetterId::from_ulid(Ulid::new()),
            &task,
            "latest error",
            now,
        );

        assert_eq!(entry.task_id, task.id);
        assert_eq!(entry.subject, Subject::project(7));
        assert_eq!(entry.deltas.like, -1);
        assert_eq!(entry.set_deleted, Some(false));
        assert_eq!(entry.last_error, "latest error");

        assert!(PurgeFilter::All.matches(&entry));
        assert!(PurgeFilter::Ids(vec![entry.id]).matches(&entry));
        assert!(!PurgeFilter::OlderThan(now).matches(&entry));
        assert!(PurgeFilter::OlderThan(now + Duration::seconds(1)).matches(&entry));
    }
}
