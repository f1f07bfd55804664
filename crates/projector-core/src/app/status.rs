//! Status - キューの滞留状況のスナップショット
//!
//! 運用向けに、キューの深さと dead-letter の件数をまとめて返します。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::DeadLetterEntry;
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::{DeadLetterStore, TaskStore};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub at: DateTime<Utc>,
    pub queue: QueueCounts,
    pub dead_letters: usize,

    /// 古い順に最大 `recent` 件
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub oldest_dead_letters: Vec<DeadLetterEntry>,
}

impl StatusReport {
    pub async fn collect(
        tasks: &dyn TaskStore,
        dead_letters: &dyn DeadLetterStore,
        now: DateTime<Utc>,
        recent: usize,
    ) -> Result<Self, StoreError> {
        let queue = tasks.counts(now).await?;
        let count = dead_letters.count().await?;
        let oldest_dead_letters = if recent > 0 {
            dead_letters.list(recent, 0).await?
        } else {
            Vec::new()
        };
        Ok(Self {
            at: now,
            queue,
            dead_letters: count,
            oldest_dead_letters,
        })
    }

    /// 何も滞留していない
    pub fn is_idle(&self) -> bool {
        self.queue.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeadLetterId, ProjectionTask, Subject, TaskId};
    use crate::impls::InMemoryStore;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    #[tokio::test]
    async fn report_counts_queue_and_dead_letters() {
        let store = InMemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let pending = ProjectionTask::new(TaskId::from_ulid(Ulid::new()), Subject::project(1), now);
        let mut retrying = ProjectionTask::new(TaskId::from_ulid(Ulid::new()), Subject::project(2), now);
        retrying.schedule_retry(3, now + Duration::seconds(4), "down");
        store.save_all(vec![pending, retrying.clone()]).await.unwrap();
        DeadLetterStore::save(
            &store,
            DeadLetterEntry::from_task(DeadLetterId::from_ulid(Ulid::new()), &retrying, "gone", now),
        )
        .await
        .unwrap();

        let report = StatusReport::collect(&store, &store, now, 5).await.unwrap();

        assert_eq!(report.queue.pending, 1);
        assert_eq!(report.queue.retrying, 1);
        assert_eq!(report.queue.retry_due, 0);
        assert_eq!(report.dead_letters, 1);
        assert_eq!(report.oldest_dead_letters.len(), 1);
        assert!(!report.is_idle());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["queue"]["pending"], 1);
    }
}
