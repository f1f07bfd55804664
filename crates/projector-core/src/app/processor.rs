//! TaskProcessor - 1 タスクの適用と状態確定
//!
//! process() = apply（インデックスへの反映）→ decide（失敗時のみ）→ commit（UnitOfWork）
//!
//! - apply は set_deleted → FieldSet 順のカウンタ の順にインデックスを呼ぶ
//! - 最初に失敗した呼び出しで残りは打ち切り
//! - 各呼び出しは call_timeout で打ち切り、タイムアウトも retryable 扱い
//! - 成功ならタスク削除、失敗なら RETRYING に戻すか dead-letter に移す
//!
//! 状態確定はタスクごとに独立した UnitOfWork なので、
//! 同じバッチの他タスクの成否に影響しません。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::domain::{
    ApplyOutcome, DeadLetterEntry, DeadLetterId, Decider, Decision, IndexStep, ProjectionEvent,
    ProjectionTask, truncate_error,
};
use crate::error::{IndexError, StoreError};
use crate::ports::{Claim, Clock, EventSink, ExternalIndex, IdGenerator, TaskStore, UnitOfWork};

/// process() の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResolution {
    Applied,
    Rescheduled {
        retry_count: u32,
        next_run_at: DateTime<Utc>,
    },
    DeadLettered {
        dead_letter_id: DeadLetterId,
    },

    /// claim が他のワーカーに移っていた。インデックスにもストアにも触れていない
    ClaimLost,
}

pub struct TaskProcessor {
    store: Arc<dyn TaskStore>,
    index: Arc<dyn ExternalIndex>,
    decider: Arc<dyn Decider>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    call_timeout: Duration,
    error_max_chars: usize,
}

impl TaskProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        index: Arc<dyn ExternalIndex>,
        decider: Arc<dyn Decider>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        call_timeout: Duration,
        error_max_chars: usize,
    ) -> Self {
        Self {
            store,
            index,
            decider,
            ids,
            clock,
            events,
            call_timeout,
            error_max_chars,
        }
    }

    /// タスクの効果をインデックスに反映する（ストアには触らない）
    pub async fn apply(&self, task: &ProjectionTask) -> ApplyOutcome {
        let mut calls = 0;

        if let Some(deleted) = task.set_deleted {
            let step = IndexStep::SetDeleted(deleted);
            let call = self.index.set_deleted_flag(task.subject, deleted);
            if let Err(error) = self.bounded(call).await {
                return ApplyOutcome::RetryableFailure { step, error };
            }
            calls += 1;
        }

        for &field in task.subject.kind.field_set().fields() {
            let delta = task.deltas.get(field);
            let result = if delta > 0 {
                let step = IndexStep::Increment(field);
                (step, self.bounded(self.index.increment_field(task.subject, field, delta)).await)
            } else if delta < 0 && field.allows_decrement() {
                let step = IndexStep::Decrement(field);
                let amount = delta.saturating_abs();
                (step, self.bounded(self.index.decrement_field(task.subject, field, amount)).await)
            } else {
                continue;
            };

            match result {
                (_, Ok(())) => calls += 1,
                (step, Err(error)) => return ApplyOutcome::RetryableFailure { step, error },
            }
        }

        ApplyOutcome::Success { calls }
    }

    async fn bounded<F>(&self, call: F) -> Result<(), IndexError>
    where
        F: std::future::Future<Output = Result<(), IndexError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(IndexError::Timeout(self.call_timeout)),
        }
    }

    /// apply して、結果を 1 つの UnitOfWork で確定する
    ///
    /// ストアへの確定に失敗した場合はそのまま Err を返す。タスクは元の状態のまま
    /// キューに残り、次の tick で再選択される（at-least-once）。
    #[instrument(skip_all, fields(task_id = %task.id, subject = %task.subject, retry_count = task.retry_count))]
    pub async fn process(&self, task: ProjectionTask) -> Result<TaskResolution, StoreError> {
        let outcome = self.apply(&task).await;
        self.settle(task, outcome, None).await
    }

    /// claim モード用の process
    ///
    /// インデックスに触れる前に claim を `claim.until` まで延長する。延長できなければ
    /// 他のワーカーが引き継いだということなので、何もせず `ClaimLost` を返す。
    /// 確定の UnitOfWork も claim の owner 付きで commit する。
    #[instrument(skip_all, fields(task_id = %task.id, subject = %task.subject, retry_count = task.retry_count, owner = %claim.owner))]
    pub async fn process_claimed(
        &self,
        task: ProjectionTask,
        claim: &Claim,
    ) -> Result<TaskResolution, StoreError> {
        if !self.store.renew_claim(task.id, claim).await? {
            self.events.emit(&ProjectionEvent::ClaimLost {
                task_id: task.id,
                subject: task.subject,
            });
            return Ok(TaskResolution::ClaimLost);
        }
        let outcome = self.apply(&task).await;
        self.settle(task, outcome, Some(claim.owner.as_str())).await
    }

    fn unit_of_work(owner: Option<&str>) -> UnitOfWork {
        match owner {
            Some(owner) => UnitOfWork::new().held_by(owner),
            None => UnitOfWork::new(),
        }
    }

    async fn settle(
        &self,
        task: ProjectionTask,
        outcome: ApplyOutcome,
        owner: Option<&str>,
    ) -> Result<TaskResolution, StoreError> {
        let (step, index_error) = match outcome {
            ApplyOutcome::Success { .. } => {
                self.store
                    .commit(Self::unit_of_work(owner).delete_task(task.id))
                    .await?;
                self.events.emit(&ProjectionEvent::TaskApplied {
                    task_id: task.id,
                    subject: task.subject,
                });
                return Ok(TaskResolution::Applied);
            }
            ApplyOutcome::RetryableFailure { step, error } => (step, error),
        };

        let error = truncate_error(&index_error.to_string(), self.error_max_chars);
        let now = self.clock.now();

        match self.decider.decide(&task) {
            Decision::Retry { retry_count, delay } => {
                let next_run_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let mut updated = task.clone();
                updated.schedule_retry(retry_count, next_run_at, error.clone());
                self.store
                    .commit(Self::unit_of_work(owner).update_task(updated))
                    .await?;

                self.events.emit(&ProjectionEvent::TaskRescheduled {
                    task_id: task.id,
                    subject: task.subject,
                    retry_count,
                    delay,
                    step,
                    error,
                });
                Ok(TaskResolution::Rescheduled {
                    retry_count,
                    next_run_at,
                })
            }
            Decision::DeadLetter {
                retry_count,
                reason,
            } => {
                let dead_letter_id = self.ids.generate_dead_letter_id();
                let entry = DeadLetterEntry::from_task(dead_letter_id, &task, error.clone(), now);
                self.store
                    .commit(
                        Self::unit_of_work(owner)
                            .dead_letter(entry)
                            .delete_task(task.id),
                    )
                    .await?;

                tracing::debug!(%reason, %step, "retry budget exhausted");
                self.events.emit(&ProjectionEvent::TaskDeadLettered {
                    task_id: task.id,
                    dead_letter_id,
                    subject: task.subject,
                    retry_count,
                    step,
                    error,
                });
                Ok(TaskResolution::DeadLettered { dead_letter_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CounterField, DefaultDecider, RetryPolicy, Subject, TaskId, TaskStatus};
    use crate::impls::{IndexCall, InMemoryIndex, InMemoryStore};
    use crate::ports::{DeadLetterStore, FixedClock, NoopEventSink, UlidGenerator};
    use chrono::TimeZone;
    use ulid::Ulid;

    struct Fixture {
        store: InMemoryStore,
        index: InMemoryIndex,
        clock: FixedClock,
        processor: TaskProcessor,
    }

    fn fixture(call_timeout: Duration) -> Fixture {
        let store = InMemoryStore::new();
        let index = InMemoryIndex::new();
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let processor = TaskProcessor::new(
            Arc::new(store.clone()),
            Arc::new(index.clone()),
            Arc::new(DefaultDecider::new(RetryPolicy::default())),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(clock.clone()),
            Arc::new(NoopEventSink),
            call_timeout,
            RetryPolicy::default().error_max_chars,
        );
        Fixture {
            store,
            index,
            clock,
            processor,
        }
    }

    fn task(f: &Fixture, subject: Subject) -> ProjectionTask {
        ProjectionTask::new(TaskId::from_ulid(Ulid::new()), subject, f.clock.now())
    }

    #[tokio::test]
    async fn restore_precedes_counter_calls() {
        let f = fixture(Duration::from_secs(5));
        let subject = Subject::project(42);
        let t = task(&f, subject)
            .with_set_deleted(false)
            .with_delta(CounterField::Comment, -2)
            .with_delta(CounterField::Like, 1)
            .with_delta(CounterField::View, 3);

        let outcome = f.processor.apply(&t).await;

        assert_eq!(outcome, ApplyOutcome::Success { calls: 4 });
        assert_eq!(
            f.index.calls(),
            vec![
                IndexCall::SetDeleted {
                    subject,
                    deleted: false
                },
                IndexCall::Decrement {
                    subject,
                    field: CounterField::Comment,
                    amount: 2
                },
                IndexCall::Increment {
                    subject,
                    field: CounterField::Like,
                    amount: 1
                },
                IndexCall::Increment {
                    subject,
                    field: CounterField::View,
                    amount: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn zero_and_non_positive_increment_only_deltas_make_no_calls() {
        let f = fixture(Duration::from_secs(5));
        let mut t = task(&f, Subject::project(1));
        t.deltas.view = -4;

        assert_eq!(f.processor.apply(&t).await, ApplyOutcome::Success { calls: 0 });
        assert!(f.index.calls().is_empty());
    }

    #[tokio::test]
    async fn first_failure_aborts_remaining_calls() {
        let f = fixture(Duration::from_secs(5));
        let t = task(&f, Subject::project(1))
            .with_delta(CounterField::Comment, 1)
            .with_delta(CounterField::Like, 1);
        f.index.fail_next(1, IndexError::Unavailable("down".into()));

        let outcome = f.processor.apply(&t).await;

        assert_eq!(
            outcome,
            ApplyOutcome::RetryableFailure {
                step: IndexStep::Increment(CounterField::Comment),
                error: IndexError::Unavailable("down".into()),
            }
        );
        assert_eq!(f.index.calls().len(), 1);
    }

    #[tokio::test]
    async fn dataset_tasks_project_downloads_only() {
        let f = fixture(Duration::from_secs(5));
        let subject = Subject::dataset(8);
        let t = task(&f, subject).with_delta(CounterField::Download, 2);

        assert!(f.processor.apply(&t).await.is_success());
        assert_eq!(
            f.index.document(subject).unwrap().counter(CounterField::Download),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_retryable_failures() {
        let f = fixture(Duration::from_millis(50));
        f.index.set_latency(Some(Duration::from_secs(1)));
        let t = task(&f, Subject::project(1)).with_delta(CounterField::Like, 1);
        TaskStore::save(&f.store, t.clone()).await.unwrap();

        let resolution = f.processor.process(t.clone()).await.unwrap();

        assert!(matches!(
            resolution,
            TaskResolution::Rescheduled { retry_count: 1, .. }
        ));
        let stored = f.store.get(t.id).await.unwrap().unwrap();
        assert_eq!(
            stored.last_error.as_deref(),
            Some("index call timed out after 50ms")
        );
    }

    #[tokio::test]
    async fn success_deletes_the_task() {
        let f = fixture(Duration::from_secs(5));
        let t = task(&f, Subject::project(42)).with_delta(CounterField::Comment, 1);
        TaskStore::save(&f.store, t.clone()).await.unwrap();

        let resolution = f.processor.process(t.clone()).await.unwrap();

        assert_eq!(resolution, TaskResolution::Applied);
        assert!(f.store.get(t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_reschedules_with_backoff() {
        let f = fixture(Duration::from_secs(5));
        let mut t = task(&f, Subject::project(42)).with_delta(CounterField::Comment, 1);
        t.schedule_retry(2, f.clock.now(), "earlier");
        TaskStore::save(&f.store, t.clone()).await.unwrap();
        f.index.fail_next(1, IndexError::Unavailable("down".into()));

        let resolution = f.processor.process(t.clone()).await.unwrap();

        let expected_at = f.clock.now() + chrono::Duration::seconds(4);
        assert_eq!(
            resolution,
            TaskResolution::Rescheduled {
                retry_count: 3,
                next_run_at: expected_at,
            }
        );
        let stored = f.store.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Retrying);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.next_run_at, Some(expected_at));
    }

    #[tokio::test]
    async fn last_failure_moves_the_task_to_dead_letters() {
        let f = fixture(Duration::from_secs(5));
        let mut t = task(&f, Subject::project(42)).with_delta(CounterField::Like, -1);
        t.schedule_retry(7, f.clock.now(), "earlier");
        TaskStore::save(&f.store, t.clone()).await.unwrap();
        let long = "x".repeat(5000);
        f.index.fail_next(1, IndexError::Rejected(long));

        let resolution = f.processor.process(t.clone()).await.unwrap();

        assert!(matches!(resolution, TaskResolution::DeadLettered { .. }));
        assert!(f.store.get(t.id).await.unwrap().is_none());
        let entries = f.store.list(10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, t.id);
        assert_eq!(entries[0].deltas.like, -1);
        assert_eq!(entries[0].last_error.chars().count(), 2000);
    }

    #[tokio::test]
    async fn settle_failure_leaves_the_task_queued() {
        let f = fixture(Duration::from_secs(5));
        // never saved: the delete in the unit of work finds no row
        let t = task(&f, Subject::project(1)).with_delta(CounterField::Comment, 1);

        let err = f.processor.process(t).await.unwrap_err();

        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(DeadLetterStore::count(&f.store).await.unwrap(), 0);
    }
}
