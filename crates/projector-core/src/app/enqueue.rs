//! Enqueue - コマンド側から投影インテントを書き込む API
//!
//! - TaskFactory: 検証とタスク生成（ID・created_at の採番）だけを行う
//! - Enqueuer: TaskStore に単独で書き込む（業務 DB が別にある呼び出し元向け）
//! - 業務書き込みと同じトランザクションで積む場合は `SqliteProjectionStore::transaction`
//!
//! どの呼び出しも独立した新しいタスクを 1 件作ります（既存タスクとのマージはしない）。

use std::sync::Arc;

use tracing::instrument;

use crate::domain::{CounterField, ProjectionTask, Subject, SubjectKind, TaskId};
use crate::error::ProjectorError;
use crate::ports::{Clock, IdGenerator, TaskStore};

/// 1 つの SubjectKind 向けにタスクを検証・生成する
#[derive(Clone)]
pub struct TaskFactory {
    kind: SubjectKind,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl TaskFactory {
    pub fn new(kind: SubjectKind, ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self { kind, ids, clock }
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    fn base(&self, subject_id: i64) -> ProjectionTask {
        ProjectionTask::new(
            self.ids.generate_task_id(),
            Subject::new(self.kind, subject_id),
            self.clock.now(),
        )
    }

    /// field が kind の FieldSet に含まれ、増加専用フィールドに負のデルタを渡しておらず、
    /// comment / like のデルタが i32 に収まること
    fn check(&self, field: CounterField, delta: i64) -> Result<(), ProjectorError> {
        if !self.kind.field_set().contains(field) {
            return Err(ProjectorError::FieldNotProjected {
                kind: self.kind,
                field,
            });
        }
        if delta < 0 && !field.allows_decrement() {
            return Err(ProjectorError::InvalidDelta { field, delta });
        }
        let stored_as_i32 = matches!(field, CounterField::Comment | CounterField::Like);
        if stored_as_i32 && i32::try_from(delta).is_err() {
            return Err(ProjectorError::InvalidDelta { field, delta });
        }
        Ok(())
    }

    pub fn field_delta(
        &self,
        field: CounterField,
        subject_id: i64,
        delta: i64,
    ) -> Result<ProjectionTask, ProjectorError> {
        self.check(field, delta)?;
        Ok(self.base(subject_id).with_delta(field, delta))
    }

    pub fn comment_delta(&self, subject_id: i64, delta: i32) -> Result<ProjectionTask, ProjectorError> {
        self.field_delta(CounterField::Comment, subject_id, i64::from(delta))
    }

    pub fn like_delta(&self, subject_id: i64, delta: i32) -> Result<ProjectionTask, ProjectorError> {
        self.field_delta(CounterField::Like, subject_id, i64::from(delta))
    }

    pub fn view_delta(&self, subject_id: i64, delta: i64) -> Result<ProjectionTask, ProjectorError> {
        self.field_delta(CounterField::View, subject_id, delta)
    }

    pub fn download_delta(&self, subject_id: i64, delta: i64) -> Result<ProjectionTask, ProjectorError> {
        self.field_delta(CounterField::Download, subject_id, delta)
    }

    pub fn set_deleted(&self, subject_id: i64, deleted: bool) -> ProjectionTask {
        self.base(subject_id).with_set_deleted(deleted)
    }

    /// 1 件でも不正なら全体を拒否する
    pub fn view_delta_batch(
        &self,
        deltas: &[(i64, i64)],
    ) -> Result<Vec<ProjectionTask>, ProjectorError> {
        deltas
            .iter()
            .map(|&(subject_id, delta)| self.view_delta(subject_id, delta))
            .collect()
    }
}

/// TaskStore に直接書き込む Enqueue API
#[derive(Clone)]
pub struct Enqueuer {
    factory: TaskFactory,
    store: Arc<dyn TaskStore>,
}

impl Enqueuer {
    pub fn new(factory: TaskFactory, store: Arc<dyn TaskStore>) -> Self {
        Self { factory, store }
    }

    pub fn kind(&self) -> SubjectKind {
        self.factory.kind()
    }

    async fn push(&self, task: ProjectionTask) -> Result<TaskId, ProjectorError> {
        let id = task.id;
        self.store.save(task).await?;
        tracing::debug!(task_id = %id, "projection task enqueued");
        Ok(id)
    }

    #[instrument(skip(self), fields(kind = %self.factory.kind()))]
    pub async fn enqueue_comment_delta(&self, subject_id: i64, delta: i32) -> Result<TaskId, ProjectorError> {
        self.push(self.factory.comment_delta(subject_id, delta)?).await
    }

    #[instrument(skip(self), fields(kind = %self.factory.kind()))]
    pub async fn enqueue_like_delta(&self, subject_id: i64, delta: i32) -> Result<TaskId, ProjectorError> {
        self.push(self.factory.like_delta(subject_id, delta)?).await
    }

    #[instrument(skip(self), fields(kind = %self.factory.kind()))]
    pub async fn enqueue_view_delta(&self, subject_id: i64, delta: i64) -> Result<TaskId, ProjectorError> {
        self.push(self.factory.view_delta(subject_id, delta)?).await
    }

    #[instrument(skip(self), fields(kind = %self.factory.kind()))]
    pub async fn enqueue_download_delta(
        &self,
        subject_id: i64,
        delta: i64,
    ) -> Result<TaskId, ProjectorError> {
        self.push(self.factory.download_delta(subject_id, delta)?).await
    }

    #[instrument(skip(self), fields(kind = %self.factory.kind()))]
    pub async fn enqueue_set_deleted(&self, subject_id: i64, deleted: bool) -> Result<TaskId, ProjectorError> {
        self.push(self.factory.set_deleted(subject_id, deleted)).await
    }

    /// 閲覧数のまとめ書き。全件が 1 回の save_all で原子的に保存される
    #[instrument(skip(self, deltas), fields(kind = %self.factory.kind(), count = deltas.len()))]
    pub async fn enqueue_view_delta_batch(
        &self,
        deltas: &[(i64, i64)],
    ) -> Result<Vec<TaskId>, ProjectorError> {
        let tasks = self.factory.view_delta_batch(deltas)?;
        let ids = tasks.iter().map(|t| t.id).collect();
        self.store.save_all(tasks).await?;
        Ok(ids)
    }
}
