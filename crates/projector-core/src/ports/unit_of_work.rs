//! UnitOfWork - 1 タスク分の変更をまとめて commit する単位
//!
//! タスクごとに独立したトランザクションで状態を確定させるための入れ物です。
//! TaskStore::commit が全変更を原子的に適用し、途中で失敗したら何も残しません。
//! あるタスクの commit 失敗は、同じバッチの他タスクの結果に影響しません。
//!
//! claim モードでは `held_by(owner)` を付ける。更新・削除する行の claim が
//! 別のワーカーに移っていたら、commit は `StoreError::ClaimLost` で全体を失敗させます。

use crate::domain::{DeadLetterEntry, ProjectionTask, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// 既存行の retry 状態を書き戻す（claim も解除）。行が無ければ commit 全体が失敗
    UpdateTask(ProjectionTask),

    /// 行を削除する。行が無ければ commit 全体が失敗
    DeleteTask(TaskId),

    /// dead-letter store に追記
    DeadLetter(DeadLetterEntry),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWork {
    changes: Vec<Change>,
    owner: Option<String>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn update_task(mut self, task: ProjectionTask) -> Self {
        self.changes.push(Change::UpdateTask(task));
        self
    }

    pub fn delete_task(mut self, id: TaskId) -> Self {
        self.changes.push(Change::DeleteTask(id));
        self
    }

    pub fn dead_letter(mut self, entry: DeadLetterEntry) -> Self {
        self.changes.push(Change::DeadLetter(entry));
        self
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_parts(self) -> (Vec<Change>, Option<String>) {
        (self.changes, self.owner)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
