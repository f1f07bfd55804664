//! Events - 投影ワーカーが発行する観測イベント
//!
//! EventSink に流すためのイベント定義です。
//! ログ・カウンタ・テスト用の記録など、受け取り側は自由に実装できます。

use std::time::Duration;

use super::ids::{DeadLetterId, TaskId};
use super::outcome::IndexStep;
use super::subject::Subject;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionEvent {
    TickStarted { selected: usize },

    TaskApplied { task_id: TaskId, subject: Subject },

    TaskRescheduled {
        task_id: TaskId,
        subject: Subject,
        retry_count: u32,
        delay: Duration,
        step: IndexStep,
        error: String,
    },

    TaskDeadLettered {
        task_id: TaskId,
        dead_letter_id: DeadLetterId,
        subject: Subject,
        retry_count: u32,
        step: IndexStep,
        error: String,
    },

    TickCompleted {
        applied: usize,
        rescheduled: usize,
        dead_lettered: usize,
        elapsed: Duration,
    },

    /// 1 tick 全体が失敗（バッチ選択できなかった等）。次の tick は通常通り走る
    TickFailed { error: String },

    /// タスク単位の永続化失敗。そのタスクは次の tick で再選択される
    StoreFailure { task_id: TaskId, error: String },

    /// claim が他のワーカーに移っていたので、インデックスに触れずに手放した
    ClaimLost { task_id: TaskId, subject: Subject },
}

impl ProjectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectionEvent::TickStarted { .. } => "tick_started",
            ProjectionEvent::TaskApplied { .. } => "task_applied",
            ProjectionEvent::TaskRescheduled { .. } => "task_rescheduled",
            ProjectionEvent::TaskDeadLettered { .. } => "task_dead_lettered",
            ProjectionEvent::TickCompleted { .. } => "tick_completed",
            ProjectionEvent::TickFailed { .. } => "tick_failed",
            ProjectionEvent::StoreFailure { .. } => "store_failure",
            ProjectionEvent::ClaimLost { .. } => "claim_lost",
        }
    }
}
