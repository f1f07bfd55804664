//! TaskStore port - 投影タスクキューの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - キュー行（PENDING / RETRYING）
//! - バッチ選択（単独ワーカー用の select と、複数ワーカー用の claim）
//! - タスク単位の状態確定（UnitOfWork の原子的 commit）
//!
//! # 実装
//! - InMemoryStore: テスト・デモ用
//! - SqliteProjectionStore: 永続化（enqueue 側の業務トランザクションと同じ DB に置く）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ProjectionTask, TaskId, TaskStatus};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::UnitOfWork;

/// 複数ワーカー運用時の一時的な所有権
///
/// `until` を過ぎた claim は失効扱いで、他のワーカーが再選択できます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub owner: String,
    pub until: DateTime<Utc>,
}

/// 投影タスクキュー
///
/// # 選択ルール
/// - `status` が `statuses` のいずれか
/// - PENDING、または `next_run_at <= now`
/// - 有効な claim が付いていない
/// - set_deleted を持つタスクは、同じ subject の古い set_deleted タスクが
///   キューに残っている間は選ばれない（論理削除/復元の順序を保つ）
/// - `created_at`、次に `id` の昇順で最大 `limit` 件
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, task: ProjectionTask) -> Result<(), StoreError>;

    /// 全件まとめて保存する。1 件でも失敗したら何も保存しない
    async fn save_all(&self, tasks: Vec<ProjectionTask>) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask>, StoreError>;

    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, StoreError>;

    /// 選択と claim を 1 つのトランザクションで行う
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
        claim: &Claim,
    ) -> Result<Vec<ProjectionTask>, StoreError>;

    /// 自分の claim を `claim.until` まで延長する
    ///
    /// 行が既に無い、または claim が他の owner に移っていれば `false`。
    /// 期限切れでも、まだ誰にも取られていなければ延長できる。
    async fn renew_claim(&self, id: TaskId, claim: &Claim) -> Result<bool, StoreError>;

    /// UnitOfWork を原子的に適用する
    ///
    /// `uow.owner()` があれば、更新・削除する行の claim がその owner のものでない限り
    /// `StoreError::ClaimLost` で失敗する。
    async fn commit(&self, uow: UnitOfWork) -> Result<(), StoreError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError>;

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.commit(UnitOfWork::new().delete_task(id)).await
    }
}

/// 選択ルールのうち、行単位で判定できる部分
pub fn is_selectable(
    task: &ProjectionTask,
    claim_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    statuses: &[TaskStatus],
) -> bool {
    statuses.contains(&task.status)
        && task.is_ready(now)
        && claim_until.is_none_or(|until| until <= now)
}
