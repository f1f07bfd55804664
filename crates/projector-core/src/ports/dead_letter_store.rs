//! DeadLetterStore port - リトライ上限に達したタスクの退避先
//!
//! 書き込みは通常 UnitOfWork 経由（タスク削除と同じ commit）で行われます。
//! ここでは運用向けの参照と掃除を提供します。再投入は行いません。

use async_trait::async_trait;

use crate::domain::{DeadLetterEntry, PurgeFilter};
use crate::error::StoreError;

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn save(&self, entry: DeadLetterEntry) -> Result<(), StoreError>;

    /// 古い順（created_at, id）
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// 削除した件数を返す
    async fn purge(&self, filter: PurgeFilter) -> Result<usize, StoreError>;
}
