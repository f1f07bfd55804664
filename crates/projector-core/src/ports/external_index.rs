//! ExternalIndex port - 検索インデックス（投影先）
//!
//! ドキュメントは subject ごとに 1 つ。
//! カウンタは相対値（increment / decrement）でしか更新しないので、
//! 同じ subject のデルタはどの順で届いても結果が同じになります。

use async_trait::async_trait;

use crate::domain::{CounterField, Subject};
use crate::error::IndexError;

#[async_trait]
pub trait ExternalIndex: Send + Sync {
    async fn increment_field(
        &self,
        subject: Subject,
        field: CounterField,
        amount: i64,
    ) -> Result<(), IndexError>;

    async fn decrement_field(
        &self,
        subject: Subject,
        field: CounterField,
        amount: i64,
    ) -> Result<(), IndexError>;

    async fn set_deleted_flag(&self, subject: Subject, deleted: bool) -> Result<(), IndexError>;
}
