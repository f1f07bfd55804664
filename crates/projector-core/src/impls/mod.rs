//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: テスト・デモ用の TaskStore + DeadLetterStore
//! - **InMemoryIndex**: テスト・デモ用の ExternalIndex（失敗・遅延を仕込める）
//! - **SqliteProjectionStore**: 永続化された TaskStore + DeadLetterStore と Outbox

pub mod memory_index;
pub mod memory_store;
pub mod sqlite_store;

// 主要な型を再エクスポート
pub use self::memory_index::{IndexCall, IndexDocument, InMemoryIndex};
pub use self::memory_store::InMemoryStore;
pub use self::sqlite_store::{Outbox, SqliteProjectionStore};
