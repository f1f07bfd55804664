//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（キューの DB、検索インデックス、ログ基盤など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - キューの DB が source of truth（正本）。インデックスは派生データ
//! - インデックスへの反映は at-least-once
//! - タスクの状態確定はタスク単位で原子的

pub mod clock;
pub mod dead_letter_store;
pub mod event_sink;
pub mod external_index;
pub mod id_generator;
pub mod task_store;
pub mod unit_of_work;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dead_letter_store::DeadLetterStore;
pub use self::event_sink::{EventSink, NoopEventSink, RecordingEventSink, TracingEventSink};
pub use self::external_index::ExternalIndex;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{Claim, TaskStore, is_selectable};
pub use self::unit_of_work::{Change, UnitOfWork};
