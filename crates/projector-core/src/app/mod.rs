//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **ProjectorBuilder**: パイプラインの構築とワイヤリング
//! - **Enqueuer / TaskFactory**: コマンド側からのインテント登録
//! - **TaskProcessor**: 1 タスクの適用と状態確定（apply → decide → commit）
//! - **ProjectionScheduler**: 一定間隔のバッチ処理ループ
//! - **StatusReport**: 滞留状況のスナップショット

pub mod builder;
pub mod enqueue;
pub mod processor;
pub mod scheduler;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Projector, ProjectorBuilder};
pub use self::enqueue::{Enqueuer, TaskFactory};
pub use self::processor::{TaskProcessor, TaskResolution};
pub use self::scheduler::{
    ProjectionScheduler, SchedulerConfig, SelectionMode, TickReport, WorkerHandle,
};
pub use self::status::StatusReport;
