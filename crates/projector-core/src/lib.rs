//! projector-core
//!
//! Keeps a search index eventually consistent with a primary store by recording
//! state-change intents as durable queue rows and applying them asynchronously.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（subject, task, dead letter, retry, decision, events）
//! - **ports**: 抽象化レイヤー（TaskStore, DeadLetterStore, ExternalIndex, Clock, EventSink, など）
//! - **app**: アプリケーションロジック（enqueue, processor, scheduler, builder, status）
//! - **impls**: 実装（InMemoryStore, InMemoryIndex, SqliteProjectionStore）
//! - **config**: 設定の読み込み（defaults → file → env）
//! - **error**: エラー型
//! - **observability**: キュー深さ・処理件数の集計型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use error::{IndexError, ProjectorError, StoreError};
