//! ProjectorBuilder - 投影パイプラインの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - TaskStore と ExternalIndex は必須。足りなければ build() が BuildError を返す
//! - SchedulerConfig / RetryPolicy の不整合も build() 時点で弾く
//! - Clock・IdGenerator・EventSink は省略時に本番用のデフォルトを使う

use std::sync::Arc;
use std::time::Duration;

use crate::app::enqueue::{Enqueuer, TaskFactory};
use crate::app::processor::TaskProcessor;
use crate::app::scheduler::{ProjectionScheduler, SchedulerConfig};
use crate::domain::{DefaultDecider, RetryPolicy, SubjectKind};
use crate::ports::{
    Clock, EventSink, ExternalIndex, IdGenerator, SystemClock, TaskStore, TracingEventSink,
    UlidGenerator,
};

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("task store is required")]
    MissingTaskStore,

    #[error("external index is required")]
    MissingIndex,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// # 使用例
/// ```ignore
/// let projector = ProjectorBuilder::new()
///     .task_store(store)
///     .index(index)
///     .scheduler_config(config)
///     .build()?;
/// let handle = projector.scheduler().spawn();
/// ```
pub struct ProjectorBuilder {
    store: Option<Arc<dyn TaskStore>>,
    index: Option<Arc<dyn ExternalIndex>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    events: Option<Arc<dyn EventSink>>,
    retry: RetryPolicy,
    scheduler: SchedulerConfig,
    call_timeout: Duration,
}

impl ProjectorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            index: None,
            clock: None,
            ids: None,
            events: None,
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            call_timeout: Duration::from_secs(5),
        }
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(mut self, index: Arc<dyn ExternalIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Projector, BuildError> {
        let store = self.store.ok_or(BuildError::MissingTaskStore)?;
        let index = self.index.ok_or(BuildError::MissingIndex)?;

        self.scheduler
            .validate(self.call_timeout)
            .map_err(|e| BuildError::InvalidConfig(e.to_string()))?;
        if self.retry.max_retry == 0 {
            return Err(BuildError::InvalidConfig("max_retry must be positive".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(BuildError::InvalidConfig("call timeout must be positive".into()));
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let events: Arc<dyn EventSink> = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventSink::new()));

        let processor = TaskProcessor::new(
            Arc::clone(&store),
            index,
            Arc::new(DefaultDecider::new(self.retry.clone())),
            Arc::clone(&ids),
            Arc::clone(&clock),
            Arc::clone(&events),
            self.call_timeout,
            self.retry.error_max_chars,
        );
        let scheduler = ProjectionScheduler::new(
            Arc::clone(&store),
            processor,
            Arc::clone(&clock),
            events,
            self.scheduler,
        );

        Ok(Projector {
            scheduler: Arc::new(scheduler),
            store,
            ids,
            clock,
        })
    }
}

impl Default for ProjectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 構築済みのパイプライン
pub struct Projector {
    scheduler: Arc<ProjectionScheduler>,
    store: Arc<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Projector {
    pub fn scheduler(&self) -> Arc<ProjectionScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn task_factory(&self, kind: SubjectKind) -> TaskFactory {
        TaskFactory::new(kind, Arc::clone(&self.ids), Arc::clone(&self.clock))
    }

    /// 同じ TaskStore に書き込む Enqueue API
    pub fn enqueuer(&self, kind: SubjectKind) -> Enqueuer {
        Enqueuer::new(self.task_factory(kind), Arc::clone(&self.store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::scheduler::SelectionMode;
    use crate::impls::{InMemoryIndex, InMemoryStore};

    #[test]
    fn build_requires_store_and_index() {
        let missing_store = ProjectorBuilder::new()
            .index(Arc::new(InMemoryIndex::new()))
            .build();
        assert!(matches!(missing_store, Err(BuildError::MissingTaskStore)));

        let missing_index = ProjectorBuilder::new()
            .task_store(Arc::new(InMemoryStore::new()))
            .build();
        assert!(matches!(missing_index, Err(BuildError::MissingIndex)));
    }

    #[test]
    fn build_rejects_leases_shorter_than_a_slow_task() {
        let config = SchedulerConfig {
            mode: SelectionMode::Claim {
                owner: "w".into(),
                lease: Duration::from_secs(30),
            },
            ..SchedulerConfig::default()
        };
        let build = |timeout| {
            ProjectorBuilder::new()
                .task_store(Arc::new(InMemoryStore::new()))
                .index(Arc::new(InMemoryIndex::new()))
                .scheduler_config(config.clone())
                .call_timeout(timeout)
                .build()
        };
        assert!(matches!(build(Duration::from_secs(10)), Err(BuildError::InvalidConfig(_))));
        assert!(build(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn build_rejects_invalid_scheduler_config() {
        let result = ProjectorBuilder::new()
            .task_store(Arc::new(InMemoryStore::new()))
            .index(Arc::new(InMemoryIndex::new()))
            .scheduler_config(SchedulerConfig {
                interval: Duration::from_secs(10),
                batch_size: 10,
                mode: SelectionMode::Claim {
                    owner: "w".into(),
                    lease: Duration::from_secs(5),
                },
            })
            .build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn built_pipeline_applies_enqueued_intents() {
        let store = InMemoryStore::new();
        let index = InMemoryIndex::new();
        let projector = ProjectorBuilder::new()
            .task_store(Arc::new(store.clone()))
            .index(Arc::new(index.clone()))
            .build()
            .unwrap();

        projector
            .enqueuer(SubjectKind::Dataset)
            .enqueue_download_delta(11, 2)
            .await
            .unwrap();
        let report = projector.scheduler().tick().await.unwrap();

        assert_eq!(report.applied, 1);
        assert!(store.tasks().await.is_empty());
        assert_eq!(index.calls().len(), 1);
    }
}
