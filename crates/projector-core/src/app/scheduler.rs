//! ProjectionScheduler - 一定間隔でバッチを取り出して処理するワーカー
//!
//! 1 tick の流れ：
//! 1. 準備済みタスクを最大 batch_size 件選択（Claim モードなら選択と claim を同時に）
//! 2. 1 件ずつ TaskProcessor::process（タスクごとに独立した UnitOfWork）
//! 3. 個々のタスクの確定失敗はイベントに記録して次へ進む
//!
//! tick 間はアイドル。tick 中に停止要求が来ても、その tick は最後まで走る。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app::processor::{TaskProcessor, TaskResolution};
use crate::domain::{ProjectionEvent, ProjectionTask, SubjectKind, TaskStatus};
use crate::error::{ProjectorError, StoreError};
use crate::ports::{Claim, Clock, EventSink, TaskStore};

/// バッチの取り方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    /// 単独ワーカー。単純に select するだけ
    Exclusive,

    /// 複数ワーカー。選択と同時に `lease` の間だけ claim する
    Claim { owner: String, lease: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub mode: SelectionMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            mode: SelectionMode::Exclusive,
        }
    }
}

impl SchedulerConfig {
    /// `call_timeout` bounds each index call; in claim mode the lease has to
    /// outlast the slowest possible task, since the claim is renewed per task.
    pub fn validate(&self, call_timeout: Duration) -> Result<(), ProjectorError> {
        if self.interval.is_zero() {
            return Err(ProjectorError::Config("interval must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ProjectorError::Config("batch_size must be positive".into()));
        }
        if let SelectionMode::Claim { owner, lease } = &self.mode {
            if owner.is_empty() {
                return Err(ProjectorError::Config("claim owner must not be empty".into()));
            }
            if *lease <= self.interval {
                return Err(ProjectorError::Config(format!(
                    "claim lease {lease:?} must be longer than the interval {:?}",
                    self.interval
                )));
            }
            let slowest_task = call_timeout.saturating_mul(SubjectKind::max_index_calls());
            if *lease <= slowest_task {
                return Err(ProjectorError::Config(format!(
                    "claim lease {lease:?} must be longer than the slowest task ({slowest_task:?})"
                )));
            }
        }
        Ok(())
    }
}

/// tick 1 回分の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub selected: usize,
    pub applied: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub store_failures: usize,

    /// Claimed rows another worker took over before they were processed.
    pub claims_lost: usize,
}

pub struct ProjectionScheduler {
    store: Arc<dyn TaskStore>,
    processor: TaskProcessor,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl ProjectionScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        processor: TaskProcessor,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            clock,
            events,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn claim_from(now: DateTime<Utc>, owner: &str, lease: Duration) -> Result<Claim, StoreError> {
        let until = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or_else(|| StoreError::Corrupt(format!("claim lease out of range: {lease:?}")))?;
        Ok(Claim {
            owner: owner.to_string(),
            until,
        })
    }

    async fn select(&self) -> Result<Vec<ProjectionTask>, StoreError> {
        let now = self.clock.now();
        match &self.config.mode {
            SelectionMode::Exclusive => {
                self.store
                    .find_batch_for_work(now, &TaskStatus::ACTIVE, self.config.batch_size)
                    .await
            }
            SelectionMode::Claim { owner, lease } => {
                let claim = Self::claim_from(now, owner, *lease)?;
                self.store
                    .claim_batch(now, &TaskStatus::ACTIVE, self.config.batch_size, &claim)
                    .await
            }
        }
    }

    async fn process(&self, task: ProjectionTask) -> Result<TaskResolution, StoreError> {
        match &self.config.mode {
            SelectionMode::Exclusive => self.processor.process(task).await,
            SelectionMode::Claim { owner, lease } => {
                // later rows of a long batch would otherwise run on a lapsed claim
                let claim = Self::claim_from(self.clock.now(), owner, *lease)?;
                self.processor.process_claimed(task, &claim).await
            }
        }
    }

    /// バッチを 1 回処理する
    ///
    /// Err になるのはバッチ選択に失敗したときだけ。個々のタスクの失敗は
    /// TickReport とイベントに記録される。
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let started = Instant::now();
        let batch = match self.select().await {
            Ok(batch) => batch,
            Err(e) => {
                self.events.emit(&ProjectionEvent::TickFailed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut report = TickReport {
            selected: batch.len(),
            ..TickReport::default()
        };
        self.events.emit(&ProjectionEvent::TickStarted {
            selected: report.selected,
        });

        for task in batch {
            let task_id = task.id;
            match self.process(task).await {
                Ok(TaskResolution::Applied) => report.applied += 1,
                Ok(TaskResolution::Rescheduled { .. }) => report.rescheduled += 1,
                Ok(TaskResolution::DeadLettered { .. }) => report.dead_lettered += 1,
                Ok(TaskResolution::ClaimLost) => report.claims_lost += 1,
                Err(e) => {
                    report.store_failures += 1;
                    self.events.emit(&ProjectionEvent::StoreFailure {
                        task_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.events.emit(&ProjectionEvent::TickCompleted {
            applied: report.applied,
            rescheduled: report.rescheduled,
            dead_lettered: report.dead_lettered,
            elapsed: started.elapsed(),
        });
        Ok(report)
    }

    /// tokio ランタイム上でループを開始する
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        WorkerHandle { shutdown_tx, join }
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            mode = ?self.config.mode,
            "projection scheduler started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender dropped
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            // tick errors are already reported through the event sink
            let _ = self.tick().await;
        }

        tracing::info!("projection scheduler stopped");
    }
}

/// spawn したスケジューラのハンドル
/// - `request_shutdown()` で新しい tick を止める（実行中の tick は完走）
/// - `shutdown_and_join()` で停止を待つ
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "projection scheduler task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
