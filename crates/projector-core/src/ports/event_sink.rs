//! EventSink port - 観測イベントの記録
//!
//! - TracingEventSink: tracing へのログ出力 + 累積カウンタ（本番用）
//! - RecordingEventSink: 受け取ったイベントを保持（テスト用）
//! - NoopEventSink: 何もしない
//!
//! emit は同期呼び出しです。ワーカーの処理を止めないよう、実装は軽く保つこと。

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::ProjectionEvent;
use crate::observability::ProcessingCounters;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProjectionEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &ProjectionEvent) {}
}

/// tracing にイベントを流し、件数を数える
#[derive(Debug, Default)]
pub struct TracingEventSink {
    ticks: AtomicU64,
    failed_ticks: AtomicU64,
    applied: AtomicU64,
    rescheduled: AtomicU64,
    dead_lettered: AtomicU64,
    store_failures: AtomicU64,
    claims_lost: AtomicU64,
}

impl TracingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProcessingCounters {
        ProcessingCounters {
            ticks: self.ticks.load(Ordering::Relaxed),
            failed_ticks: self.failed_ticks.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for TracingEventSink {
    fn emit(&self, event: &ProjectionEvent) {
        match event {
            ProjectionEvent::TickStarted { selected } => {
                tracing::debug!(selected, "projection tick started");
            }
            ProjectionEvent::TaskApplied { task_id, subject } => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%task_id, %subject, "projection task applied");
            }
            ProjectionEvent::TaskRescheduled {
                task_id,
                subject,
                retry_count,
                delay,
                step,
                error,
            } => {
                self.rescheduled.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    %task_id,
                    %subject,
                    retry_count,
                    delay_secs = delay.as_secs(),
                    %step,
                    error = %error,
                    "projection task failed, rescheduled"
                );
            }
            ProjectionEvent::TaskDeadLettered {
                task_id,
                dead_letter_id,
                subject,
                retry_count,
                step,
                error,
            } => {
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    %task_id,
                    %dead_letter_id,
                    %subject,
                    retry_count,
                    %step,
                    error = %error,
                    "projection task moved to dead letters"
                );
            }
            ProjectionEvent::TickCompleted {
                applied,
                rescheduled,
                dead_lettered,
                elapsed,
            } => {
                self.ticks.fetch_add(1, Ordering::Relaxed);
                if applied + rescheduled + dead_lettered > 0 {
                    tracing::info!(
                        applied,
                        rescheduled,
                        dead_lettered,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "projection tick completed"
                    );
                }
            }
            ProjectionEvent::TickFailed { error } => {
                self.ticks.fetch_add(1, Ordering::Relaxed);
                self.failed_ticks.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %error, "projection tick failed");
            }
            ProjectionEvent::StoreFailure { task_id, error } => {
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%task_id, error = %error, "failed to persist task result");
            }
            ProjectionEvent::ClaimLost { task_id, subject } => {
                self.claims_lost.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%task_id, %subject, "claim taken over by another worker, skipped");
            }
        }
    }
}

/// テスト用：イベントをそのまま溜める
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ProjectionEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProjectionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &ProjectionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CounterField, IndexStep, Subject, TaskId};
    use std::time::Duration;
    use ulid::Ulid;

    #[test]
    fn tracing_sink_counts_outcomes() {
        let sink = TracingEventSink::new();
        let task_id = TaskId::from_ulid(Ulid::new());

        sink.emit(&ProjectionEvent::TaskApplied {
            task_id,
            subject: Subject::project(1),
        });
        sink.emit(&ProjectionEvent::TaskRescheduled {
            task_id,
            subject: Subject::project(1),
            retry_count: 1,
            delay: Duration::from_secs(1),
            step: IndexStep::Increment(CounterField::Comment),
            error: "down".into(),
        });
        sink.emit(&ProjectionEvent::ClaimLost {
            task_id,
            subject: Subject::project(1),
        });
        sink.emit(&ProjectionEvent::TickCompleted {
            applied: 1,
            rescheduled: 1,
            dead_lettered: 0,
            elapsed: Duration::from_millis(3),
        });
        sink.emit(&ProjectionEvent::TickFailed {
            error: "db gone".into(),
        });

        let counters = sink.snapshot();
        assert_eq!(counters.applied, 1);
        assert_eq!(counters.rescheduled, 1);
        assert_eq!(counters.ticks, 2);
        assert_eq!(counters.failed_ticks, 1);
        assert_eq!(counters.dead_lettered, 0);
        assert_eq!(counters.claims_lost, 1);
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingEventSink::new();
        sink.emit(&ProjectionEvent::TickStarted { selected: 2 });
        sink.emit(&ProjectionEvent::TickFailed { error: "x".into() });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.events()[0].name(), "tick_started");
        assert_eq!(sink.count("tick_failed"), 1);
    }
}
