//! Projection task: one durable intent in the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::TaskId;
use super::subject::{CounterField, Subject};

/// Default bound for `last_error`, in characters.
pub const MAX_ERROR_CHARS: usize = 2000;

/// Queue status of a task.
///
/// State transitions:
/// - Pending -> (applied) -> deleted
/// - Pending -> Retrying -> Retrying ... -> (applied) -> deleted
/// - Pending/Retrying -> (retry budget spent) -> dead-letter store
///
/// Success and dead-lettering remove the row, so there are no terminal variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Ready as soon as a worker sees it.
    Pending,

    /// Failed at least once; ready again once `next_run_at` has passed.
    Retrying,
}

impl TaskStatus {
    pub const ACTIVE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Retrying];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Retrying => "RETRYING",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RETRYING" => Ok(TaskStatus::Retrying),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Relative counter adjustments carried by one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deltas {
    pub comment: i32,
    pub like: i32,
    pub view: i64,
    pub download: i64,
}

impl Deltas {
    pub fn get(&self, field: CounterField) -> i64 {
        match field {
            CounterField::Comment => i64::from(self.comment),
            CounterField::Like => i64::from(self.like),
            CounterField::View => self.view,
            CounterField::Download => self.download,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Deltas::default()
    }
}

/// One queued projection intent.
///
/// Design:
/// - Created by the enqueue API as `Pending` with `retry_count = 0`.
/// - Only the task processor mutates it, and only through [`ProjectionTask::schedule_retry`].
/// - Never transitions to a "done" state: success deletes it, exhaustion moves it
///   to the dead-letter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionTask {
    pub id: TaskId,
    pub subject: Subject,
    pub deltas: Deltas,

    /// `Some(true)` soft-deletes the document, `Some(false)` restores it.
    pub set_deleted: Option<bool>,

    pub status: TaskStatus,
    pub retry_count: u32,

    /// Only meaningful while `Retrying`.
    pub next_run_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProjectionTask {
    pub fn new(id: TaskId, subject: Subject, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            subject,
            deltas: Deltas::default(),
            set_deleted: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            next_run_at: None,
            last_error: None,
            created_at,
        }
    }

    /// Comment and like deltas saturate at the `i32` bounds; `TaskFactory`
    /// rejects values outside them before getting here.
    pub(crate) fn with_delta(mut self, field: CounterField, delta: i64) -> Self {
        let narrow = || i32::try_from(delta).unwrap_or(if delta < 0 { i32::MIN } else { i32::MAX });
        match field {
            CounterField::Comment => self.deltas.comment = narrow(),
            CounterField::Like => self.deltas.like = narrow(),
            CounterField::View => self.deltas.view = delta,
            CounterField::Download => self.deltas.download = delta,
        }
        self
    }

    pub fn with_set_deleted(mut self, deleted: bool) -> Self {
        self.set_deleted = Some(deleted);
        self
    }

    /// Eligible for pickup at `now`?
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Retrying => self.next_run_at.is_some_and(|at| at <= now),
        }
    }

    /// Record a failed attempt and schedule the next one.
    pub fn schedule_retry(
        &mut self,
        retry_count: u32,
        next_run_at: DateTime<Utc>,
        error: impl Into<String>,
    ) {
        self.status = TaskStatus::Retrying;
        self.retry_count = retry_count;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error.into());
    }
}

/// Truncate an error message to at most `max_chars` characters.
///
/// Counts `char`s, never splits a code point.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}
