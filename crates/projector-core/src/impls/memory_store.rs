//! In-memory TaskStore + DeadLetterStore.
//!
//! Used by tests and the CLI demo. Same selection rules and commit semantics as
//! the SQLite store, without durability.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{DeadLetterEntry, ProjectionTask, PurgeFilter, Subject, TaskId, TaskStatus};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::{Change, Claim, DeadLetterStore, TaskStore, UnitOfWork, is_selectable};

#[derive(Debug, Clone)]
struct Row {
    task: ProjectionTask,
    claim: Option<Claim>,
}

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<TaskId, Row>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl State {
    /// Rows eligible at `now`, oldest first, honoring per-subject flag order.
    fn select(&self, now: DateTime<Utc>, statuses: &[TaskStatus], limit: usize) -> Vec<TaskId> {
        let mut ordered: Vec<&Row> = self.rows.values().collect();
        ordered.sort_by_key(|row| (row.task.created_at, row.task.id));

        let mut flagged: HashSet<Subject> = HashSet::new();
        let mut selected = Vec::new();
        for row in ordered {
            if selected.len() >= limit {
                break;
            }
            let task = &row.task;
            let blocked = task.set_deleted.is_some() && flagged.contains(&task.subject);
            if task.set_deleted.is_some() {
                flagged.insert(task.subject);
            }

            let claim_until = row.claim.as_ref().map(|c| c.until);
            if !blocked && is_selectable(task, claim_until, now, statuses) {
                selected.push(task.id);
            }
        }
        selected
    }

    /// Validates a unit of work against the current rows without touching them.
    fn check(&self, changes: &[Change], owner: Option<&str>) -> Result<(), StoreError> {
        let mut removed: HashSet<TaskId> = HashSet::new();
        for change in changes {
            let id = match change {
                Change::UpdateTask(task) => task.id,
                Change::DeleteTask(id) => *id,
                Change::DeadLetter(_) => continue,
            };
            let row = self
                .rows
                .get(&id)
                .filter(|_| !removed.contains(&id))
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let holder = row.claim.as_ref().map(|c| c.owner.as_str());
            if owner.is_some_and(|owner| holder != Some(owner)) {
                return Err(StoreError::ClaimLost(id.to_string()));
            }
            if matches!(change, Change::DeleteTask(_)) {
                removed.insert(id);
            }
        }
        Ok(())
    }

    /// Only called after `check` passed for the whole unit of work.
    fn apply(&mut self, change: Change) {
        match change {
            Change::UpdateTask(task) => {
                if let Some(row) = self.rows.get_mut(&task.id) {
                    row.task = task;
                    row.claim = None;
                }
            }
            Change::DeleteTask(id) => {
                self.rows.remove(&id);
            }
            Change::DeadLetter(entry) => self.dead_letters.push(entry),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every queued task, oldest first.
    pub async fn tasks(&self) -> Vec<ProjectionTask> {
        let state = self.state.lock().await;
        let mut tasks: Vec<ProjectionTask> = state.rows.values().map(|r| r.task.clone()).collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    /// Current claim holder of a task, if any.
    pub async fn claim_of(&self, id: TaskId) -> Option<Claim> {
        let state = self.state.lock().await;
        state.rows.get(&id).and_then(|r| r.claim.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn save(&self, task: ProjectionTask) -> Result<(), StoreError> {
        self.save_all(vec![task]).await
    }

    async fn save_all(&self, tasks: Vec<ProjectionTask>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for task in tasks {
            state.rows.insert(task.id, Row { task, claim: None });
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(&id).map(|r| r.task.clone()))
    }

    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, StoreError> {
        let state = self.state.lock().await;
        let ids = state.select(now, statuses, limit);
        Ok(ids
            .into_iter()
            .filter_map(|id| state.rows.get(&id).map(|r| r.task.clone()))
            .collect())
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
        claim: &Claim,
    ) -> Result<Vec<ProjectionTask>, StoreError> {
        let mut state = self.state.lock().await;
        let ids = state.select(now, statuses, limit);
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = state.rows.get_mut(&id) {
                row.claim = Some(claim.clone());
                claimed.push(row.task.clone());
            }
        }
        Ok(claimed)
    }

    async fn renew_claim(&self, id: TaskId, claim: &Claim) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(&id) {
            Some(row) if row.claim.as_ref().is_some_and(|c| c.owner == claim.owner) => {
                row.claim = Some(claim.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(&self, uow: UnitOfWork) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let (changes, owner) = uow.into_parts();
        state.check(&changes, owner.as_deref())?;
        for change in changes {
            state.apply(change);
        }
        Ok(())
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for row in state.rows.values() {
            match row.task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Retrying => {
                    counts.retrying += 1;
                    if row.task.is_ready(now) {
                        counts.retry_due += 1;
                    }
                }
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn save(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.state.lock().await.dead_letters.push(entry);
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries = state.dead_letters.clone();
        entries.sort_by_key(|e| (e.created_at, e.id));
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.dead_letters.len())
    }

    async fn purge(&self, filter: PurgeFilter) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.dead_letters.len();
        state.dead_letters.retain(|entry| !filter.matches(entry));
        Ok(before - state.dead_letters.len())
    }
}
