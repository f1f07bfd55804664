//! SQLite-backed task queue and dead-letter store.
//!
//! # Tables
//!
//! - **`projection_tasks`**: active queue rows (PENDING / RETRYING) plus the
//!   claim columns used when several workers share one database.
//! - **`projection_dead_letters`**: append-only snapshots of tasks that spent
//!   their retry budget.
//!
//! Timestamps are epoch milliseconds, ids are bare ULID text (which sorts in
//! creation order).
//!
//! # Concurrency
//!
//! One connection behind `Arc<Mutex<Connection>>`. Every async port method runs
//! its SQLite work on `spawn_blocking`; the mutex is never held across an
//! `.await`. [`SqliteProjectionStore::transaction`] is synchronous and meant to
//! be called where the caller already does blocking primary-store writes.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::app::enqueue::TaskFactory;
use crate::domain::{
    DeadLetterEntry, DeadLetterId, Deltas, ProjectionTask, PurgeFilter, Subject, SubjectKind,
    TaskId, TaskStatus,
};
use crate::error::{ProjectorError, StoreError};
use crate::observability::QueueCounts;
use crate::ports::{Change, Claim, DeadLetterStore, TaskStore, UnitOfWork};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS projection_tasks (
    id               TEXT PRIMARY KEY,
    subject_kind     TEXT NOT NULL,
    subject_id       INTEGER NOT NULL,
    delta_comment    INTEGER NOT NULL DEFAULT 0,
    delta_like       INTEGER NOT NULL DEFAULT 0,
    delta_view       INTEGER NOT NULL DEFAULT 0,
    delta_download   INTEGER NOT NULL DEFAULT 0,
    set_deleted      INTEGER,
    status           TEXT NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    next_run_at      INTEGER,
    last_error       TEXT,
    created_at       INTEGER NOT NULL,
    claimed_by       TEXT,
    claim_expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_projection_tasks_ready
    ON projection_tasks (status, next_run_at, created_at);
CREATE INDEX IF NOT EXISTS idx_projection_tasks_subject
    ON projection_tasks (subject_kind, subject_id, created_at);

CREATE TABLE IF NOT EXISTS projection_dead_letters (
    id             TEXT PRIMARY KEY,
    task_id        TEXT NOT NULL,
    subject_kind   TEXT NOT NULL,
    subject_id     INTEGER NOT NULL,
    delta_comment  INTEGER NOT NULL DEFAULT 0,
    delta_like     INTEGER NOT NULL DEFAULT 0,
    delta_view     INTEGER NOT NULL DEFAULT 0,
    delta_download INTEGER NOT NULL DEFAULT 0,
    set_deleted    INTEGER,
    last_error     TEXT NOT NULL,
    created_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_projection_dead_letters_created
    ON projection_dead_letters (created_at);
";

const TASK_COLUMNS: &str = "t.id, t.subject_kind, t.subject_id, t.delta_comment, t.delta_like, \
     t.delta_view, t.delta_download, t.set_deleted, t.status, t.retry_count, t.next_run_at, \
     t.last_error, t.created_at";

const DEAD_LETTER_COLUMNS: &str = "id, task_id, subject_kind, subject_id, delta_comment, \
     delta_like, delta_view, delta_download, set_deleted, last_error, created_at";

#[derive(Clone)]
pub struct SqliteProjectionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProjectionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating the tables if needed.
    pub fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one SQLite transaction shared by the caller's primary
    /// writes and the enqueued intents.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise, so an intent exists
    /// if and only if the primary write committed.
    pub fn transaction<T, E, F>(&self, factory: &TaskFactory, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&Outbox<'_>) -> Result<T, E>,
    {
        let mut guard = lock(&self.conn)?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = {
            let outbox = Outbox {
                tx: &tx,
                factory,
            };
            f(&outbox)?
        };
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::MutexPoisoned)
}

/// Enqueue handle bound to an open primary-store transaction.
pub struct Outbox<'a> {
    tx: &'a Transaction<'a>,
    factory: &'a TaskFactory,
}

impl Outbox<'_> {
    /// The transaction's connection, for the caller's own writes.
    pub fn connection(&self) -> &Connection {
        self.tx
    }

    pub fn enqueue(&self, task: &ProjectionTask) -> Result<TaskId, StoreError> {
        insert_task(self.tx, task)?;
        Ok(task.id)
    }

    pub fn enqueue_comment_delta(&self, subject_id: i64, delta: i32) -> Result<TaskId, ProjectorError> {
        let task = self.factory.comment_delta(subject_id, delta)?;
        Ok(self.enqueue(&task)?)
    }

    pub fn enqueue_like_delta(&self, subject_id: i64, delta: i32) -> Result<TaskId, ProjectorError> {
        let task = self.factory.like_delta(subject_id, delta)?;
        Ok(self.enqueue(&task)?)
    }

    pub fn enqueue_view_delta(&self, subject_id: i64, delta: i64) -> Result<TaskId, ProjectorError> {
        let task = self.factory.view_delta(subject_id, delta)?;
        Ok(self.enqueue(&task)?)
    }

    pub fn enqueue_download_delta(
        &self,
        subject_id: i64,
        delta: i64,
    ) -> Result<TaskId, ProjectorError> {
        let task = self.factory.download_delta(subject_id, delta)?;
        Ok(self.enqueue(&task)?)
    }

    pub fn enqueue_set_deleted(&self, subject_id: i64, deleted: bool) -> Result<TaskId, ProjectorError> {
        let task = self.factory.set_deleted(subject_id, deleted);
        Ok(self.enqueue(&task)?)
    }

    pub fn enqueue_view_delta_batch(
        &self,
        deltas: &[(i64, i64)],
    ) -> Result<Vec<TaskId>, ProjectorError> {
        let tasks = self.factory.view_delta_batch(deltas)?;
        for task in &tasks {
            insert_task(self.tx, task)?;
        }
        Ok(tasks.iter().map(|t| t.id).collect())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

struct RawSubject {
    kind: String,
    id: i64,
}

impl RawSubject {
    fn into_subject(self) -> Result<Subject, StoreError> {
        let kind: SubjectKind = self.kind.parse().map_err(StoreError::Corrupt)?;
        Ok(Subject::new(kind, self.id))
    }
}

struct RawTask {
    id: String,
    subject: RawSubject,
    deltas: Deltas,
    set_deleted: Option<bool>,
    status: String,
    retry_count: u32,
    next_run_at: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
}

impl RawTask {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject: RawSubject {
                kind: row.get(1)?,
                id: row.get(2)?,
            },
            deltas: Deltas {
                comment: row.get(3)?,
                like: row.get(4)?,
                view: row.get(5)?,
                download: row.get(6)?,
            },
            set_deleted: row.get(7)?,
            status: row.get(8)?,
            retry_count: row.get(9)?,
            next_run_at: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_task(self) -> Result<ProjectionTask, StoreError> {
        Ok(ProjectionTask {
            id: TaskId::from_storage(&self.id)
                .map_err(|e| StoreError::Corrupt(format!("task id {}: {e}", self.id)))?,
            subject: self.subject.into_subject()?,
            deltas: self.deltas,
            set_deleted: self.set_deleted,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            retry_count: self.retry_count,
            next_run_at: self.next_run_at.map(from_millis).transpose()?,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
        })
    }
}

struct RawDeadLetter {
    id: String,
    task_id: String,
    subject: RawSubject,
    deltas: Deltas,
    set_deleted: Option<bool>,
    last_error: String,
    created_at: i64,
}

impl RawDeadLetter {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            subject: RawSubject {
                kind: row.get(2)?,
                id: row.get(3)?,
            },
            deltas: Deltas {
                comment: row.get(4)?,
                like: row.get(5)?,
                view: row.get(6)?,
                download: row.get(7)?,
            },
            set_deleted: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<DeadLetterEntry, StoreError> {
        Ok(DeadLetterEntry {
            id: DeadLetterId::from_storage(&self.id)
                .map_err(|e| StoreError::Corrupt(format!("dead letter id {}: {e}", self.id)))?,
            task_id: TaskId::from_storage(&self.task_id)
                .map_err(|e| StoreError::Corrupt(format!("task id {}: {e}", self.task_id)))?,
            subject: self.subject.into_subject()?,
            deltas: self.deltas,
            set_deleted: self.set_deleted,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
        })
    }
}

// =============================================================================
// Statements
// =============================================================================

fn insert_task(conn: &Connection, task: &ProjectionTask) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO projection_tasks (
            id, subject_kind, subject_id, delta_comment, delta_like, delta_view,
            delta_download, set_deleted, status, retry_count, next_run_at, last_error,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.id.to_storage(),
            task.subject.kind.as_str(),
            task.subject.id.get(),
            task.deltas.comment,
            task.deltas.like,
            task.deltas.view,
            task.deltas.download,
            task.set_deleted,
            task.status.as_str(),
            task.retry_count,
            task.next_run_at.map(to_millis),
            task.last_error,
            to_millis(task.created_at),
        ],
    )?;
    Ok(())
}

fn update_task(conn: &Connection, task: &ProjectionTask) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE projection_tasks
         SET status = ?2, retry_count = ?3, next_run_at = ?4, last_error = ?5,
             claimed_by = NULL, claim_expires_at = NULL
         WHERE id = ?1",
        params![
            task.id.to_storage(),
            task.status.as_str(),
            task.retry_count,
            task.next_run_at.map(to_millis),
            task.last_error,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(task.id.to_string()));
    }
    Ok(())
}

fn delete_task(conn: &Connection, id: TaskId) -> Result<(), StoreError> {
    let changed = conn.execute(
        "DELETE FROM projection_tasks WHERE id = ?1",
        params![id.to_storage()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Fails unless the row exists and its claim belongs to `owner`.
fn check_claim(conn: &Connection, id: TaskId, owner: &str) -> Result<(), StoreError> {
    let holder: Option<Option<String>> = conn
        .query_row(
            "SELECT claimed_by FROM projection_tasks WHERE id = ?1",
            params![id.to_storage()],
            |row| row.get(0),
        )
        .optional()?;
    match holder {
        None => Err(StoreError::NotFound(id.to_string())),
        Some(holder) if holder.as_deref() == Some(owner) => Ok(()),
        Some(_) => Err(StoreError::ClaimLost(id.to_string())),
    }
}

fn insert_dead_letter(conn: &Connection, entry: &DeadLetterEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO projection_dead_letters (
            id, task_id, subject_kind, subject_id, delta_comment, delta_like, delta_view,
            delta_download, set_deleted, last_error, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id.to_storage(),
            entry.task_id.to_storage(),
            entry.subject.kind.as_str(),
            entry.subject.id.get(),
            entry.deltas.comment,
            entry.deltas.like,
            entry.deltas.view,
            entry.deltas.download,
            entry.set_deleted,
            entry.last_error,
            to_millis(entry.created_at),
        ],
    )?;
    Ok(())
}

/// Ready rows, oldest first. A row carrying `set_deleted` is held back while an
/// older `set_deleted` row for the same subject is still queued.
fn select_ready(
    conn: &Connection,
    now: DateTime<Utc>,
    statuses: &[TaskStatus],
    limit: usize,
) -> Result<Vec<ProjectionTask>, StoreError> {
    if statuses.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let placeholders = (0..statuses.len())
        .map(|i| format!("?{}", i + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {TASK_COLUMNS}
         FROM projection_tasks t
         WHERE t.status IN ({placeholders})
           AND (t.status = 'PENDING' OR (t.next_run_at IS NOT NULL AND t.next_run_at <= ?1))
           AND (t.claim_expires_at IS NULL OR t.claim_expires_at <= ?1)
           AND (t.set_deleted IS NULL OR NOT EXISTS (
                SELECT 1 FROM projection_tasks o
                WHERE o.subject_kind = t.subject_kind
                  AND o.subject_id = t.subject_id
                  AND o.set_deleted IS NOT NULL
                  AND (o.created_at < t.created_at
                       OR (o.created_at = t.created_at AND o.id < t.id))))
         ORDER BY t.created_at, t.id
         LIMIT ?2"
    );

    let mut values = vec![
        Value::Integer(to_millis(now)),
        Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)),
    ];
    values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));

    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(rusqlite::params_from_iter(values), RawTask::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawTask::into_task).collect()
}

fn get_task(conn: &Connection, id: TaskId) -> Result<Option<ProjectionTask>, StoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM projection_tasks t WHERE t.id = ?1");
    conn.query_row(&sql, params![id.to_storage()], RawTask::from_row)
        .optional()?
        .map(RawTask::into_task)
        .transpose()
}

#[async_trait]
impl TaskStore for SqliteProjectionStore {
    async fn save(&self, task: ProjectionTask) -> Result<(), StoreError> {
        self.run(move |conn| insert_task(conn, &task)).await
    }

    async fn save_all(&self, tasks: Vec<ProjectionTask>) -> Result<(), StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for task in &tasks {
                insert_task(&tx, task)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProjectionTask>, StoreError> {
        self.run(move |conn| get_task(conn, id)).await
    }

    async fn find_batch_for_work(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<ProjectionTask>, StoreError> {
        let statuses = statuses.to_vec();
        self.run(move |conn| select_ready(conn, now, &statuses, limit))
            .await
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        statuses: &[TaskStatus],
        limit: usize,
        claim: &Claim,
    ) -> Result<Vec<ProjectionTask>, StoreError> {
        let statuses = statuses.to_vec();
        let claim = claim.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let tasks = select_ready(&tx, now, &statuses, limit)?;
            for task in &tasks {
                tx.execute(
                    "UPDATE projection_tasks SET claimed_by = ?2, claim_expires_at = ?3
                     WHERE id = ?1",
                    params![task.id.to_storage(), claim.owner, to_millis(claim.until)],
                )?;
            }
            tx.commit()?;
            Ok(tasks)
        })
        .await
    }

    async fn renew_claim(&self, id: TaskId, claim: &Claim) -> Result<bool, StoreError> {
        let claim = claim.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE projection_tasks SET claim_expires_at = ?3
                 WHERE id = ?1 AND claimed_by = ?2",
                params![id.to_storage(), claim.owner, to_millis(claim.until)],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn commit(&self, uow: UnitOfWork) -> Result<(), StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(owner) = uow.owner() {
                for change in uow.changes() {
                    match change {
                        Change::UpdateTask(task) => check_claim(&tx, task.id, owner)?,
                        Change::DeleteTask(id) => check_claim(&tx, *id, owner)?,
                        Change::DeadLetter(_) => {}
                    }
                }
            }
            for change in uow.changes() {
                match change {
                    Change::UpdateTask(task) => update_task(&tx, task)?,
                    Change::DeleteTask(id) => delete_task(&tx, *id)?,
                    Change::DeadLetter(entry) => insert_dead_letter(&tx, entry)?,
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT status,
                        COUNT(*),
                        SUM(CASE WHEN next_run_at IS NOT NULL AND next_run_at <= ?1 THEN 1 ELSE 0 END)
                 FROM projection_tasks
                 GROUP BY status",
            )?;
            let rows = stmt
                .query_map(params![to_millis(now)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = QueueCounts::default();
            for (status, total, due) in rows {
                let total = usize::try_from(total).unwrap_or(0);
                match status.parse::<TaskStatus>().map_err(StoreError::Corrupt)? {
                    TaskStatus::Pending => counts.pending = total,
                    TaskStatus::Retrying => {
                        counts.retrying = total;
                        counts.retry_due = usize::try_from(due).unwrap_or(0);
                    }
                }
            }
            Ok(counts)
        })
        .await
    }
}

#[async_trait]
impl DeadLetterStore for SqliteProjectionStore {
    async fn save(&self, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.run(move |conn| insert_dead_letter(conn, &entry)).await
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {DEAD_LETTER_COLUMNS} FROM projection_dead_letters
                 ORDER BY created_at, id LIMIT ?1 OFFSET ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let raw = stmt
                .query_map(
                    params![
                        i64::try_from(limit).unwrap_or(i64::MAX),
                        i64::try_from(offset).unwrap_or(i64::MAX)
                    ],
                    RawDeadLetter::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter().map(RawDeadLetter::into_entry).collect()
        })
        .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.run(|conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM projection_dead_letters", [], |row| {
                    row.get(0)
                })?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
        .await
    }

    async fn purge(&self, filter: PurgeFilter) -> Result<usize, StoreError> {
        self.run(move |conn| {
            let removed = match filter {
                PurgeFilter::All => conn.execute("DELETE FROM projection_dead_letters", [])?,
                PurgeFilter::OlderThan(cutoff) => conn.execute(
                    "DELETE FROM projection_dead_letters WHERE created_at < ?1",
                    params![to_millis(cutoff)],
                )?,
                PurgeFilter::Ids(ids) => {
                    let tx = conn.transaction()?;
                    let mut removed = 0;
                    for id in ids {
                        removed += tx.execute(
                            "DELETE FROM projection_dead_letters WHERE id = ?1",
                            params![id.to_storage()],
                        )?;
                    }
                    tx.commit()?;
                    removed
                }
            };
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CounterField;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn task_at(subject: Subject, offset_secs: i64) -> ProjectionTask {
        ProjectionTask::new(
            TaskId::from_ulid(Ulid::new()),
            subject,
            t0() + ChronoDuration::seconds(offset_secs),
        )
    }

    fn factory() -> TaskFactory {
        let clock = FixedClock::new(t0());
        TaskFactory::new(
            SubjectKind::Project,
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(clock),
        )
    }

    #[tokio::test]
    async fn tasks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let task = task_at(Subject::project(42), 0).with_delta(CounterField::Comment, 1);
        {
            let store = SqliteProjectionStore::open(&path).unwrap();
            TaskStore::save(&store, task.clone()).await.unwrap();
        }

        let reopened = SqliteProjectionStore::open(&path).unwrap();
        let batch = reopened
            .find_batch_for_work(t0(), &TaskStatus::ACTIVE, 100)
            .await
            .unwrap();
        assert_eq!(batch, vec![task]);
    }

    #[tokio::test]
    async fn retry_state_roundtrips_and_gates_selection() {
        let store = SqliteProjectionStore::open_in_memory().unwrap();
        let mut task = task_at(Subject::dataset(3), 0).with_delta(CounterField::Download, 4);
        TaskStore::save(&store, task.clone()).await.unwrap();

        task.schedule_retry(2, t0() + ChronoDuration::seconds(2), "índice caído");
        store
            .commit(UnitOfWork::new().update_task(task.clone()))
            .await
            .unwrap();

        assert_eq!(store.get(task.id).await.unwrap(), Some(task.clone()));
        assert!(
            store
                .find_batch_for_work(t0() + ChronoDuration::seconds(1), &TaskStatus::ACTIVE, 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store
                .find_batch_for_work(t0() + ChronoDuration::seconds(2), &[TaskStatus::Retrying], 10)
                .await
                .unwrap()
                .len(),
            1
        );

        let counts = store.counts(t0() + ChronoDuration::seconds(2)).await.unwrap();
        assert_eq!(counts.retrying, 1);
        assert_eq!(counts.retry_due, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn flag_rows_wait_for_older_flag_rows() {
        let store = SqliteProjectionStore::open_in_memory().unwrap();
        let delete = task_at(Subject::project(9), 0).with_set_deleted(true);
        let restore = task_at(Subject::project(9), 1).with_set_deleted(false);
        let same_id_other_kind = task_at(Subject::dataset(9), 2).with_set_deleted(true);
        store
            .save_all(vec![delete.clone(), restore.clone(), same_id_other_kind.clone()])
            .await
            .unwrap();

        let ids = |tasks: Vec<ProjectionTask>| tasks.into_iter().map(|t| t.id).collect::<Vec<_>>();

        let first = store
            .find_batch_for_work(t0() + ChronoDuration::seconds(5), &TaskStatus::ACTIVE, 10)
            .await
            .unwrap();
        assert_eq!(ids(first), vec![delete.id, same_id_other_kind.id]);

        store.delete(delete.id).await.unwrap();
        let second = store
            .find_batch_for_work(t0() + ChronoDuration::seconds(5), &TaskStatus::ACTIVE, 10)
            .await
            .unwrap();
        assert_eq!(ids(second), vec![restore.id, same_id_other_kind.id]);
    }

    #[tokio::test]
    async fn claims_skip_rows_until_settled_or_expired() {
        let store = SqliteProjectionStore::open_in_memory().unwrap();
        let a = task_at(Subject::project(1), 0).with_delta(CounterField::View, 1);
        let b = task_at(Subject::project(2), 1).with_delta(CounterField::View, 1);
        store.save_all(vec![a.clone(), b.clone()]).await.unwrap();

        let claim = Claim {
            owner: "worker-a".into(),
            until: t0() + ChronoDuration::seconds(60),
        };
        let first = store
            .claim_batch(t0(), &TaskStatus::ACTIVE, 1, &claim)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, a.id);

        let other = Claim {
            owner: "worker-b".into(),
            until: t0() + ChronoDuration::seconds(60),
        };
        let second = store
            .claim_batch(t0(), &TaskStatus::ACTIVE, 10, &other)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, b.id);

        // settling clears the claim
        let mut retried = a.clone();
        retried.schedule_retry(1, t0(), "down");
        store
            .commit(UnitOfWork::new().update_task(retried))
            .await
            .unwrap();
        let third = store
            .find_batch_for_work(t0(), &TaskStatus::ACTIVE, 10)
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].id, a.id);

        let expired = store
            .find_batch_for_work(t0() + ChronoDuration::seconds(60), &TaskStatus::ACTIVE, 10)
            .await
            .unwrap();
        assert_eq!(expired.len(), 2);
    }

    #[tokio::test]
    async fn stale_claim_holders_cannot_settle_or_renew() {
        let store = SqliteProjectionStore::open_in_memory().unwrap();
        let task = task_at(Subject::project(3), 0).with_delta(CounterField::Comment, 1);
        TaskStore::save(&store, task.clone()).await.unwrap();

        let a = Claim {
            owner: "worker-a".into(),
            until: t0() + ChronoDuration::seconds(2),
        };
        store.claim_batch(t0(), &TaskStatus::ACTIVE, 10, &a).await.unwrap();
        let renewed = Claim {
            until: t0() + ChronoDuration::seconds(4),
            ..a.clone()
        };
        assert!(store.renew_claim(task.id, &renewed).await.unwrap());

        // worker-a's lease runs out and worker-b takes the row over
        let b = Claim {
            owner: "worker-b".into(),
            until: t0() + ChronoDuration::seconds(60),
        };
        let taken = store
            .claim_batch(t0() + ChronoDuration::seconds(5), &TaskStatus::ACTIVE, 10, &b)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        assert!(!store.renew_claim(task.id, &renewed).await.unwrap());
        let mut retried = task.clone();
        retried.schedule_retry(1, t0(), "down");
        let err = store
            .commit(UnitOfWork::new().held_by("worker-a").update_task(retried))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost(_)));
        assert_eq!(store.get(task.id).await.unwrap().unwrap().retry_count, 0);

        store
            .commit(UnitOfWork::new().held_by("worker-b").delete_task(task.id))
            .await
            .unwrap();
        assert!(store.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_lettering_is_atomic() {
        let store = SqliteProjectionStore::open_in_memory().unwrap();
        let task = task_at(Subject::project(5), 0).with_delta(CounterField::Like, -1);
        TaskStore::save(&store, task.clone()).await.unwrap();

        let entry = DeadLetterEntry::from_task(
            DeadLetterId::from_ulid(Ulid::new()),
            &task,
            "gave up",
            t0(),
        );

        // the second delete fails, so the whole unit rolls back
        let uow = UnitOfWork::new()
            .dead_letter(entry.clone())
            .delete_task(task.id)
            .delete_task(task.id);
        assert!(matches!(store.commit(uow).await, Err(StoreError::NotFound(_))));
        assert_eq!(DeadLetterStore::count(&store).await.unwrap(), 0);
        assert!(store.get(task.id).await.unwrap().is_some());

        let uow = UnitOfWork::new().dead_letter(entry.clone()).delete_task(task.id);
        store.commit(uow).await.unwrap();
        assert_eq!(store.list(10, 0).await.unwrap(), vec![entry.clone()]);
        assert!(store.get(task.id).await.unwrap().is_none());

        assert_eq!(store.purge(PurgeFilter::Ids(vec![entry.id])).await.unwrap(), 1);
        assert_eq!(DeadLetterStore::count(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outbox_commits_with_the_primary_write() {
        let store = SqliteProjectionStore::open_in_memory().unwrap();
        let factory = factory();
        store
            .transaction(&factory, |outbox| -> Result<(), ProjectorError> {
                outbox
                    .connection()
                    .execute_batch("CREATE TABLE comments (id INTEGER PRIMARY KEY, project_id INTEGER)")
                    .map_err(StoreError::from)?;
                Ok(())
            })
            .unwrap();

        store
            .transaction(&factory, |outbox| -> Result<TaskId, ProjectorError> {
                outbox
                    .connection()
                    .execute("INSERT INTO comments (project_id) VALUES (42)", [])
                    .map_err(StoreError::from)?;
                outbox.enqueue_comment_delta(42, 1)
            })
            .unwrap();

        let failed = store.transaction(&factory, |outbox| -> Result<(), ProjectorError> {
            outbox
                .connection()
                .execute("INSERT INTO comments (project_id) VALUES (43)", [])
                .map_err(StoreError::from)?;
            outbox.enqueue_comment_delta(43, 1)?;
            Err(ProjectorError::Config("primary write rejected".into()))
        });
        assert!(failed.is_err());

        let batch = store
            .find_batch_for_work(t0(), &TaskStatus::ACTIVE, 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, Subject::project(42));
        assert_eq!(batch[0].deltas.comment, 1);
    }

    #[tokio::test]
    async fn outbox_rejects_fields_outside_the_kind() {
        let store = SqliteProjectionStore::open_in_memory().unwrap();
        let result = store.transaction(&factory(), |outbox| outbox.enqueue_download_delta(1, 1));
        assert!(matches!(
            result,
            Err(ProjectorError::FieldNotProjected { .. })
        ));
        assert_eq!(store.counts(t0()).await.unwrap().total(), 0);
    }
}
