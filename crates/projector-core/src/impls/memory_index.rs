//! In-memory search index used by tests and the demo.
//!
//! Keeps one document per subject, records every call it receives and can be
//! scripted to fail or to respond slowly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{CounterField, Subject};
use crate::error::IndexError;
use crate::ports::ExternalIndex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexDocument {
    pub counters: BTreeMap<CounterField, i64>,
    pub deleted: bool,
}

impl IndexDocument {
    pub fn counter(&self, field: CounterField) -> i64 {
        self.counters.get(&field).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCall {
    Increment {
        subject: Subject,
        field: CounterField,
        amount: i64,
    },
    Decrement {
        subject: Subject,
        field: CounterField,
        amount: i64,
    },
    SetDeleted {
        subject: Subject,
        deleted: bool,
    },
}

#[derive(Debug, Default)]
struct State {
    documents: HashMap<Subject, IndexDocument>,
    calls: Vec<IndexCall>,
    failures: VecDeque<IndexError>,
    always_fail: Option<IndexError>,
    latency: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    state: Arc<Mutex<State>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `error`, then behave normally.
    pub fn fail_next(&self, n: usize, error: IndexError) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat_n(error, n));
    }

    /// Fail every call until [`InMemoryIndex::recover`].
    pub fn fail_always(&self, error: IndexError) {
        self.lock().always_fail = Some(error);
    }

    pub fn recover(&self) {
        let mut state = self.lock();
        state.always_fail = None;
        state.failures.clear();
    }

    /// Delay every call by `latency` before answering.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn document(&self, subject: Subject) -> Option<IndexDocument> {
        self.lock().documents.get(&subject).cloned()
    }

    /// Every call received, including the ones that failed.
    pub fn calls(&self) -> Vec<IndexCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn call(&self, call: IndexCall) -> Result<(), IndexError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.calls.push(call);
        if let Some(error) = state.always_fail.clone() {
            return Err(error);
        }
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        match call {
            IndexCall::Increment {
                subject,
                field,
                amount,
            } => {
                let doc = state.documents.entry(subject).or_default();
                *doc.counters.entry(field).or_insert(0) += amount;
            }
            IndexCall::Decrement {
                subject,
                field,
                amount,
            } => {
                let doc = state.documents.entry(subject).or_default();
                *doc.counters.entry(field).or_insert(0) -= amount;
            }
            IndexCall::SetDeleted { subject, deleted } => {
                state.documents.entry(subject).or_default().deleted = deleted;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalIndex for InMemoryIndex {
    async fn increment_field(
        &self,
        subject: Subject,
        field: CounterField,
        amount: i64,
    ) -> Result<(), IndexError> {
        self.call(IndexCall::Increment {
            subject,
            field,
            amount,
        })
        .await
    }

    async fn decrement_field(
        &self,
        subject: Subject,
        field: CounterField,
        amount: i64,
    ) -> Result<(), IndexError> {
        self.call(IndexCall::Decrement {
            subject,
            field,
            amount,
        })
        .await
    }

    async fn set_deleted_flag(&self, subject: Subject, deleted: bool) -> Result<(), IndexError> {
        self.call(IndexCall::SetDeleted { subject, deleted }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let index = InMemoryIndex::new();
        let subject = Subject::project(1);
        index.fail_next(1, IndexError::Unavailable("down".into()));

        let first = index.increment_field(subject, CounterField::Like, 2).await;
        let second = index.increment_field(subject, CounterField::Like, 2).await;
        index.decrement_field(subject, CounterField::Like, 1).await.unwrap();

        assert!(first.is_err());
        assert!(second.is_ok());
        assert_eq!(index.calls().len(), 3);
        assert_eq!(index.document(subject).unwrap().counter(CounterField::Like), 1);
    }

    #[tokio::test]
    async fn fail_always_until_recover() {
        let index = InMemoryIndex::new();
        let subject = Subject::dataset(3);
        index.fail_always(IndexError::Rejected("mapping".into()));

        assert!(index.set_deleted_flag(subject, true).await.is_err());
        assert!(index.document(subject).is_none());

        index.recover();
        index.set_deleted_flag(subject, true).await.unwrap();
        assert!(index.document(subject).unwrap().deleted);
    }
}
