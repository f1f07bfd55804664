use std::time::Duration;

use thiserror::Error;

use crate::domain::{CounterField, SubjectKind};

#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("field {field} is not projected for {kind} subjects")]
    FieldNotProjected {
        kind: SubjectKind,
        field: CounterField,
    },

    #[error("invalid delta {delta} for field {field}")]
    InvalidDelta { field: CounterField, delta: i64 },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Failures of the task and dead-letter stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    MutexPoisoned,

    /// A row that cannot be mapped back to a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("blocking task failed: {0}")]
    Join(String),

    #[error("task not found: {0}")]
    NotFound(String),

    /// The row's claim belongs to another worker.
    #[error("claim on task {0} is held by another worker")]
    ClaimLost(String),
}

/// Failures reported by the external search index.
///
/// Every variant is treated as retryable by the processor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("index rejected request: {0}")]
    Rejected(String),

    #[error("index call timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T, E = ProjectorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_field() {
        let err = ProjectorError::FieldNotProjected {
            kind: SubjectKind::Dataset,
            field: CounterField::Like,
        };
        assert_eq!(err.to_string(), "field like is not projected for dataset subjects");

        let err = ProjectorError::InvalidDelta {
            field: CounterField::View,
            delta: -3,
        };
        assert_eq!(err.to_string(), "invalid delta -3 for field view");
    }

    #[test]
    fn store_errors_convert_into_projector_errors() {
        let err: ProjectorError = StoreError::MutexPoisoned.into();
        assert!(matches!(err, ProjectorError::Store(StoreError::MutexPoisoned)));
    }
}
