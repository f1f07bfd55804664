//! Outcome of one attempt to apply a task to the index.

use crate::error::IndexError;

use super::subject::CounterField;

/// Which index call an attempt stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStep {
    SetDeleted(bool),
    Increment(CounterField),
    Decrement(CounterField),
}

impl std::fmt::Display for IndexStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexStep::SetDeleted(flag) => write!(f, "set_deleted({flag})"),
            IndexStep::Increment(field) => write!(f, "increment({field})"),
            IndexStep::Decrement(field) => write!(f, "decrement({field})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every effect the task carries reached the index.
    Success { calls: usize },

    /// An index call failed; effects after `step` were not attempted.
    RetryableFailure { step: IndexStep, error: IndexError },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Success { .. })
    }
}
