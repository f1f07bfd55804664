//! Domain model (subjects, tasks, dead letters, retry decisions, events).

pub mod dead_letter;
pub mod decision;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod retry;
pub mod subject;
pub mod task;

pub use dead_letter::{DeadLetterEntry, PurgeFilter};
pub use decision::{Decider, Decision, DefaultDecider};
pub use events::ProjectionEvent;
pub use ids::{DeadLetterId, TaskId};
pub use outcome::{ApplyOutcome, IndexStep};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use subject::{CounterField, FieldSet, Subject, SubjectId, SubjectKind};
pub use task::{Deltas, MAX_ERROR_CHARS, ProjectionTask, TaskStatus, truncate_error};
