//! Queue and dead-letter identifiers.
//!
//! Both wrap a ULID, so ids sort in creation order and can be minted by any
//! enqueuing process without coordination. The marker type keeps a `TaskId`
//! from being passed where a `DeadLetterId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker for one kind of id; `PREFIX` is only used for display.
pub trait IdMarker: Send + Sync + 'static {
    const PREFIX: &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Column form: the bare 26-char ULID.
    pub fn to_storage(&self) -> String {
        self.ulid.to_string()
    }

    pub fn from_storage(s: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(s).map(Self::from_ulid)
    }

    /// Milliseconds since the epoch encoded in the ULID.
    pub fn timestamp_ms(&self) -> u64 {
        self.ulid.timestamp_ms()
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::PREFIX, self.ulid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    const PREFIX: &'static str = "task-";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeadLetter {}

impl IdMarker for DeadLetter {
    const PREFIX: &'static str = "dlq-";
}

pub type TaskId = Id<Task>;
pub type DeadLetterId = Id<DeadLetter>;
