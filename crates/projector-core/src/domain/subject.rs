//! Subjects (the primary entities being projected) and their counter fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of primary entity a projection task targets.
///
/// Each kind owns a [`FieldSet`]: the counters its index document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Project,
    Dataset,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Project => "project",
            SubjectKind::Dataset => "dataset",
        }
    }

    pub const ALL: [SubjectKind; 2] = [SubjectKind::Project, SubjectKind::Dataset];

    pub fn field_set(self) -> FieldSet {
        match self {
            SubjectKind::Project => FieldSet::PROJECT,
            SubjectKind::Dataset => FieldSet::DATASET,
        }
    }

    /// Most index calls a single task of any kind can make: the flag plus one per field.
    pub fn max_index_calls() -> u32 {
        let widest = Self::ALL
            .iter()
            .map(|kind| kind.field_set().fields().len())
            .max()
            .unwrap_or(0);
        u32::try_from(widest + 1).unwrap_or(u32::MAX)
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(SubjectKind::Project),
            "dataset" => Ok(SubjectKind::Dataset),
            other => Err(format!("unknown subject kind: {other}")),
        }
    }
}

/// Primary-store id of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(i64);

impl SubjectId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for SubjectId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A concrete entity: kind + id. Two subjects of different kinds never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: SubjectId,
}

impl Subject {
    pub fn new(kind: SubjectKind, id: impl Into<SubjectId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn project(id: i64) -> Self {
        Self::new(SubjectKind::Project, id)
    }

    pub fn dataset(id: i64) -> Self {
        Self::new(SubjectKind::Dataset, id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A counter on the index document that tasks adjust by relative deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    Comment,
    Like,
    View,
    Download,
}

impl CounterField {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterField::Comment => "comment",
            CounterField::Like => "like",
            CounterField::View => "view",
            CounterField::Download => "download",
        }
    }

    /// Views and downloads only ever grow; comments and likes can be undone.
    pub fn allows_decrement(self) -> bool {
        matches!(self, CounterField::Comment | CounterField::Like)
    }
}

impl fmt::Display for CounterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of counters a subject kind projects.
///
/// The order is the order in which the processor applies deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSet(&'static [CounterField]);

impl FieldSet {
    pub const PROJECT: FieldSet =
        FieldSet(&[CounterField::Comment, CounterField::Like, CounterField::View]);
    pub const DATASET: FieldSet = FieldSet(&[CounterField::Download]);

    pub fn fields(&self) -> &'static [CounterField] {
        self.0
    }

    pub fn contains(&self, field: CounterField) -> bool {
        self.0.contains(&field)
    }
}
