use crate::concurrency::Conflict;
use crate::model::Record;
use chrono::{DateTime, Utc};

/// A write that went through.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<T> {
    /// Stored record after the write; for deletes, the record as it was removed.
    pub record: Record<T>,
    /// Collection file timestamp right after the write, file backend only.
    pub file_timestamp: Option<DateTime<Utc>>,
}

/// Result of one create / update / delete.
///
/// Backend failures are the `Err` side of the surrounding `Result`; every
/// variant here is an expected business outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    Applied(Applied<T>),
    Conflict(Box<Conflict<T>>),
    NotFound(String),
    Invalid(String),
}

impl<T> MutationOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn applied(self) -> Option<Record<T>> {
        match self {
            Self::Applied(applied) => Some(applied.record),
            _ => None,
        }
    }

    pub fn conflict(self) -> Option<Conflict<T>> {
        match self {
            Self::Conflict(conflict) => Some(*conflict),
            _ => None,
        }
    }
}

impl<T> From<Box<Conflict<T>>> for MutationOutcome<T> {
    fn from(conflict: Box<Conflict<T>>) -> Self {
        Self::Conflict(conflict)
    }
}
