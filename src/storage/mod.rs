//! Storage technologies a collection can live in.
//!
//! Both backends store plain JSON documents keyed by their `id` field and
//! know nothing about entity schemas. Version conditions are expressed on
//! the document's `version` field (missing counts as 0).

pub mod document;
pub mod file;
pub mod journal;

pub use document::{DocumentBackend, DocumentFilter};
pub use file::FileBackend;

use crate::core::{Document, ID_FIELD, Result, VERSION_FIELD};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Held while one read-check-write cycle runs on a collection.
pub type WriteGuard = tokio::sync::OwnedMutexGuard<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    File,
    Document,
}

/// Result of a successful write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Last-modified time of the collection after the write, when tracked.
    pub file_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(WriteReceipt),
    DuplicateId,
}

/// Outcome of comparing a client's collection timestamp with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampCheck {
    /// No precondition given, or it held. Carries the current timestamp.
    Current(Option<DateTime<Utc>>),
    Modified {
        expected: DateTime<Utc>,
        actual: Option<DateTime<Utc>>,
    },
}

/// Operations the record protocol needs from a storage technology.
///
/// Conditional writes return `None` when no document matched `id` at
/// `expected` version.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Exclusive section for mutations on stores without per-document
    /// atomicity. Callers run their whole read-check-write under it.
    async fn serialize_writes(&self, collection: &str) -> Option<WriteGuard>;

    async fn check_file_timestamp(
        &self,
        collection: &str,
        expected: Option<DateTime<Utc>>,
    ) -> Result<TimestampCheck>;

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>>;

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    async fn insert(&self, collection: &str, document: Document) -> Result<InsertOutcome>;

    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
        document: Document,
    ) -> Result<Option<WriteReceipt>>;

    async fn delete_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
    ) -> Result<Option<WriteReceipt>>;
}

pub fn document_id(document: &Document) -> Option<&str> {
    document.get(ID_FIELD).and_then(|value| value.as_str())
}

pub fn document_version(document: &Document) -> u64 {
    document
        .get(VERSION_FIELD)
        .and_then(|value| value.as_u64())
        .unwrap_or(0)
}
