//! Document-collection store with atomic single-document operations.
//!
//! Every operation holds its collection's lock for its whole duration, so a
//! filter match and the write it guards cannot interleave with another
//! writer. That is the property conditional updates rely on: of several
//! writers filtering on the same `{id, version}`, exactly one matches.
//!
//! A store opened on a data directory journals every mutation before
//! applying it and recovers its collections on the next start. The
//! database handle is opened lazily on first use and shared afterwards.

use crate::core::{Document, ID_FIELD, Result, StoreError};
use crate::storage::journal::{Journal, JournalEntry};
use crate::storage::{
    BackendKind, InsertOutcome, RecordBackend, TimestampCheck, WriteGuard, WriteReceipt,
    document_id, document_version,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

/// Equality filter on `id` and, optionally, `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFilter {
    pub id: String,
    pub version: Option<u64>,
}

impl DocumentFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        document_id(document) == Some(self.id.as_str())
            && self
                .version
                .is_none_or(|version| document_version(document) == version)
    }
}

type Collection = Arc<RwLock<Vec<Document>>>;

struct Database {
    name: String,
    collections: RwLock<HashMap<String, Collection>>,
    journal: Option<Journal>,
}

impl Database {
    async fn collection(&self, name: &str) -> Collection {
        if let Some(existing) = self.collections.read().await.get(name) {
            return Arc::clone(existing);
        }
        let mut collections = self.collections.write().await;
        Arc::clone(collections.entry(name.to_string()).or_default())
    }

    /// Must be called while the collection's write lock is held.
    async fn log(&self, entry: JournalEntry) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(&entry).await,
            None => Ok(()),
        }
    }
}

pub struct DocumentBackend {
    database_name: String,
    data_dir: Option<PathBuf>,
    database: OnceCell<Database>,
}

impl DocumentBackend {
    /// Durable database kept under `data_dir/<database>`; nothing is read
    /// until the first operation.
    pub fn open<P: AsRef<Path>>(data_dir: P, database: impl Into<String>) -> Self {
        Self {
            database_name: database.into(),
            data_dir: Some(data_dir.as_ref().to_path_buf()),
            database: OnceCell::new(),
        }
    }

    /// Database that lives only as long as this handle.
    pub fn in_memory(database: impl Into<String>) -> Self {
        Self {
            database_name: database.into(),
            data_dir: None,
            database: OnceCell::new(),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.data_dir.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.database.initialized()
    }

    async fn database(&self) -> Result<&Database> {
        self.database
            .get_or_try_init(|| async {
                let name = self.database_name.trim();
                if name.is_empty() {
                    return Err(StoreError::Connection(
                        "database name must not be empty".to_string(),
                    ));
                }

                let (journal, recovered) = match &self.data_dir {
                    Some(data_dir) => {
                        let (journal, recovered) = Journal::open(data_dir.join(name)).await?;
                        (Some(journal), recovered)
                    }
                    None => (None, Default::default()),
                };
                let collections = recovered
                    .into_iter()
                    .map(|(collection, docs)| (collection, Arc::new(RwLock::new(docs))))
                    .collect::<HashMap<_, _>>();

                info!(
                    database = name,
                    collections = collections.len(),
                    path = ?journal.as_ref().map(|j| j.dir().display().to_string()),
                    "document store connected"
                );
                Ok(Database {
                    name: name.to_string(),
                    collections: RwLock::new(collections),
                    journal,
                })
            })
            .await
    }

    async fn collection(&self, name: &str) -> Result<Collection> {
        Ok(self.database().await?.collection(name).await)
    }

    pub async fn database_name(&self) -> Result<String> {
        Ok(self.database().await?.name.clone())
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<Option<Document>> {
        let handle = self.collection(collection).await?;
        let docs = handle.read().await;
        Ok(docs.iter().find(|doc| filter.matches(doc)).cloned())
    }

    pub async fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        let handle = self.collection(collection).await?;
        let docs = handle.read().await;
        Ok(docs.clone())
    }

    /// Replaces the first matching document and returns it as stored.
    /// `None` when nothing matched.
    pub async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        mut update: Document,
    ) -> Result<Option<Document>> {
        update.insert(ID_FIELD.to_string(), JsonValue::String(filter.id.clone()));

        let database = self.database().await?;
        let handle = database.collection(collection).await;
        let mut docs = handle.write().await;
        let Some(index) = docs.iter().position(|doc| filter.matches(doc)) else {
            return Ok(None);
        };
        database
            .log(JournalEntry::Replace {
                collection: collection.to_string(),
                id: filter.id.clone(),
                document: update.clone(),
            })
            .await?;
        docs[index] = update;
        Ok(Some(docs[index].clone()))
    }

    /// Fails with [`StoreError::DuplicateId`] when the id is taken.
    pub async fn insert_one(&self, collection: &str, document: Document) -> Result<()> {
        let Some(id) = document_id(&document).map(str::to_string) else {
            return Err(StoreError::Corrupt(
                collection.to_string(),
                "document has no string id".to_string(),
            ));
        };

        let database = self.database().await?;
        let handle = database.collection(collection).await;
        let mut docs = handle.write().await;
        if docs.iter().any(|doc| document_id(doc) == Some(id.as_str())) {
            return Err(StoreError::DuplicateId(collection.to_string(), id));
        }
        database
            .log(JournalEntry::Insert {
                collection: collection.to_string(),
                document: document.clone(),
            })
            .await?;
        docs.push(document);
        Ok(())
    }

    /// Number of documents removed (0 or 1).
    pub async fn delete_one(&self, collection: &str, filter: &DocumentFilter) -> Result<u64> {
        let database = self.database().await?;
        let handle = database.collection(collection).await;
        let mut docs = handle.write().await;
        let Some(index) = docs.iter().position(|doc| filter.matches(doc)) else {
            return Ok(0);
        };
        database
            .log(JournalEntry::Delete {
                collection: collection.to_string(),
                id: filter.id.clone(),
            })
            .await?;
        docs.remove(index);
        Ok(1)
    }
}

#[async_trait]
impl RecordBackend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn serialize_writes(&self, _collection: &str) -> Option<WriteGuard> {
        None
    }

    async fn check_file_timestamp(
        &self,
        _collection: &str,
        _expected: Option<DateTime<Utc>>,
    ) -> Result<TimestampCheck> {
        Ok(TimestampCheck::Current(None))
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.find_all(collection).await
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.find_one(collection, &DocumentFilter::by_id(id)).await
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<InsertOutcome> {
        match self.insert_one(collection, document).await {
            Ok(()) => Ok(InsertOutcome::Inserted(WriteReceipt::default())),
            Err(StoreError::DuplicateId(..)) => Ok(InsertOutcome::DuplicateId),
            Err(err) => Err(err),
        }
    }

    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
        document: Document,
    ) -> Result<Option<WriteReceipt>> {
        let filter = DocumentFilter::by_id(id).at_version(expected);
        Ok(self
            .find_one_and_update(collection, &filter, document)
            .await?
            .map(|_| WriteReceipt::default()))
    }

    async fn delete_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
    ) -> Result<Option<WriteReceipt>> {
        let filter = DocumentFilter::by_id(id).at_version(expected);
        let deleted = self.delete_one(collection, &filter).await?;
        Ok((deleted > 0).then(WriteReceipt::default))
    }
}
