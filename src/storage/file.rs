//! Flat-file collections: one pretty-printed JSON array per collection.
//!
//! Every mutation rewrites the whole file. Files are replaced atomically
//! (temp file + rename) and their modification time doubles as the
//! collection timestamp clients hand back as a write precondition.

use crate::core::{Document, Result, StoreError};
use crate::storage::{
    BackendKind, InsertOutcome, RecordBackend, TimestampCheck, WriteGuard, WriteReceipt,
    document_id, document_version,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

pub struct FileBackend {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FileBackend {
    /// Opens (and creates if needed) the directory holding collection files.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::io(&root.display().to_string(), e))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    /// Whole collection; a missing or empty file is an empty collection.
    pub async fn read_all(&self, collection: &str) -> Result<Vec<Document>> {
        let bytes = match tokio::fs::read(self.path_for(collection)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(collection, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let parsed: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::serialization(collection, e))?;
        let JsonValue::Array(items) = parsed else {
            return Err(StoreError::Corrupt(
                collection.to_string(),
                "top-level value is not an array".to_string(),
            ));
        };

        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                JsonValue::Object(doc) => Ok(doc),
                _ => Err(StoreError::Corrupt(
                    collection.to_string(),
                    format!("entry {index} is not an object"),
                )),
            })
            .collect()
    }

    /// Replaces the collection file and returns its new timestamp.
    pub async fn write_all(
        &self,
        collection: &str,
        records: &[Document],
    ) -> Result<Option<DateTime<Utc>>> {
        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|e| StoreError::serialization(collection, e))?;
        let root = self.root.clone();
        let path = self.path_for(collection);
        let name = collection.to_string();

        let modified =
            tokio::task::spawn_blocking(move || write_atomically(&root, &path, &bytes))
                .await?
                .map_err(|e| StoreError::io(&name, e))?;

        debug!(collection, records = records.len(), "collection file rewritten");
        Ok(Some(modified))
    }

    /// Last-modified time of the collection file, `None` before the first write.
    pub async fn file_timestamp(&self, collection: &str) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::metadata(self.path_for(collection)).await {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| StoreError::io(collection, e))?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(collection, e)),
        }
    }

    fn collection_lock(&self, collection: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Writes through a sibling temp file, then bumps the mtime past the
/// previous one so every rewrite is observable as a timestamp change even
/// on coarse-grained filesystems.
fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<DateTime<Utc>> {
    let previous = fs::metadata(path).and_then(|meta| meta.modified()).ok();

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    let file = tmp.persist(path).map_err(|e| e.error)?;

    let mut modified = file.metadata()?.modified()?;
    if let Some(previous) = previous {
        let mut step = Duration::from_millis(1);
        for _ in 0..MAX_BUMPS {
            if modified > previous {
                break;
            }
            file.set_modified(previous + step)?;
            modified = file.metadata()?.modified()?;
            step *= 2;
        }
    }
    Ok(DateTime::<Utc>::from(modified))
}

/// Doubling steps from 1ms; enough to clear 2s-granularity filesystems.
const MAX_BUMPS: usize = 12;

#[async_trait]
impl RecordBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn serialize_writes(&self, collection: &str) -> Option<WriteGuard> {
        Some(self.collection_lock(collection).lock_owned().await)
    }

    async fn check_file_timestamp(
        &self,
        collection: &str,
        expected: Option<DateTime<Utc>>,
    ) -> Result<TimestampCheck> {
        let actual = self.file_timestamp(collection).await?;
        Ok(match expected {
            Some(expected) if actual != Some(expected) => {
                TimestampCheck::Modified { expected, actual }
            }
            _ => TimestampCheck::Current(actual),
        })
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.read_all(collection).await
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self
            .read_all(collection)
            .await?
            .into_iter()
            .find(|doc| document_id(doc) == Some(id)))
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<InsertOutcome> {
        let mut records = self.read_all(collection).await?;
        if records
            .iter()
            .any(|doc| document_id(doc).is_some() && document_id(doc) == document_id(&document))
        {
            return Ok(InsertOutcome::DuplicateId);
        }
        records.push(document);
        let file_timestamp = self.write_all(collection, &records).await?;
        Ok(InsertOutcome::Inserted(WriteReceipt { file_timestamp }))
    }

    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
        document: Document,
    ) -> Result<Option<WriteReceipt>> {
        let mut records = self.read_all(collection).await?;
        let Some(slot) = records
            .iter_mut()
            .find(|doc| document_id(doc) == Some(id) && document_version(doc) == expected)
        else {
            return Ok(None);
        };
        *slot = document;
        let file_timestamp = self.write_all(collection, &records).await?;
        Ok(Some(WriteReceipt { file_timestamp }))
    }

    async fn delete_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
    ) -> Result<Option<WriteReceipt>> {
        let mut records = self.read_all(collection).await?;
        let before = records.len();
        records.retain(|doc| !(document_id(doc) == Some(id) && document_version(doc) == expected));
        if records.len() == before {
            return Ok(None);
        }
        let file_timestamp = self.write_all(collection, &records).await?;
        Ok(Some(WriteReceipt { file_timestamp }))
    }
}
