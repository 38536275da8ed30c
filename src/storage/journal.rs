//! Write-ahead journal and snapshot behind the durable document store.
//!
//! Each mutation is appended as a length-prefixed MessagePack frame before it
//! is applied in memory. Opening a database loads the last snapshot, replays
//! the journal over it and compacts both into a fresh snapshot.

use crate::core::{Document, Result, StoreError};
use crate::storage::document_id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const JOURNAL_FILE: &str = "journal.wal";
pub const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Documents of every collection, keyed by collection name.
pub type Collections = BTreeMap<String, Vec<Document>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    Insert {
        collection: String,
        document: Document,
    },
    Replace {
        collection: String,
        id: String,
        document: Document,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl JournalEntry {
    /// Replaying an entry twice leaves the same state as replaying it once.
    fn apply(self, collections: &mut Collections) {
        match self {
            Self::Insert {
                collection,
                document,
            } => {
                let id = document_id(&document).map(str::to_string);
                upsert(collections.entry(collection).or_default(), id.as_deref(), document);
            }
            Self::Replace {
                collection,
                id,
                document,
            } => upsert(collections.entry(collection).or_default(), Some(&id), document),
            Self::Delete { collection, id } => {
                if let Some(docs) = collections.get_mut(&collection) {
                    docs.retain(|doc| document_id(doc) != Some(id.as_str()));
                }
            }
        }
    }
}

fn upsert(docs: &mut Vec<Document>, id: Option<&str>, document: Document) {
    match docs
        .iter_mut()
        .find(|doc| id.is_some() && document_id(doc) == id)
    {
        Some(slot) => *slot = document,
        None => docs.push(document),
    }
}

fn journal_io(err: io::Error) -> StoreError {
    StoreError::Journal(err.to_string())
}

pub struct Journal {
    dir: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl Journal {
    /// Recovers the database kept in `dir` and opens its journal for appends.
    pub async fn open(dir: PathBuf) -> Result<(Self, Collections)> {
        let recovery_dir = dir.clone();
        let collections = tokio::task::spawn_blocking(move || recover(&recovery_dir)).await??;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(JOURNAL_FILE))
            .await
            .map_err(journal_io)?;

        Ok((
            Self {
                dir,
                file: Mutex::new(file),
            },
            collections,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durable once this returns.
    pub async fn append(&self, entry: &JournalEntry) -> Result<()> {
        let frame = encode_frame(entry)?;
        let mut file = self.file.lock().await;
        file.write_all(&frame).await.map_err(journal_io)?;
        file.flush().await.map_err(journal_io)?;
        file.sync_data().await.map_err(journal_io)?;
        Ok(())
    }
}

fn encode_frame(entry: &JournalEntry) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(entry)
        .map_err(|e| StoreError::Journal(format!("failed to encode entry: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Journal("entry exceeds 4 GiB".to_string()))?;

    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Snapshot plus journal; a non-empty journal is folded into a new snapshot.
fn recover(dir: &Path) -> Result<Collections> {
    fs::create_dir_all(dir).map_err(journal_io)?;

    let mut collections = load_snapshot(&dir.join(SNAPSHOT_FILE))?.unwrap_or_default();
    let entries = read_entries(&dir.join(JOURNAL_FILE))?;
    let replayed = entries.len();
    for entry in entries {
        entry.apply(&mut collections);
    }

    if replayed > 0 {
        save_snapshot(dir, &collections)?;
        File::create(dir.join(JOURNAL_FILE)).map_err(journal_io)?;
        info!(dir = %dir.display(), replayed, "journal compacted into snapshot");
    }
    Ok(collections)
}

fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(journal_io(e)),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();

    loop {
        let mut len = [0u8; 4];
        match reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(journal_io(e)),
        }

        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(
                    path = %path.display(),
                    recovered = entries.len(),
                    "journal ends in a partial frame; dropping it"
                );
                break;
            }
            Err(e) => return Err(journal_io(e)),
        }

        let entry = rmp_serde::from_slice(&payload).map_err(|e| {
            StoreError::Journal(format!("entry {} is undecodable: {e}", entries.len()))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn load_snapshot(path: &Path) -> Result<Option<Collections>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(journal_io(e)),
    };
    rmp_serde::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Journal(format!("snapshot is undecodable: {e}")))
}

fn save_snapshot(dir: &Path, collections: &Collections) -> Result<()> {
    let bytes = rmp_serde::to_vec_named(collections)
        .map_err(|e| StoreError::Journal(format!("failed to encode snapshot: {e}")))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(journal_io)?;
    tmp.write_all(&bytes).map_err(journal_io)?;
    tmp.as_file().sync_all().map_err(journal_io)?;
    tmp.persist(dir.join(SNAPSHOT_FILE))
        .map_err(|e| journal_io(e.error))?;
    Ok(())
}
