//! Versioned read-modify-write over any [`RecordBackend`].
//!
//! Every mutation re-reads the stored record, checks the caller's version
//! (and collection timestamp, for file collections), stamps the new
//! version from the stored one and writes conditionally on that stored
//! version. A conditional write that matches nothing after a passing check
//! lost a race and is reported as a conflict.
//!
//! Client input is sanitized on the blocking pool before any write section
//! is entered. Entities with a unique field are checked against the stored
//! collection inside the write section.

use crate::concurrency::{Applied, Conflict, MutationOutcome, check_version};
use crate::core::{Clock, Document, Result, StoreError};
use crate::ids::next_id;
use crate::model::{
    Actor, EntityFields, Record, actor_name, apply_patch, fields_from_input, sanitize_input,
};
use crate::storage::{BackendKind, InsertOutcome, RecordBackend, TimestampCheck, document_id};
use chrono::{DateTime, Utc};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const DEFAULT_ID_RETRY_LIMIT: usize = 5;

/// What the caller believes about the state it is overwriting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteContext {
    pub client_version: Option<u64>,
    /// Collection timestamp captured when the caller last read (file collections).
    pub file_timestamp: Option<DateTime<Utc>>,
}

impl WriteContext {
    pub fn at_version(version: u64) -> Self {
        Self {
            client_version: Some(version),
            file_timestamp: None,
        }
    }

    pub fn with_file_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.file_timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub records: Vec<Record<T>>,
    pub file_timestamp: Option<DateTime<Utc>>,
}

pub struct VersionedRepository<T> {
    backend: Arc<dyn RecordBackend>,
    clock: Arc<dyn Clock>,
    id_retry_limit: usize,
    unique_writes: Arc<Mutex<()>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for VersionedRepository<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            clock: Arc::clone(&self.clock),
            id_retry_limit: self.id_retry_limit,
            unique_writes: Arc::clone(&self.unique_writes),
            _entity: PhantomData,
        }
    }
}

impl<T: EntityFields> VersionedRepository<T> {
    pub fn new(backend: Arc<dyn RecordBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            id_retry_limit: DEFAULT_ID_RETRY_LIMIT,
            unique_writes: Arc::new(Mutex::new(())),
            _entity: PhantomData,
        }
    }

    fn sharing_unique_writes(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.unique_writes = lock;
        self
    }

    pub fn with_id_retry_limit(mut self, limit: usize) -> Self {
        self.id_retry_limit = limit.max(1);
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn collection(&self) -> &'static str {
        T::KIND.collection()
    }

    fn not_found(id: &str) -> MutationOutcome<T> {
        MutationOutcome::NotFound(format!("{} {id} not found", T::KIND.label()))
    }

    fn decode(&self, document: Document) -> Result<Record<T>> {
        let id = document_id(&document).unwrap_or("<no id>").to_string();
        Record::from_document(document).map_err(|err| {
            StoreError::Corrupt(self.collection().to_string(), format!("record {id}: {err}"))
        })
    }

    fn encode(&self, record: &Record<T>) -> Result<Document> {
        record
            .to_document()
            .map_err(|err| StoreError::serialization(self.collection(), err))
    }

    async fn load(&self, id: &str) -> Result<Option<Record<T>>> {
        self.backend
            .fetch(self.collection(), id)
            .await?
            .map(|doc| self.decode(doc))
            .transpose()
    }

    /// Current collection timestamp, `None` for stores that do not track one.
    pub async fn file_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(
            match self
                .backend
                .check_file_timestamp(self.collection(), None)
                .await?
            {
                TimestampCheck::Current(ts) => ts,
                TimestampCheck::Modified { actual, .. } => actual,
            },
        )
    }

    pub async fn get(&self, id: &str) -> Result<Option<Record<T>>> {
        self.load(id).await
    }

    /// All records, optionally only those hanging off `owner`.
    pub async fn list(&self, owner: Option<&str>) -> Result<Listing<T>> {
        // Timestamp first: a write landing in between makes the client's
        // next write conflict rather than slip through.
        let file_timestamp = self.file_timestamp().await?;
        let records = self
            .backend
            .fetch_all(self.collection())
            .await?
            .into_iter()
            .map(|doc| self.decode(doc))
            .filter(|record| match (owner, record) {
                (Some(owner), Ok(record)) => record.fields.owner_ref() == Some(owner),
                _ => true,
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Listing {
            records,
            file_timestamp,
        })
    }

    pub async fn create(
        &self,
        input: Document,
        actor: Option<&Actor>,
    ) -> Result<MutationOutcome<T>> {
        let mut fields = match Self::sanitize(input).await?.and_then(fields_from_input::<T>) {
            Ok(fields) => fields,
            Err(reason) => return Ok(MutationOutcome::Invalid(reason)),
        };
        let actor = actor_name(actor);
        fields.attribute_creation(&actor);
        let collection = self.collection();
        let _unique = self.lock_unique_writes().await;

        for attempt in 1..=self.id_retry_limit {
            let _guard = self.backend.serialize_writes(collection).await;

            let existing = self.backend.fetch_all(collection).await?;
            if let Some(reason) = self.unique_violation(&fields, None, &existing)? {
                return Ok(MutationOutcome::Invalid(reason));
            }
            let id = next_id(T::KIND, existing.iter().filter_map(document_id));
            let mut record = Record::new(id, fields.clone());
            record.audit.stamp_for_create(&actor, self.clock.now());

            match self.backend.insert(collection, self.encode(&record)?).await? {
                InsertOutcome::Inserted(receipt) => {
                    info!(collection, id = %record.id, actor = %actor, "record created");
                    return Ok(MutationOutcome::Applied(Applied {
                        record,
                        file_timestamp: receipt.file_timestamp,
                    }));
                }
                InsertOutcome::DuplicateId => {
                    warn!(collection, id = %record.id, attempt, "id already taken, reallocating");
                }
            }
        }

        Err(StoreError::IdExhausted(
            collection.to_string(),
            self.id_retry_limit,
        ))
    }

    pub async fn update(
        &self,
        id: &str,
        patch: Document,
        context: &WriteContext,
        actor: Option<&Actor>,
    ) -> Result<MutationOutcome<T>> {
        let patch = match Self::sanitize(patch).await? {
            Ok(patch) => patch,
            Err(reason) => return Ok(MutationOutcome::Invalid(reason)),
        };
        let collection = self.collection();
        let _unique = self.lock_unique_writes().await;
        let _guard = self.backend.serialize_writes(collection).await;

        let Some(current) = self.load(id).await? else {
            return Ok(Self::not_found(id));
        };
        if let Some(conflict) = self.precondition_conflict(&current, context).await? {
            return Ok(conflict.into());
        }

        let fields = match apply_patch(&current.fields, patch) {
            Ok(fields) => fields,
            Err(reason) => return Ok(MutationOutcome::Invalid(reason)),
        };
        if T::UNIQUE_FIELD.is_some() {
            let existing = self.backend.fetch_all(collection).await?;
            if let Some(reason) = self.unique_violation(&fields, Some(id), &existing)? {
                return Ok(MutationOutcome::Invalid(reason));
            }
        }
        let actor = actor_name(actor);
        let stored_version = current.version();
        let mut next = Record {
            id: current.id.clone(),
            audit: current.audit.clone(),
            fields,
        };
        next.audit.stamp_for_update(&actor, self.clock.now());

        let written = self
            .backend
            .replace_if_version(collection, id, stored_version, self.encode(&next)?)
            .await?;
        match written {
            Some(receipt) => {
                info!(collection, id, version = next.version(), actor = %actor, "record updated");
                Ok(MutationOutcome::Applied(Applied {
                    record: next,
                    file_timestamp: receipt.file_timestamp,
                }))
            }
            None => self.lost_race(id, context).await,
        }
    }

    pub async fn delete(
        &self,
        id: &str,
        context: &WriteContext,
        actor: Option<&Actor>,
    ) -> Result<MutationOutcome<T>> {
        let collection = self.collection();
        let _guard = self.backend.serialize_writes(collection).await;

        let Some(current) = self.load(id).await? else {
            return Ok(Self::not_found(id));
        };
        if let Some(conflict) = self.precondition_conflict(&current, context).await? {
            return Ok(conflict.into());
        }

        let written = self
            .backend
            .delete_if_version(collection, id, current.version())
            .await?;
        match written {
            Some(receipt) => {
                info!(
                    collection,
                    id,
                    version = current.version(),
                    actor = %actor_name(actor),
                    "record deleted"
                );
                Ok(MutationOutcome::Applied(Applied {
                    record: current,
                    file_timestamp: receipt.file_timestamp,
                }))
            }
            None => self.lost_race(id, context).await,
        }
    }

    async fn sanitize(input: Document) -> Result<std::result::Result<Document, String>> {
        Ok(tokio::task::spawn_blocking(move || sanitize_input::<T>(input)).await?)
    }

    /// Serializes writers of entities with a unique field; others skip it.
    async fn lock_unique_writes(&self) -> Option<MutexGuard<'_, ()>> {
        match T::UNIQUE_FIELD {
            Some(_) => Some(self.unique_writes.lock().await),
            None => None,
        }
    }

    /// Message naming the clash when another stored record holds the same key.
    fn unique_violation(
        &self,
        fields: &T,
        own_id: Option<&str>,
        existing: &[Document],
    ) -> Result<Option<String>> {
        let (Some(field), Some(key)) = (T::UNIQUE_FIELD, fields.unique_key()) else {
            return Ok(None);
        };
        for document in existing {
            if own_id.is_some() && document_id(document) == own_id {
                continue;
            }
            let other = self.decode(document.clone())?;
            if other.fields.unique_key().as_deref() == Some(key.as_str()) {
                warn!(collection = self.collection(), field, key = %key, holder = %other.id, "unique field taken");
                return Ok(Some(format!(
                    "{} {field} {key} is already in use",
                    T::KIND.label()
                )));
            }
        }
        Ok(None)
    }

    /// File timestamp first (coarse), then the record version (fine).
    async fn precondition_conflict(
        &self,
        current: &Record<T>,
        context: &WriteContext,
    ) -> Result<Option<Box<Conflict<T>>>> {
        let check = self
            .backend
            .check_file_timestamp(self.collection(), context.file_timestamp)
            .await?;
        if let TimestampCheck::Modified { expected, actual } = check {
            warn!(
                collection = self.collection(),
                id = %current.id,
                expected = %expected,
                actual = ?actual,
                "collection changed since client read it"
            );
            return Ok(Some(Box::new(Conflict::file_modified(
                current,
                context.client_version,
                expected,
                actual,
            ))));
        }

        match check_version(current, context.client_version) {
            Ok(()) => Ok(None),
            Err(conflict) => {
                warn!(
                    collection = self.collection(),
                    id = %current.id,
                    client_version = ?context.client_version,
                    server_version = current.version(),
                    "version conflict"
                );
                Ok(Some(conflict))
            }
        }
    }

    async fn lost_race(&self, id: &str, context: &WriteContext) -> Result<MutationOutcome<T>> {
        let latest = self.load(id).await?;
        warn!(
            collection = self.collection(),
            id,
            still_present = latest.is_some(),
            "conditional write matched nothing"
        );
        debug!(collection = self.collection(), id, "reporting lost race as conflict");
        Ok(MutationOutcome::Conflict(Box::new(Conflict::concurrent_write(
            id,
            latest.as_ref(),
            context.client_version,
        ))))
    }
}

/// Shared handles every typed repository is built from.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn RecordBackend>,
    clock: Arc<dyn Clock>,
    id_retry_limit: usize,
    unique_writes: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(backend: Arc<dyn RecordBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            id_retry_limit: DEFAULT_ID_RETRY_LIMIT,
            unique_writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_id_retry_limit(mut self, limit: usize) -> Self {
        self.id_retry_limit = limit.max(1);
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn repository<T: EntityFields>(&self) -> VersionedRepository<T> {
        VersionedRepository::new(Arc::clone(&self.backend), Arc::clone(&self.clock))
            .with_id_retry_limit(self.id_retry_limit)
            .sharing_unique_writes(Arc::clone(&self.unique_writes))
    }
}
