use crate::core::EntityKind;
use crate::model::{EntityFields, Record};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Why a write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictReason {
    /// Client named a version other than the stored one.
    StaleVersion,
    /// Client named no version but the stored record is versioned.
    MissingVersion,
    /// The collection file changed since the client read it.
    FileModified,
    /// The pre-check passed but the conditional write matched nothing.
    ConcurrentWrite,
}

/// A refused write together with the server state the client lost to.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict<T> {
    pub entity: EntityKind,
    pub reason: ConflictReason,
    pub message: String,
    pub client_version: Option<u64>,
    pub server_version: Option<u64>,
    pub modified_by: Option<String>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub client_file_timestamp: Option<DateTime<Utc>>,
    pub server_file_timestamp: Option<DateTime<Utc>>,
    /// Current record, `None` when it vanished between check and write.
    pub server_data: Option<Record<T>>,
}

impl<T: EntityFields> Conflict<T> {
    fn against(
        reason: ConflictReason,
        message: String,
        client_version: Option<u64>,
        current: Option<&Record<T>>,
    ) -> Self {
        Self {
            entity: T::KIND,
            reason,
            message,
            client_version,
            server_version: current.map(Record::version),
            modified_by: current.and_then(|r| r.audit.modified_by.clone()),
            last_modified_at: current.and_then(|r| r.audit.last_modified_at),
            client_file_timestamp: None,
            server_file_timestamp: None,
            server_data: current.cloned(),
        }
    }

    pub fn stale_version(current: &Record<T>, client_version: Option<u64>) -> Self {
        let reason = if client_version.is_some() {
            ConflictReason::StaleVersion
        } else {
            ConflictReason::MissingVersion
        };
        Self::against(
            reason,
            format!(
                "{} {} has been modified by another user",
                T::KIND.label(),
                current.id
            ),
            client_version,
            Some(current),
        )
    }

    pub fn file_modified(
        current: &Record<T>,
        client_version: Option<u64>,
        expected: DateTime<Utc>,
        actual: Option<DateTime<Utc>>,
    ) -> Self {
        let mut conflict = Self::against(
            ConflictReason::FileModified,
            format!(
                "{} data has been modified by another user since it was loaded",
                T::KIND.label()
            ),
            client_version,
            Some(current),
        );
        conflict.client_file_timestamp = Some(expected);
        conflict.server_file_timestamp = actual;
        conflict
    }

    pub fn concurrent_write(
        id: &str,
        current: Option<&Record<T>>,
        client_version: Option<u64>,
    ) -> Self {
        Self::against(
            ConflictReason::ConcurrentWrite,
            format!(
                "{} {id} was modified by another user while saving",
                T::KIND.label()
            ),
            client_version,
            current,
        )
    }
}

impl<T> fmt::Display for Conflict<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Compares the version a client read against the stored one.
///
/// Unversioned records accept writes that name no version; everything else
/// must name the stored version exactly.
pub fn check_version<T: EntityFields>(
    stored: &Record<T>,
    client_version: Option<u64>,
) -> Result<(), Box<Conflict<T>>> {
    match client_version {
        None if !stored.audit.is_versioned() => Ok(()),
        Some(version) if version == stored.version() => Ok(()),
        _ => Err(Box::new(Conflict::stale_version(stored, client_version))),
    }
}
