use thiserror::Error;

/// Failures talking to a storage technology.
///
/// Conflicts, missing records and invalid payloads are not errors at this
/// level; they travel as [`crate::concurrency::MutationOutcome`] variants.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on collection '{collection}': {source}")]
    Io {
        collection: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error on collection '{collection}': {source}")]
    Serialization {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Collection '{0}' is corrupt: {1}")]
    Corrupt(String, String),

    #[error("Duplicate id '{1}' in collection '{0}'")]
    DuplicateId(String, String),

    #[error("Could not allocate a free id in '{0}' after {1} attempts")]
    IdExhausted(String, usize),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn io(collection: &str, source: std::io::Error) -> Self {
        Self::Io {
            collection: collection.to_string(),
            source,
        }
    }

    pub fn serialization(collection: &str, source: serde_json::Error) -> Self {
        Self::Serialization {
            collection: collection.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
