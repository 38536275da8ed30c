// ============================================================================
// BrokerCRM Library
// ============================================================================

pub mod concurrency;
pub mod config;
pub mod core;
pub mod ids;
pub mod model;
pub mod repository;
pub mod storage;
pub mod web;

// Re-export main types for convenience
pub use concurrency::{Applied, Conflict, ConflictReason, MutationOutcome};
pub use crate::core::{Clock, Document, EntityKind, Result, StoreError, SystemClock};
pub use model::{Actor, AuditMeta, EntityFields, Record};
pub use repository::{Listing, Store, VersionedRepository, WriteContext};
pub use storage::{DocumentBackend, FileBackend, RecordBackend};
pub use web::{AppState, build_router};
