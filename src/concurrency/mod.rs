//! Optimistic concurrency: version checks and mutation outcomes.

pub mod guard;
pub mod outcome;

pub use guard::{Conflict, ConflictReason, check_version};
pub use outcome::{Applied, MutationOutcome};
