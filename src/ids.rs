//! Sequential, human-readable record ids (`GKF00007`, `ENQ003`, `FEE12`).
//!
//! Allocation scans the ids already stored and continues after the highest
//! one. It holds no state of its own, so two callers scanning the same
//! collection concurrently compute the same id; the storage layer has to
//! catch that (collection lock or unique insert).

use crate::core::{EntityKind, IdFormat};

/// Numeric suffix of `id` when it is exactly `prefix` followed by digits.
pub fn sequence_of(format: &IdFormat, id: &str) -> Option<u64> {
    let digits = id.strip_prefix(format.prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Highest sequence number among ids of this format, 0 when there are none.
pub fn max_sequence<'a, I>(format: &IdFormat, existing: I) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    existing
        .into_iter()
        .filter_map(|id| sequence_of(format, id))
        .max()
        .unwrap_or(0)
}

/// Next free id for `kind`. Gaps left by deletions are never refilled.
pub fn next_id<'a, I>(kind: EntityKind, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let format = kind.id_format();
    format.format(max_sequence(&format, existing).saturating_add(1))
}
