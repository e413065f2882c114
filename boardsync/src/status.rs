//! Mapping of historical status spellings onto [`CanonicalStatus`].
//!
//! This is the only place raw status strings are compared. The mapping is an
//! explicit lookup table: a spelling is either listed or it is an anomaly.
//! No substring matching: `"not-done"` must never land in the done column.

use boardsync_proto::CanonicalStatus;

/// Every accepted spelling, already lowercased and trimmed.
///
/// `yapilacak`/`tamamlandi` are the ASCII forms produced when the Turkish
/// dotted/dotless `I` goes through Unicode lowercasing (`"YAPILACAK"`
/// lowercases to `yapilacak`, not `yapılacak`).
const STATUS_TABLE: &[(&str, CanonicalStatus)] = &[
    ("todo", CanonicalStatus::Todo),
    ("to-do", CanonicalStatus::Todo),
    ("to_do", CanonicalStatus::Todo),
    ("to do", CanonicalStatus::Todo),
    ("open", CanonicalStatus::Todo),
    ("backlog", CanonicalStatus::Todo),
    ("yapılacak", CanonicalStatus::Todo),
    ("yapilacak", CanonicalStatus::Todo),
    ("in-progress", CanonicalStatus::InProgress),
    ("in_progress", CanonicalStatus::InProgress),
    ("inprogress", CanonicalStatus::InProgress),
    ("in progress", CanonicalStatus::InProgress),
    ("doing", CanonicalStatus::InProgress),
    ("devam ediyor", CanonicalStatus::InProgress),
    ("done", CanonicalStatus::Done),
    ("completed", CanonicalStatus::Done),
    ("complete", CanonicalStatus::Done),
    ("tamamlandı", CanonicalStatus::Done),
    ("tamamlandi", CanonicalStatus::Done),
];

/// Looks a raw status up in the table without defaulting.
///
/// Returns `None` for spellings the table does not list.
#[must_use]
pub fn classify(raw: &str) -> Option<CanonicalStatus> {
    let key = raw.trim().to_lowercase();
    STATUS_TABLE
        .iter()
        .find(|(spelling, _)| *spelling == key)
        .map(|(_, status)| *status)
}

/// Normalizes any raw status to a canonical one. Total: never fails.
///
/// Unrecognized input maps to [`CanonicalStatus::Todo`] and is logged as a
/// normalization anomaly.
#[must_use]
pub fn normalize(raw: &str) -> CanonicalStatus {
    classify(raw).unwrap_or_else(|| {
        tracing::warn!(raw_status = raw, "unrecognized task status, treating as todo");
        CanonicalStatus::Todo
    })
}
