//! Deterministic ordering of tasks within a column.
//!
//! Most recently created first. The sort key is derived only from the task
//! itself (`createdAt`, then `id`), never from the current time, so sorting
//! the same inputs twice always produces the same order.

use std::cmp::Ordering;

use boardsync_proto::Task;
use chrono::{DateTime, Utc};

/// The instant a task sorts by, if any.
///
/// Resolution order: native timestamp, parseable ISO string, otherwise
/// `None` (treated as older than every real instant).
#[must_use]
pub fn sort_instant(task: &Task) -> Option<DateTime<Utc>> {
    task.created_at.resolve()
}

/// Compares two tasks for display order within a column.
///
/// Descending by creation instant, absent instants last, ties broken by
/// ascending id. `Equal` only when both ids are equal.
#[must_use]
pub fn compare(a: &Task, b: &Task) -> Ordering {
    // `None < Some(_)`, so reversing the Option order puts absent instants last.
    sort_instant(b)
        .cmp(&sort_instant(a))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sorts a column in place using [`compare`].
pub fn sort_column<T>(column: &mut [T], task_of: impl Fn(&T) -> &Task) {
    column.sort_by(|a, b| compare(task_of(a), task_of(b)));
}
