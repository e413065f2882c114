//! Pure reconciliation of a store snapshot with the optimistic ledger.
//!
//! [`reconcile`] is a function of its inputs only: replaying the same
//! snapshot, or delivering snapshots out of order, can never produce a board
//! that the final (snapshot, ledger) pair would not produce on its own.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use boardsync_proto::task::fields;
use boardsync_proto::{CanonicalStatus, OwnerId, RawTask, Revision, Task, TaskId};

use super::{Board, BoardEntry, OptimisticPlacement};
use crate::ledger::{IssueContext, MutationId, MutationKind, PendingMutation};
use crate::{ordering, status};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The derived board.
    pub board: Board,
    /// In-flight mutations the snapshot already reflects. The caller settles
    /// them; they were not applied to `board`.
    pub caught_up: Vec<MutationId>,
    /// Revision and normalized status of every accepted snapshot task.
    pub remote: BTreeMap<TaskId, IssueContext>,
}

/// Derives the board from `snapshot` and the ledger entries in `pending`.
///
/// Only in-flight entries are considered; terminal ones are ignored.
#[must_use]
pub fn reconcile(
    snapshot: &[RawTask],
    pending: &[PendingMutation],
    owner: &OwnerId,
    placement: OptimisticPlacement,
) -> Reconciliation {
    let tasks = decode_snapshot(snapshot, owner);
    let remote: BTreeMap<TaskId, IssueContext> = tasks
        .iter()
        .map(|(id, task)| {
            (
                id.clone(),
                IssueContext {
                    base_revision: task.revision,
                    remote_status: Some(status::normalize(&task.status)),
                },
            )
        })
        .collect();

    let mut in_flight: Vec<&PendingMutation> = pending.iter().filter(|m| m.is_in_flight()).collect();
    in_flight.sort_by_key(|m| m.sequence);

    let mut caught_up = Vec::new();
    let mut active: Vec<&PendingMutation> = Vec::with_capacity(in_flight.len());
    for mutation in in_flight {
        let task = tasks.get(&mutation.task_id);
        let remote_status = remote
            .get(&mutation.task_id)
            .and_then(|ctx| ctx.remote_status);
        // An edit shadowed by an earlier active edit of the same field keeps
        // overlaying until that one resolves, so the later value stays on top.
        let shadowed = match &mutation.kind {
            MutationKind::Edit { fields: update } => active.iter().any(|earlier| {
                earlier.task_id == mutation.task_id
                    && matches!(&earlier.kind, MutationKind::Edit { fields: prior }
                        if prior.keys().any(|field| update.contains_key(field)))
            }),
            _ => false,
        };
        if !shadowed && is_caught_up(mutation, task, remote_status) {
            tracing::debug!(
                task_id = %mutation.task_id,
                mutation = %mutation.id,
                kind = mutation.kind.label(),
                "snapshot caught up with local mutation"
            );
            caught_up.push(mutation.id);
        } else {
            active.push(mutation);
        }
    }

    let mut buckets: [Vec<(BoardEntry, bool)>; 3] = Default::default();
    for (id, mut task) in tasks {
        let overlays: Vec<&PendingMutation> = active
            .iter()
            .copied()
            .filter(|m| m.task_id == id)
            .collect();
        if overlays.iter().any(|m| m.kind == MutationKind::Delete) {
            continue;
        }

        let mut moved_to = None;
        let mut status_edited = false;
        for mutation in &overlays {
            match &mutation.kind {
                MutationKind::Move { to } => moved_to = Some(*to),
                MutationKind::Edit { fields: update } => {
                    status_edited |= update.contains_key(fields::STATUS);
                    task.apply_fields(update);
                }
                MutationKind::Delete => {}
            }
        }

        let effective = match (moved_to, status_edited) {
            (Some(to), _) => to,
            (None, true) => status::normalize(&task.status),
            (None, false) => remote
                .get(&id)
                .and_then(|ctx| ctx.remote_status)
                .unwrap_or(CanonicalStatus::Todo),
        };
        buckets[effective.column_index()].push((
            BoardEntry {
                task,
                status: effective,
                optimistic: !overlays.is_empty(),
            },
            moved_to.is_some(),
        ));
    }

    let mut board = Board::default();
    for status in CanonicalStatus::ALL {
        let mut bucket = std::mem::take(&mut buckets[status.column_index()]);
        match placement {
            OptimisticPlacement::Sorted => ordering::sort_column(&mut bucket, |(e, _)| &e.task),
            OptimisticPlacement::Front => bucket.sort_by(|(a, a_moved), (b, b_moved)| {
                b_moved
                    .cmp(a_moved)
                    .then_with(|| ordering::compare(&a.task, &b.task))
            }),
        }
        *board.column_mut(status) = bucket.into_iter().map(|(entry, _)| entry).collect();
    }

    Reconciliation {
        board,
        caught_up,
        remote,
    }
}

/// Decodes a snapshot, dropping records that cannot be trusted.
///
/// Duplicate ids keep the highest revision; the first copy wins a tie.
fn decode_snapshot(snapshot: &[RawTask], owner: &OwnerId) -> BTreeMap<TaskId, Task> {
    let mut tasks: BTreeMap<TaskId, Task> = BTreeMap::new();
    for raw in snapshot {
        let task = match Task::decode(raw) {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable task record");
                continue;
            }
        };
        if task.owner_id != *owner {
            tracing::warn!(
                task_id = %task.id,
                owner = %task.owner_id,
                expected = %owner,
                "dropping task owned by another identity"
            );
            continue;
        }
        match tasks.entry(task.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
            Entry::Occupied(mut slot) => {
                tracing::warn!(
                    task_id = %task.id,
                    kept = ?slot.get().revision.max(task.revision),
                    "duplicate task id in snapshot"
                );
                if task.revision > slot.get().revision {
                    slot.insert(task);
                }
            }
        }
    }
    tasks
}

fn is_caught_up(
    mutation: &PendingMutation,
    task: Option<&Task>,
    remote_status: Option<CanonicalStatus>,
) -> bool {
    let Some(task) = task else {
        return mutation.kind == MutationKind::Delete;
    };
    if let (Some(acked), Some(current)) = (mutation.acknowledged, task.revision)
        && current >= acked
    {
        return true;
    }
    match &mutation.kind {
        MutationKind::Move { to } => {
            remote_status == Some(*to)
                && (mutation.remote_status_at_issue != Some(*to)
                    || revision_advanced(mutation.base_revision, task.revision))
        }
        MutationKind::Edit { fields: update } => task.reflects(update),
        MutationKind::Delete => false,
    }
}

/// `true` if `current` is past `base`, or if either is unknown.
fn revision_advanced(base: Option<Revision>, current: Option<Revision>) -> bool {
    match (base, current) {
        (Some(base), Some(current)) => current > base,
        _ => true,
    }
}
