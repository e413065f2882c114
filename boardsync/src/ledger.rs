//! Ledger of in-flight local mutations.
//!
//! The ledger records *intent* only (`task X should be in column Y`, `task X
//! should have these fields`, `task X should be gone`), never board
//! positions. Ordering is recomputed from scratch by reconciliation on every
//! pass.
//!
//! Lifecycle of an entry:
//!
//! ```text
//! InFlight ──settle / catch-up──▶ Settled
//!    │ ├────rollback────────────▶ Failed
//!    │ └────newer move, same task▶ Superseded (settled without effect)
//!    └─acknowledge(rev)─▶ InFlight (waiting for a snapshot at rev) ─▶ Settled
//! ```
//!
//! Terminal entries stay until they have been rendered once, then
//! [`OptimisticLedger::collect_garbage`] drops them.

use boardsync_proto::{CanonicalStatus, FieldMap, Revision, TaskId};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Unique identifier for a pending mutation, based on UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Creates a new time-ordered mutation identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned to the issuer of a mutation, used to settle or roll it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationHandle {
    id: MutationId,
    task_id: TaskId,
}

impl MutationHandle {
    /// The mutation this handle refers to.
    #[must_use]
    pub const fn id(&self) -> MutationId {
        self.id
    }

    /// The task the mutation targets.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

/// What a pending mutation intends to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    /// Put the task in another column.
    Move {
        /// Intended canonical status.
        to: CanonicalStatus,
    },
    /// Change payload fields.
    Edit {
        /// Fields being written, by document name.
        fields: FieldMap,
    },
    /// Remove the task.
    Delete,
}

impl MutationKind {
    /// Short label for logs and error reports.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Edit { .. } => "edit",
            Self::Delete => "delete",
        }
    }
}

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Issued, still overriding incoming snapshots.
    InFlight,
    /// Caught up by a snapshot or confirmed by the store.
    Settled,
    /// Replaced by a newer move for the same task before resolving.
    Superseded,
    /// The write was rejected and the mutation rolled back.
    Failed,
}

impl MutationState {
    /// Returns `true` for every state except [`InFlight`](Self::InFlight).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

/// What the board looked like for the task when the mutation was issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueContext {
    /// Revision of the task in the latest snapshot, if known.
    pub base_revision: Option<Revision>,
    /// Normalized status of the task in the latest snapshot, if present.
    pub remote_status: Option<CanonicalStatus>,
}

/// A ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    /// Unique mutation id.
    pub id: MutationId,
    /// Target task.
    pub task_id: TaskId,
    /// Intent.
    pub kind: MutationKind,
    /// Snapshot revision of the task when issued.
    pub base_revision: Option<Revision>,
    /// Snapshot status of the task when issued.
    pub remote_status_at_issue: Option<CanonicalStatus>,
    /// Wall-clock issue time. Informational; never used for ordering.
    pub submitted_at: DateTime<Utc>,
    /// Position in issue order, used to apply overlays deterministically.
    pub sequence: u64,
    /// Revision the store reported for this write, once acknowledged.
    pub acknowledged: Option<Revision>,
    /// Lifecycle state.
    pub state: MutationState,
    rendered: bool,
}

impl PendingMutation {
    /// The status a move intends, or `None` for other kinds.
    #[must_use]
    pub const fn applied_status(&self) -> Option<CanonicalStatus> {
        match self.kind {
            MutationKind::Move { to } => Some(to),
            _ => None,
        }
    }

    /// Returns `true` while the mutation still overrides snapshots.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.state == MutationState::InFlight
    }
}

/// Tracks in-flight local mutations keyed by task id.
#[derive(Debug, Default)]
pub struct OptimisticLedger {
    /// Entries in issue order.
    entries: Vec<PendingMutation>,
    next_sequence: u64,
}

impl OptimisticLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a move of `task_id` to `to`.
    ///
    /// Any move for the same task that is still in flight is superseded: its
    /// eventual outcome is discarded, so a slow first request can never
    /// clobber a faster second one.
    pub fn apply_move(
        &mut self,
        task_id: &TaskId,
        to: CanonicalStatus,
        context: IssueContext,
    ) -> MutationHandle {
        for entry in self.entries.iter_mut().filter(|e| {
            e.task_id == *task_id && e.is_in_flight() && e.applied_status().is_some()
        }) {
            tracing::debug!(
                task_id = %task_id,
                mutation = %entry.id,
                "superseding in-flight move"
            );
            entry.state = MutationState::Superseded;
        }
        self.push(task_id, MutationKind::Move { to }, context)
    }

    /// Records a field edit. Edits to the same task overlay in issue order.
    pub fn apply_edit(
        &mut self,
        task_id: &TaskId,
        fields: FieldMap,
        context: IssueContext,
    ) -> MutationHandle {
        self.push(task_id, MutationKind::Edit { fields }, context)
    }

    /// Records a delete. The task is hidden while the delete is in flight.
    pub fn apply_delete(&mut self, task_id: &TaskId, context: IssueContext) -> MutationHandle {
        self.push(task_id, MutationKind::Delete, context)
    }

    /// Marks a mutation settled.
    ///
    /// Returns `false` (and changes nothing) if the handle is unknown or the
    /// mutation already reached a terminal state, including being superseded.
    pub fn settle(&mut self, handle: &MutationHandle) -> bool {
        self.transition(handle, MutationState::Settled)
    }

    /// Marks a mutation failed, removing its override.
    ///
    /// Returns `false` if the handle is unknown or already terminal.
    pub fn rollback(&mut self, handle: &MutationHandle) -> bool {
        self.transition(handle, MutationState::Failed)
    }

    /// Records that the store accepted the write at `revision`.
    ///
    /// With no revision (deletes) the mutation settles immediately. Otherwise
    /// it keeps overriding until a snapshot at `revision` or later arrives.
    /// Returns `false` if the handle is unknown or already terminal.
    pub fn acknowledge(&mut self, handle: &MutationHandle, revision: Option<Revision>) -> bool {
        let Some(entry) = self.find_mut(handle) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        match revision {
            None => entry.state = MutationState::Settled,
            Some(rev) => entry.acknowledged = Some(entry.acknowledged.map_or(rev, |a| a.max(rev))),
        }
        true
    }

    /// Settles a mutation by id. Used by reconciliation catch-up.
    pub fn settle_id(&mut self, id: MutationId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.id == id && e.is_in_flight())
        {
            Some(entry) => {
                entry.state = MutationState::Settled;
                true
            }
            None => false,
        }
    }

    /// Current state of a mutation, or `None` once garbage-collected.
    #[must_use]
    pub fn state(&self, handle: &MutationHandle) -> Option<MutationState> {
        self.entries
            .iter()
            .find(|e| e.id == handle.id)
            .map(|e| e.state)
    }

    /// Read-only copy of every retained entry, in issue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingMutation> {
        self.entries.clone()
    }

    /// The in-flight move for a task, if any.
    #[must_use]
    pub fn in_flight_move(&self, task_id: &TaskId) -> Option<&PendingMutation> {
        self.entries
            .iter()
            .find(|e| e.task_id == *task_id && e.is_in_flight() && e.applied_status().is_some())
    }

    /// Number of entries still in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_in_flight()).count()
    }

    /// Number of retained entries, terminal ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flags every terminal entry as rendered. Call after publishing a board.
    pub fn mark_rendered(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| e.state.is_terminal()) {
            entry.rendered = true;
        }
    }

    /// Drops terminal entries that have been rendered at least once.
    ///
    /// Returns the number of entries removed.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.state.is_terminal() && e.rendered));
        before - self.entries.len()
    }

    /// Drops every entry without settling or rolling back. Used on teardown.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    fn push(
        &mut self,
        task_id: &TaskId,
        kind: MutationKind,
        context: IssueContext,
    ) -> MutationHandle {
        let id = MutationId::new();
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        tracing::debug!(task_id = %task_id, mutation = %id, kind = kind.label(), "mutation issued");
        self.entries.push(PendingMutation {
            id,
            task_id: task_id.clone(),
            kind,
            base_revision: context.base_revision,
            remote_status_at_issue: context.remote_status,
            submitted_at: Utc::now(),
            sequence,
            acknowledged: None,
            state: MutationState::InFlight,
            rendered: false,
        });
        MutationHandle {
            id,
            task_id: task_id.clone(),
        }
    }

    fn find_mut(&mut self, handle: &MutationHandle) -> Option<&mut PendingMutation> {
        self.entries.iter_mut().find(|e| e.id == handle.id)
    }

    fn transition(&mut self, handle: &MutationHandle, to: MutationState) -> bool {
        match self.find_mut(handle) {
            Some(entry) if !entry.state.is_terminal() => {
                entry.state = to;
                true
            }
            _ => false,
        }
    }
}
