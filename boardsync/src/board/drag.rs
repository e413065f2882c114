//! Drag-and-drop gesture handling on top of [`BoardSync`].
//!
//! One [`DragDropController`] tracks one gesture at a time:
//!
//! ```text
//! Idle ──begin──▶ Dragging ──drop_at──▶ Idle (moved | reordered | invalid)
//!                    └──────cancel────▶ Idle
//! ```
//!
//! Ordering inside a column is always derived, so a drop within the origin
//! column never persists anything.

use boardsync_proto::{CanonicalStatus, TaskId};
use thiserror::Error;

use super::{BoardSync, RequestOutcome, SyncError};
use crate::ledger::MutationHandle;
use crate::store::RemoteStore;

/// Gesture misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DragError {
    /// `begin` while another gesture is active.
    #[error("already dragging task {0}")]
    AlreadyDragging(TaskId),

    /// `drop_at` without an active gesture.
    #[error("no drag in progress")]
    NotDragging,
}

/// Gesture state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DragState {
    /// No gesture.
    #[default]
    Idle,
    /// A card is being dragged.
    Dragging {
        /// The dragged task.
        task_id: TaskId,
        /// Column it was picked up from.
        origin: CanonicalStatus,
        /// Index it was picked up from.
        origin_index: usize,
    },
}

/// Where a card was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropTarget {
    /// Destination column.
    pub column: CanonicalStatus,
    /// Index within the destination column.
    pub index: usize,
}

/// Why a drop was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidDrop {
    /// Released outside any column.
    NoColumn,
    /// Released where it was picked up.
    SamePosition,
}

/// Result of a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropOutcome {
    /// Moved to another column; the write is in flight.
    Moved(MutationHandle),
    /// Dropped elsewhere in the same column. Nothing persisted.
    Reordered,
    /// Rejected; nothing changed.
    Invalid(InvalidDrop),
}

/// Drag-and-drop state machine bound to one board.
pub struct DragDropController<S: RemoteStore> {
    sync: BoardSync<S>,
    state: DragState,
}

impl<S: RemoteStore> DragDropController<S> {
    /// Creates an idle controller for `sync`'s board.
    pub const fn new(sync: BoardSync<S>) -> Self {
        Self {
            sync,
            state: DragState::Idle,
        }
    }

    /// Current gesture state.
    #[must_use]
    pub const fn state(&self) -> &DragState {
        &self.state
    }

    /// Picks up a card.
    ///
    /// # Errors
    ///
    /// Returns [`DragError::AlreadyDragging`] if a gesture is active and
    /// [`SyncError::TaskNotFound`] if the task is not on the board.
    pub fn begin(&mut self, task_id: &TaskId) -> Result<(), SyncError> {
        if let DragState::Dragging { task_id: active, .. } = &self.state {
            return Err(DragError::AlreadyDragging(active.clone()).into());
        }
        let view = self.sync.board();
        let (origin, origin_index, _) = view
            .board
            .find(task_id)
            .ok_or_else(|| SyncError::TaskNotFound(task_id.clone()))?;
        tracing::debug!(task_id = %task_id, origin = %origin, origin_index, "drag started");
        self.state = DragState::Dragging {
            task_id: task_id.clone(),
            origin,
            origin_index,
        };
        Ok(())
    }

    /// Releases the card. The controller is idle afterwards, whatever the
    /// outcome.
    ///
    /// The target is compared with where the card is shown now, which may
    /// differ from where it was picked up.
    ///
    /// # Errors
    ///
    /// Returns [`DragError::NotDragging`] without an active gesture, and
    /// the engine's error if the move cannot be requested (for example the
    /// task disappeared mid-drag).
    pub fn drop_at(&mut self, target: Option<DropTarget>) -> Result<DropOutcome, SyncError> {
        let DragState::Dragging { task_id, .. } = std::mem::take(&mut self.state) else {
            return Err(DragError::NotDragging.into());
        };

        let Some(target) = target else {
            tracing::debug!(task_id = %task_id, "dropped outside any column");
            return Ok(DropOutcome::Invalid(InvalidDrop::NoColumn));
        };

        // Snapshots may have moved the card since `begin`.
        let view = self.sync.board();
        let Some((column, index, _)) = view.board.find(&task_id) else {
            return Err(SyncError::TaskNotFound(task_id));
        };
        if target.column == column {
            if target.index == index {
                return Ok(DropOutcome::Invalid(InvalidDrop::SamePosition));
            }
            tracing::debug!(task_id = %task_id, column = %column, "reorder within column ignored");
            return Ok(DropOutcome::Reordered);
        }

        match self.sync.request_move(&task_id, target.column)? {
            RequestOutcome::Issued(handle) => Ok(DropOutcome::Moved(handle)),
            // A snapshot moved the card there while it was being dragged.
            RequestOutcome::Unchanged => Ok(DropOutcome::Reordered),
        }
    }

    /// Abandons the gesture. Returns `false` if none was active.
    pub fn cancel(&mut self) -> bool {
        match std::mem::take(&mut self.state) {
            DragState::Idle => false,
            DragState::Dragging { task_id, .. } => {
                tracing::debug!(task_id = %task_id, "drag cancelled");
                true
            }
        }
    }
}
