//! The Kanban board read model and the engine that keeps it current.
//!
//! A [`Board`] is never mutated in place: every pass rebuilds it from the
//! latest store snapshot plus the optimistic ledger (see [`reconcile`]).
//! [`BoardSync`] owns that state per identity and publishes a fresh
//! [`BoardView`] after each pass.

pub mod drag;
pub mod engine;
pub mod reconcile;

pub use drag::{DragDropController, DragError, DragState, DropOutcome, DropTarget, InvalidDrop};
pub use engine::{BoardSync, RequestOutcome, SyncConfig};
pub use reconcile::{Reconciliation, reconcile};

use std::fmt;
use std::str::FromStr;

use boardsync_proto::{CanonicalStatus, Task, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::SubscriptionErrorKind;

/// One card on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardEntry {
    /// The task as displayed, local edits overlaid.
    pub task: Task,
    /// Column the task is shown in.
    pub status: CanonicalStatus,
    /// `true` while a local mutation shapes how this entry is shown.
    pub optimistic: bool,
}

/// The three fixed columns, each in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Board {
    /// `todo` column.
    pub todo: Vec<BoardEntry>,
    /// `in_progress` column.
    pub in_progress: Vec<BoardEntry>,
    /// `done` column.
    pub done: Vec<BoardEntry>,
}

impl Board {
    /// Entries of one column, in display order.
    #[must_use]
    pub fn column(&self, status: CanonicalStatus) -> &[BoardEntry] {
        match status {
            CanonicalStatus::Todo => &self.todo,
            CanonicalStatus::InProgress => &self.in_progress,
            CanonicalStatus::Done => &self.done,
        }
    }

    pub(crate) const fn column_mut(&mut self, status: CanonicalStatus) -> &mut Vec<BoardEntry> {
        match status {
            CanonicalStatus::Todo => &mut self.todo,
            CanonicalStatus::InProgress => &mut self.in_progress,
            CanonicalStatus::Done => &mut self.done,
        }
    }

    /// Task ids of one column, in display order.
    #[must_use]
    pub fn ids(&self, status: CanonicalStatus) -> Vec<&str> {
        self.column(status)
            .iter()
            .map(|e| e.task.id.as_str())
            .collect()
    }

    /// Locates a task: its column, index within the column, and entry.
    #[must_use]
    pub fn find(&self, task_id: &TaskId) -> Option<(CanonicalStatus, usize, &BoardEntry)> {
        CanonicalStatus::ALL.into_iter().find_map(|status| {
            self.column(status)
                .iter()
                .position(|e| e.task.id == *task_id)
                .map(|index| (status, index, &self.column(status)[index]))
        })
    }

    /// Returns `true` if the task is on the board.
    #[must_use]
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.find(task_id).is_some()
    }

    /// Every entry, column by column.
    pub fn iter(&self) -> impl Iterator<Item = &BoardEntry> {
        CanonicalStatus::ALL
            .into_iter()
            .flat_map(|status| self.column(status).iter())
    }

    /// Total number of cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.todo.len() + self.in_progress.len() + self.done.len()
    }

    /// Returns `true` if no column has cards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection health of the board's subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    /// Not started, or no identity.
    #[default]
    Idle,
    /// Subscribed, first snapshot not yet received.
    Connecting,
    /// Receiving snapshots.
    Live,
    /// Last good board shown, subscription degraded.
    Stale,
    /// The identity may not read its tasks. Not retried.
    Denied,
}

impl SyncHealth {
    /// Lowercase label, as shown by the demo binary.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Stale => "stale",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for SyncHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the view layer renders: the board plus its health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardView {
    /// Current board.
    pub board: Board,
    /// Subscription health.
    pub health: SyncHealth,
    /// Engine session the view was produced in.
    pub generation: u64,
}

/// Where optimistically moved tasks land in their destination column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimisticPlacement {
    /// Sorted with every other task by the ordering policy.
    #[default]
    Sorted,
    /// Ahead of the column's settled tasks until the move settles.
    Front,
}

impl FromStr for OptimisticPlacement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sorted" => Ok(Self::Sorted),
            "front" => Ok(Self::Front),
            other => Err(format!(
                "unknown optimistic placement {other:?} (expected \"sorted\" or \"front\")"
            )),
        }
    }
}

/// What failed, for a [`BoardError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardErrorKind {
    /// A move could not be persisted and was rolled back.
    Move,
    /// An edit could not be persisted and was rolled back.
    Edit,
    /// A delete could not be persisted and was rolled back.
    Delete,
    /// The subscription reported an error.
    Subscription(SubscriptionErrorKind),
}

impl fmt::Display for BoardErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move => f.write_str("move"),
            Self::Edit => f.write_str("edit"),
            Self::Delete => f.write_str("delete"),
            Self::Subscription(kind) => write!(f, "subscription ({kind})"),
        }
    }
}

/// An asynchronous failure surfaced to the view layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failed: {message}")]
pub struct BoardError {
    /// Task the failure belongs to. `None` for subscription errors.
    pub task_id: Option<TaskId>,
    /// What failed.
    pub kind: BoardErrorKind,
    /// Whether retrying (re-issuing the action, or waiting) can help.
    pub retryable: bool,
    /// Human-readable detail.
    pub message: String,
}

/// Errors returned synchronously by board requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The engine has no identity; call `start` first.
    #[error("board sync not started")]
    NotStarted,

    /// The task is not on the current board.
    #[error("task not on board: {0}")]
    TaskNotFound(TaskId),

    /// Drag gesture misuse.
    #[error(transparent)]
    Drag(#[from] DragError),
}
