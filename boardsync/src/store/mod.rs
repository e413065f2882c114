//! Contract of the remote document store the board syncs against.
//!
//! Defines the [`RemoteStore`] trait the engine consumes. Concrete
//! implementations include:
//! - [`memory::InMemoryStore`]: in-process store for tests and the demo binary
//!
//! A hosted document database adapter implements the same trait: a
//! query-scoped subscription that pushes the *full* result set on every
//! change, plus point writes and deletes that resolve asynchronously.

pub mod memory;

use std::fmt;

use boardsync_proto::{FieldMap, OwnerId, RawTask, Revision, TaskId};
use tokio::sync::mpsc;

/// Classification of subscription failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionErrorKind {
    /// The identity may not read this collection. Fatal for the session.
    Permission,
    /// The store is temporarily unreachable. Retried with backoff.
    Unavailable,
    /// Anything else. Surfaced, not retried.
    Unknown,
}

impl fmt::Display for SubscriptionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permission => write!(f, "permission"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The caller lacks permission for the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The addressed document does not exist.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Any other failure.
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Maps this error onto the subscription error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> SubscriptionErrorKind {
        match self {
            Self::PermissionDenied(_) => SubscriptionErrorKind::Permission,
            Self::Unavailable(_) => SubscriptionErrorKind::Unavailable,
            Self::NotFound(_) | Self::Other(_) => SubscriptionErrorKind::Unknown,
        }
    }

    /// Whether re-issuing the same operation could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::PermissionDenied(_))
    }
}

/// An event delivered on a store subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The full current result set.
    Snapshot(Vec<RawTask>),
    /// The subscription hit an error. The stream may continue or end.
    Error(StoreError),
}

/// Async document store holding task documents.
///
/// Delivery order of snapshots is not guaranteed to match write order; only
/// eventual consistency is assumed.
pub trait RemoteStore: Send + Sync + 'static {
    /// Subscribes to every task owned by `owner`.
    ///
    /// The store pushes a [`StoreEvent::Snapshot`] with the full result set
    /// whenever any matching document changes. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self, owner: &OwnerId) -> mpsc::Receiver<StoreEvent>;

    /// Writes (merges) `fields` into the task document.
    ///
    /// Resolves with the revision the store assigned to the write.
    fn write(
        &self,
        task_id: &TaskId,
        fields: FieldMap,
    ) -> impl std::future::Future<Output = Result<Revision, StoreError>> + Send;

    /// Deletes the task document.
    fn delete(
        &self,
        task_id: &TaskId,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
