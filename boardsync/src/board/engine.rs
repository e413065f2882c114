//! The board sync engine: one instance per mounted board and identity.
//!
//! [`BoardSync`] owns the optimistic ledger, the latest snapshot and the
//! subscription, and republishes a [`BoardView`] after every reconciliation
//! pass. All state lives behind one mutex that is never held across an
//! `.await`; the two asynchronous sources (subscription events and write
//! resolutions) re-enter through it and are checked against the session
//! generation they were issued under.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use boardsync_proto::task::fields;
use boardsync_proto::{CanonicalStatus, FieldMap, OwnerId, RawTask, Revision, TaskId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use super::{
    Board, BoardError, BoardErrorKind, BoardView, OptimisticPlacement, SyncError, SyncHealth,
    reconcile,
};
use crate::ledger::{
    IssueContext, MutationHandle, MutationState, OptimisticLedger, PendingMutation,
};
use crate::store::{RemoteStore, StoreError, SubscriptionErrorKind};
use crate::subscription::{
    ReconnectConfig, SubscriptionEvent, SubscriptionManager, SubscriptionUpdate,
};

/// Fields a local edit may never write.
const PROTECTED_FIELDS: [&str; 4] = [
    fields::ID,
    fields::OWNER_ID,
    fields::LEGACY_OWNER_ID,
    fields::REVISION,
];

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Capacity of the subscription update channel.
    pub update_buffer: usize,
    /// Capacity of the [`BoardError`] channel.
    pub error_buffer: usize,
    /// Where optimistically moved tasks land.
    pub placement: OptimisticPlacement,
    /// Subscription backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_buffer: 256,
            error_buffer: 64,
            placement: OptimisticPlacement::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Result of a move or edit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A mutation was recorded and its write issued.
    Issued(MutationHandle),
    /// The board already shows the requested state; nothing was written.
    Unchanged,
}

impl RequestOutcome {
    /// The mutation handle, if one was issued.
    #[must_use]
    pub const fn handle(&self) -> Option<&MutationHandle> {
        match self {
            Self::Issued(handle) => Some(handle),
            Self::Unchanged => None,
        }
    }
}

struct EngineState<S: RemoteStore> {
    identity: Option<OwnerId>,
    started: bool,
    generation: u64,
    health: SyncHealth,
    snapshot: Vec<RawTask>,
    remote: BTreeMap<TaskId, IssueContext>,
    ledger: OptimisticLedger,
    view: Arc<BoardView>,
    subscription: SubscriptionManager<S>,
    /// Taken by the pump task on the first `start`.
    updates: Option<mpsc::Receiver<SubscriptionUpdate>>,
}

struct Inner<S: RemoteStore> {
    store: Arc<S>,
    placement: OptimisticPlacement,
    state: Mutex<EngineState<S>>,
    board_tx: watch::Sender<Arc<BoardView>>,
    error_tx: mpsc::Sender<BoardError>,
}

/// Optimistic board synchronization against a [`RemoteStore`].
///
/// Cloning is cheap; clones drive the same board. Request methods and
/// [`start`](Self::start) spawn tokio tasks and must be called from within a
/// runtime.
pub struct BoardSync<S: RemoteStore> {
    inner: Arc<Inner<S>>,
}

impl<S: RemoteStore> Clone for BoardSync<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RemoteStore> BoardSync<S> {
    /// Creates an idle engine and the receiver for its asynchronous errors.
    pub fn new(store: S, config: SyncConfig) -> (Self, mpsc::Receiver<BoardError>) {
        let store = Arc::new(store);
        let (update_tx, update_rx) = mpsc::channel(config.update_buffer.max(1));
        let (error_tx, error_rx) = mpsc::channel(config.error_buffer.max(1));
        let view = Arc::new(BoardView::default());
        let (board_tx, _) = watch::channel(Arc::clone(&view));

        let state = EngineState {
            identity: None,
            started: false,
            generation: 0,
            health: SyncHealth::Idle,
            snapshot: Vec::new(),
            remote: BTreeMap::new(),
            ledger: OptimisticLedger::new(),
            view,
            subscription: SubscriptionManager::new(
                Arc::clone(&store),
                update_tx,
                config.reconnect,
            ),
            updates: Some(update_rx),
        };

        let sync = Self {
            inner: Arc::new(Inner {
                store,
                placement: config.placement,
                state: Mutex::new(state),
                board_tx,
                error_tx,
            }),
        };
        (sync, error_rx)
    }

    /// Starts syncing the board of `identity`.
    ///
    /// A different identity first tears the previous session down (ledger
    /// entries are dropped, stale callbacks are ignored from then on). The
    /// same identity keeps the session and only resubscribes if the
    /// subscription has ended. `None` shows an empty idle board.
    pub fn start(&self, identity: Option<OwnerId>) {
        let updates = {
            let mut state = self.inner.state.lock();
            if state.started && state.identity == identity {
                let before = state.subscription.live_generation();
                let handle = state.subscription.start(identity.as_ref());
                if before != Some(handle.generation()) {
                    tracing::info!(generation = handle.generation(), "resubscribing board");
                    state.health = connecting_health(identity.as_ref());
                    self.inner.recompute(&mut state);
                }
            } else {
                self.inner.teardown(&mut state);
                tracing::info!(
                    owner = identity.as_ref().map_or("<none>", OwnerId::as_str),
                    generation = state.generation,
                    "starting board sync"
                );
                state.started = true;
                state.health = connecting_health(identity.as_ref());
                state.subscription.start(identity.as_ref());
                state.identity = identity;
                self.inner.recompute(&mut state);
            }
            state.updates.take()
        };

        if let Some(updates) = updates {
            tokio::spawn(pump(Arc::downgrade(&self.inner), updates));
        }
    }

    /// Synchronously tears the session down and publishes an empty board.
    ///
    /// In-flight mutations are dropped, neither settled nor rolled back; their
    /// writes may still land in the store but their results are ignored.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        self.inner.teardown(&mut state);
        state.started = false;
        state.identity = None;
        state.health = SyncHealth::Idle;
        self.inner.recompute(&mut state);
        tracing::info!(generation = state.generation, "board sync shut down");
    }

    /// The current board view.
    #[must_use]
    pub fn board(&self) -> Arc<BoardView> {
        Arc::clone(&self.inner.state.lock().view)
    }

    /// A receiver notified after every reconciliation pass.
    #[must_use]
    pub fn watch_board(&self) -> watch::Receiver<Arc<BoardView>> {
        self.inner.board_tx.subscribe()
    }

    /// Current subscription health.
    #[must_use]
    pub fn health(&self) -> SyncHealth {
        self.inner.state.lock().health
    }

    /// The identity being synced, if any.
    #[must_use]
    pub fn identity(&self) -> Option<OwnerId> {
        self.inner.state.lock().identity.clone()
    }

    /// Lifecycle state of a mutation, or `None` once it was collected or
    /// dropped by teardown.
    #[must_use]
    pub fn mutation_state(&self, handle: &MutationHandle) -> Option<MutationState> {
        self.inner.state.lock().ledger.state(handle)
    }

    /// Number of mutations still in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().ledger.in_flight_count()
    }

    /// Copy of the retained ledger entries, in issue order.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.inner.state.lock().ledger.snapshot()
    }

    /// Moves a task to another column.
    ///
    /// The board updates before this returns; the write resolves in the
    /// background. A failed write rolls the move back and is reported on the
    /// error channel. A successful write leaves the mutation `InFlight` until
    /// a snapshot at the store-assigned revision, or one already showing the
    /// task in `to`, arrives; [`Self::mutation_state`] reflects that.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotStarted`] without an identity and
    /// [`SyncError::TaskNotFound`] if the task is not on the board.
    pub fn request_move(
        &self,
        task_id: &TaskId,
        to: CanonicalStatus,
    ) -> Result<RequestOutcome, SyncError> {
        let (handle, generation) = {
            let mut state = self.inner.state.lock();
            let from = locate(&state, task_id)?;
            if from == to {
                return Ok(RequestOutcome::Unchanged);
            }
            let context = state.remote.get(task_id).copied().unwrap_or_default();
            let handle = state.ledger.apply_move(task_id, to, context);
            tracing::info!(task_id = %task_id, from = %from, to = %to, "move requested");
            self.inner.recompute(&mut state);
            (handle, state.generation)
        };

        let mut update = FieldMap::new();
        update.insert(
            fields::STATUS.to_string(),
            Value::String(to.as_str().to_string()),
        );
        self.spawn_write(handle.clone(), generation, BoardErrorKind::Move, Some(update));
        Ok(RequestOutcome::Issued(handle))
    }

    /// Edits payload fields of a task.
    ///
    /// Identity fields (`id`, owner, `revision`) are stripped from `update`.
    /// Nothing is written if what remains is empty or already shown.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotStarted`] without an identity and
    /// [`SyncError::TaskNotFound`] if the task is not on the board.
    pub fn request_edit(
        &self,
        task_id: &TaskId,
        mut update: FieldMap,
    ) -> Result<RequestOutcome, SyncError> {
        for field in PROTECTED_FIELDS {
            if update.remove(field).is_some() {
                tracing::warn!(task_id = %task_id, field, "ignoring edit of identity field");
            }
        }

        let (handle, generation) = {
            let mut state = self.inner.state.lock();
            locate(&state, task_id)?;
            let shown = state
                .view
                .board
                .find(task_id)
                .is_some_and(|(_, _, entry)| entry.task.reflects(&update));
            if update.is_empty() || shown {
                return Ok(RequestOutcome::Unchanged);
            }
            let context = state.remote.get(task_id).copied().unwrap_or_default();
            let handle = state.ledger.apply_edit(task_id, update.clone(), context);
            tracing::info!(
                task_id = %task_id,
                fields = ?update.keys().collect::<Vec<_>>(),
                "edit requested"
            );
            self.inner.recompute(&mut state);
            (handle, state.generation)
        };

        self.spawn_write(handle.clone(), generation, BoardErrorKind::Edit, Some(update));
        Ok(RequestOutcome::Issued(handle))
    }

    /// Deletes a task. It disappears from the board immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotStarted`] without an identity and
    /// [`SyncError::TaskNotFound`] if the task is not on the board.
    pub fn request_delete(&self, task_id: &TaskId) -> Result<MutationHandle, SyncError> {
        let (handle, generation) = {
            let mut state = self.inner.state.lock();
            locate(&state, task_id)?;
            let context = state.remote.get(task_id).copied().unwrap_or_default();
            let handle = state.ledger.apply_delete(task_id, context);
            tracing::info!(task_id = %task_id, "delete requested");
            self.inner.recompute(&mut state);
            (handle, state.generation)
        };

        self.spawn_write(handle.clone(), generation, BoardErrorKind::Delete, None);
        Ok(handle)
    }

    /// Issues the store call for a mutation. `None` means delete.
    fn spawn_write(
        &self,
        handle: MutationHandle,
        generation: u64,
        kind: BoardErrorKind,
        update: Option<FieldMap>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let task_id = handle.task_id().clone();
            let result = match update {
                Some(update) => inner.store.write(&task_id, update).await.map(Some),
                None => inner.store.delete(&task_id).await.map(|()| None),
            };
            inner.resolve(generation, &handle, kind, result);
        });
    }
}

impl<S: RemoteStore> Inner<S> {
    /// Applies a subscription event.
    fn on_update(&self, update: SubscriptionUpdate) {
        let mut state = self.state.lock();
        if !state.subscription.is_live(update.generation) {
            tracing::debug!(
                generation = update.generation,
                "dropping event from retired subscription"
            );
            return;
        }

        match update.event {
            SubscriptionEvent::Snapshot(docs) => {
                tracing::debug!(tasks = docs.len(), "snapshot received");
                state.snapshot = docs;
                state.health = if state.identity.is_some() {
                    SyncHealth::Live
                } else {
                    SyncHealth::Idle
                };
            }
            SubscriptionEvent::Error(err) => {
                state.health = match err.kind {
                    SubscriptionErrorKind::Permission => SyncHealth::Denied,
                    SubscriptionErrorKind::Unavailable | SubscriptionErrorKind::Unknown => {
                        SyncHealth::Stale
                    }
                };
                tracing::warn!(
                    kind = %err.kind,
                    will_retry = err.will_retry,
                    message = %err.message,
                    health = %state.health,
                    "subscription error"
                );
                self.report(BoardError {
                    task_id: None,
                    kind: BoardErrorKind::Subscription(err.kind),
                    retryable: err.will_retry,
                    message: err.message,
                });
            }
        }
        self.recompute(&mut state);
    }

    /// Applies the outcome of a store call.
    fn resolve(
        &self,
        generation: u64,
        handle: &MutationHandle,
        kind: BoardErrorKind,
        result: Result<Option<Revision>, StoreError>,
    ) {
        let mut state = self.state.lock();
        let task_id = handle.task_id();
        if state.generation != generation {
            tracing::debug!(
                task_id = %task_id,
                mutation = %handle.id(),
                "dropping write result from torn-down session"
            );
            return;
        }

        match result {
            // A confirmed delete keeps hiding the task until a snapshot
            // without it arrives.
            Ok(None) if state.remote.contains_key(task_id) => {
                tracing::debug!(task_id = %task_id, "delete confirmed, awaiting snapshot");
            }
            Ok(revision) => {
                if state.ledger.acknowledge(handle, revision) {
                    tracing::debug!(
                        task_id = %task_id,
                        mutation = %handle.id(),
                        revision = ?revision,
                        "write acknowledged"
                    );
                } else {
                    tracing::debug!(
                        task_id = %task_id,
                        mutation = %handle.id(),
                        "discarding result of resolved or superseded mutation"
                    );
                }
            }
            Err(err) => {
                if state.ledger.rollback(handle) {
                    tracing::warn!(
                        task_id = %task_id,
                        mutation = %handle.id(),
                        kind = %kind,
                        error = %err,
                        "write failed, rolled back"
                    );
                    self.report(BoardError {
                        task_id: Some(task_id.clone()),
                        kind,
                        retryable: err.is_retryable(),
                        message: err.to_string(),
                    });
                } else {
                    tracing::debug!(
                        task_id = %task_id,
                        mutation = %handle.id(),
                        error = %err,
                        "discarding failure of superseded mutation"
                    );
                }
            }
        }
        self.recompute(&mut state);
    }

    /// Rebuilds the board, settles caught-up mutations and publishes.
    fn recompute(&self, state: &mut EngineState<S>) {
        let board = match &state.identity {
            Some(owner) => {
                let rec = reconcile(
                    &state.snapshot,
                    &state.ledger.snapshot(),
                    owner,
                    self.placement,
                );
                for id in &rec.caught_up {
                    state.ledger.settle_id(*id);
                }
                state.remote = rec.remote;
                rec.board
            }
            None => Board::default(),
        };

        let collected = state.ledger.collect_garbage();
        if collected > 0 {
            tracing::trace!(collected, "collected resolved mutations");
        }
        let view = Arc::new(BoardView {
            board,
            health: state.health,
            generation: state.generation,
        });
        state.view = Arc::clone(&view);
        self.board_tx.send_replace(view);
        state.ledger.mark_rendered();
    }

    /// Retires the current session: stale callbacks are ignored afterwards.
    fn teardown(&self, state: &mut EngineState<S>) {
        state.generation += 1;
        state.subscription.stop();
        let dropped = state.ledger.clear();
        state.snapshot.clear();
        state.remote.clear();
        if dropped > 0 {
            tracing::info!(dropped, "dropped in-flight mutations on teardown");
        }
    }

    fn report(&self, error: BoardError) {
        match self.error_tx.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(error)) => {
                tracing::warn!(error = %error, "error channel full, board error dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

const fn connecting_health(identity: Option<&OwnerId>) -> SyncHealth {
    if identity.is_some() {
        SyncHealth::Connecting
    } else {
        SyncHealth::Idle
    }
}

fn locate<S: RemoteStore>(
    state: &EngineState<S>,
    task_id: &TaskId,
) -> Result<CanonicalStatus, SyncError> {
    if state.identity.is_none() {
        return Err(SyncError::NotStarted);
    }
    state
        .view
        .board
        .find(task_id)
        .map(|(status, _, _)| status)
        .ok_or_else(|| SyncError::TaskNotFound(task_id.clone()))
}

/// Background task feeding subscription events into the engine.
async fn pump<S: RemoteStore>(
    inner: Weak<Inner<S>>,
    mut updates: mpsc::Receiver<SubscriptionUpdate>,
) {
    while let Some(update) = updates.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_update(update);
    }
    tracing::debug!("subscription pump stopped");
}
