//! In-process document store for tests and the demo binary.
//!
//! [`InMemoryStore`] behaves like the hosted store from the engine's point of
//! view: subscriptions receive an initial snapshot and a fresh full snapshot
//! after every change, writes bump a store-wide revision counter. On top of
//! that it exposes fault injection so tests can drive failures, stalls and
//! out-of-order delivery deterministically.
//!
//! The store is cheaply cloneable; clones share the same documents.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use boardsync_proto::task::fields;
use boardsync_proto::{FieldMap, OwnerId, RawTask, Revision, TaskId};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::{RemoteStore, StoreError, StoreEvent};

/// Default subscription channel capacity.
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 64;

/// A write or delete parked while writes are paused.
struct HeldWrite {
    task_id: TaskId,
    release: oneshot::Sender<Option<StoreError>>,
}

struct Subscriber {
    owner: OwnerId,
    tx: mpsc::Sender<StoreEvent>,
}

#[derive(Default)]
struct StoreState {
    docs: BTreeMap<TaskId, RawTask>,
    subscribers: Vec<Subscriber>,
    revision: u64,
    faults: VecDeque<StoreError>,
    paused: bool,
    held: Vec<HeldWrite>,
    denied: Vec<OwnerId>,
}

/// Shared in-memory task document store.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    buffer: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIPTION_BUFFER)
    }

    /// Creates an empty store whose subscriptions buffer `buffer` events.
    #[must_use]
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            buffer: buffer.max(1),
        }
    }

    /// Inserts or replaces a document, assigning it the next revision.
    ///
    /// Documents without an id are ignored. Returns the assigned revision.
    pub fn insert(&self, mut doc: RawTask) -> Option<Revision> {
        let task_id = doc.id_hint()?;
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = Revision::new(state.revision);
        doc.fields_mut()
            .insert(fields::REVISION.to_string(), Value::from(revision.get()));
        let owner = owner_of(&doc);
        state.docs.insert(task_id, doc);
        if let Some(owner) = owner {
            broadcast(&mut state, &owner);
        }
        Some(revision)
    }

    /// Returns a copy of a stored document.
    #[must_use]
    pub fn get(&self, task_id: &TaskId) -> Option<RawTask> {
        self.state.lock().docs.get(task_id).cloned()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    /// Returns `true` if no documents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().docs.is_empty()
    }

    /// The most recently assigned revision.
    #[must_use]
    pub fn current_revision(&self) -> Revision {
        Revision::new(self.state.lock().revision)
    }

    /// Number of open subscriptions for `owner`.
    #[must_use]
    pub fn subscriber_count(&self, owner: &OwnerId) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.iter().filter(|s| s.owner == *owner).count()
    }

    /// Makes the next write or delete fail with `error`. Faults queue up.
    pub fn fail_next_write(&self, error: StoreError) {
        self.state.lock().faults.push_back(error);
    }

    /// Parks every subsequent write and delete until released.
    pub fn pause_writes(&self) {
        self.state.lock().paused = true;
    }

    /// Stops parking writes and lets every parked write through.
    pub fn resume_writes(&self) {
        let held = {
            let mut state = self.state.lock();
            state.paused = false;
            std::mem::take(&mut state.held)
        };
        for write in held {
            let _ = write.release.send(None);
        }
    }

    /// Task ids of parked writes, in arrival order.
    #[must_use]
    pub fn held_writes(&self) -> Vec<TaskId> {
        self.state
            .lock()
            .held
            .iter()
            .map(|w| w.task_id.clone())
            .collect()
    }

    /// Releases the parked write at `index`, completing it with `outcome`
    /// (`None` applies the write, `Some(err)` fails it).
    ///
    /// Returns `false` if there is no parked write at that index.
    pub fn release_write(&self, index: usize, outcome: Option<StoreError>) -> bool {
        let held = {
            let mut state = self.state.lock();
            if index >= state.held.len() {
                return false;
            }
            state.held.remove(index)
        };
        held.release.send(outcome).is_ok()
    }

    /// Waits until at least `count` writes are parked, or `timeout` elapses.
    ///
    /// Returns `true` if the count was reached.
    pub async fn wait_for_held_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.lock().held.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Pushes an arbitrary snapshot to every subscriber of `owner`.
    ///
    /// Lets tests replay stale, duplicated or foreign result sets.
    pub fn push_snapshot(&self, owner: &OwnerId, docs: Vec<RawTask>) {
        let mut state = self.state.lock();
        send_to(&mut state, owner, &StoreEvent::Snapshot(docs));
    }

    /// Pushes an error to every subscriber of `owner`.
    pub fn push_error(&self, owner: &OwnerId, error: StoreError) {
        let mut state = self.state.lock();
        send_to(&mut state, owner, &StoreEvent::Error(error));
    }

    /// Ends every subscription stream of `owner`.
    pub fn close_subscriptions(&self, owner: &OwnerId) {
        self.state.lock().subscribers.retain(|s| s.owner != *owner);
    }

    /// Rejects future subscriptions of `owner` with a permission error.
    pub fn deny(&self, owner: &OwnerId) {
        self.state.lock().denied.push(owner.clone());
    }

    /// Parks the calling write if writes are paused, or takes a queued fault.
    async fn gate(&self, task_id: &TaskId) -> Result<(), StoreError> {
        let parked = {
            let mut state = self.state.lock();
            if let Some(fault) = state.faults.pop_front() {
                return Err(fault);
            }
            if state.paused {
                let (release, rx) = oneshot::channel();
                state.held.push(HeldWrite {
                    task_id: task_id.clone(),
                    release,
                });
                Some(rx)
            } else {
                None
            }
        };
        match parked {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(None) => Ok(()),
                Ok(Some(err)) => Err(err),
                Err(_) => Err(StoreError::Unavailable("write abandoned".to_string())),
            },
        }
    }
}

impl RemoteStore for InMemoryStore {
    fn subscribe(&self, owner: &OwnerId) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut state = self.state.lock();
        if state.denied.contains(owner) {
            let _ = tx.try_send(StoreEvent::Error(StoreError::PermissionDenied(format!(
                "{owner} may not read tasks"
            ))));
            return rx;
        }
        let _ = tx.try_send(StoreEvent::Snapshot(snapshot_for(&state, owner)));
        state.subscribers.push(Subscriber {
            owner: owner.clone(),
            tx,
        });
        tracing::debug!(owner = %owner, "store subscription opened");
        rx
    }

    async fn write(&self, task_id: &TaskId, update: FieldMap) -> Result<Revision, StoreError> {
        self.gate(task_id).await?;
        let mut state = self.state.lock();
        if !state.docs.contains_key(task_id) {
            return Err(StoreError::NotFound(task_id.clone()));
        }
        state.revision += 1;
        let revision = Revision::new(state.revision);
        let owner = {
            let Some(doc) = state.docs.get_mut(task_id) else {
                return Err(StoreError::NotFound(task_id.clone()));
            };
            let map = doc.fields_mut();
            for (field, value) in update {
                if field != fields::ID && field != fields::REVISION {
                    map.insert(field, value);
                }
            }
            map.insert(fields::REVISION.to_string(), Value::from(revision.get()));
            map.insert(
                fields::UPDATED_AT.to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            owner_of(doc)
        };
        if let Some(owner) = owner {
            broadcast(&mut state, &owner);
        }
        Ok(revision)
    }

    async fn delete(&self, task_id: &TaskId) -> Result<(), StoreError> {
        self.gate(task_id).await?;
        let mut state = self.state.lock();
        if let Some(doc) = state.docs.remove(task_id) {
            state.revision += 1;
            if let Some(owner) = owner_of(&doc) {
                broadcast(&mut state, &owner);
            }
        }
        Ok(())
    }
}

fn owner_of(doc: &RawTask) -> Option<OwnerId> {
    doc.get(fields::OWNER_ID)
        .or_else(|| doc.get(fields::LEGACY_OWNER_ID))
        .and_then(Value::as_str)
        .map(OwnerId::new)
}

fn snapshot_for(state: &StoreState, owner: &OwnerId) -> Vec<RawTask> {
    state
        .docs
        .values()
        .filter(|doc| owner_of(doc).as_ref() == Some(owner))
        .cloned()
        .collect()
}

fn broadcast(state: &mut StoreState, owner: &OwnerId) {
    let snapshot = StoreEvent::Snapshot(snapshot_for(state, owner));
    send_to(state, owner, &snapshot);
}

fn send_to(state: &mut StoreState, owner: &OwnerId, event: &StoreEvent) {
    state.subscribers.retain(|s| !s.tx.is_closed());
    for subscriber in state.subscribers.iter().filter(|s| s.owner == *owner) {
        if subscriber.tx.try_send(event.clone()).is_err() {
            tracing::warn!(owner = %owner, "subscriber lagging, store event dropped");
        }
    }
}
