//! Ownership of the single live store subscription for the current identity.
//!
//! [`SubscriptionManager`] opens the store subscription, forwards its events
//! into the engine's update channel tagged with a *generation*, and tears it
//! down when the identity changes. Two guards keep a stale identity from ever
//! reaching the engine:
//!
//! 1. The forwarding task is aborted on teardown.
//! 2. Every event is checked against the live generation right before it is
//!    forwarded, and the engine checks it again on receipt.
//!
//! `unavailable` errors and unexpectedly closed streams are retried with
//! exponential backoff; `permission` errors end the forwarding task; other
//! errors are surfaced while the stream keeps being drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use boardsync_proto::{OwnerId, RawTask};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::{RemoteStore, StoreEvent, SubscriptionErrorKind};

/// Identifies one subscription session. `0` never identifies a live one.
pub type Generation = u64;

/// Generation value meaning "nothing is live".
const NO_GENERATION: Generation = 0;

/// Backoff settings for resubscribing after `unavailable` errors.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Retries before giving up. A delivered snapshot resets the count.
    pub max_attempts: u32,
    /// Extra random delay, as a fraction of the base delay (`0.25` = up to +25%).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered delay before retry number `attempt` (1-based).
    ///
    /// Doubles per attempt starting at `initial_delay`, capped at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, including random jitter.
    ///
    /// `jitter` is clamped to `0.0..=1.0`; a non-finite value disables it.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let fraction = rand::rng().random_range(0.0..=jitter);
        let extra =
            Duration::try_from_secs_f64(base.as_secs_f64() * fraction).unwrap_or(Duration::MAX);
        base.saturating_add(extra)
    }
}

/// A classified subscription error as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionError {
    /// Error class.
    pub kind: SubscriptionErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Whether the manager is going to resubscribe on its own.
    pub will_retry: bool,
}

/// What a subscription delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Full result set for the identity.
    Snapshot(Vec<RawTask>),
    /// The subscription failed; the last good snapshot stays valid.
    Error(SubscriptionError),
}

/// A subscription event tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// Session the event belongs to.
    pub generation: Generation,
    /// The event itself.
    pub event: SubscriptionEvent,
}

/// Handle that tears down one particular subscription session.
#[derive(Debug)]
pub struct Unsubscribe {
    generation: Generation,
    live: Arc<AtomicU64>,
    task: Option<tokio::task::AbortHandle>,
}

impl Unsubscribe {
    /// The generation this handle controls.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns `true` while this session is the live one.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) == self.generation
    }

    /// Tears the session down if it is still live.
    ///
    /// Returns `false` if a newer session had already replaced it.
    pub fn unsubscribe(self) -> bool {
        let retired = self
            .live
            .compare_exchange(
                self.generation,
                NO_GENERATION,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if retired && let Some(task) = self.task {
            task.abort();
        }
        retired
    }
}

struct ActiveSubscription {
    identity: Option<OwnerId>,
    generation: Generation,
    task: Option<JoinHandle<()>>,
}

/// Owns at most one live store subscription.
pub struct SubscriptionManager<S: RemoteStore> {
    store: Arc<S>,
    sink: mpsc::Sender<SubscriptionUpdate>,
    live: Arc<AtomicU64>,
    last_generation: Generation,
    active: Option<ActiveSubscription>,
    reconnect: ReconnectConfig,
}

impl<S: RemoteStore> SubscriptionManager<S> {
    /// Creates a manager forwarding events into `sink`.
    pub fn new(
        store: Arc<S>,
        sink: mpsc::Sender<SubscriptionUpdate>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            store,
            sink,
            live: Arc::new(AtomicU64::new(NO_GENERATION)),
            last_generation: NO_GENERATION,
            active: None,
            reconnect,
        }
    }

    /// Starts the subscription for `identity`.
    ///
    /// - A live session for the same identity is kept as is.
    /// - A session for another identity is fully torn down first.
    /// - `None` emits an immediate empty snapshot and opens nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, identity: Option<&OwnerId>) -> Unsubscribe {
        if let Some(active) = &self.active
            && identity.is_some()
            && active.identity.as_ref() == identity
            && self.live.load(Ordering::Acquire) == active.generation
            && active.task.as_ref().is_some_and(|t| !t.is_finished())
        {
            return self.handle_for(active.generation, active.task.as_ref());
        }

        self.stop();
        self.last_generation += 1;
        let generation = self.last_generation;
        self.live.store(generation, Ordering::Release);

        let task = identity.map(|owner| {
            tracing::info!(owner = %owner, generation, "starting task subscription");
            tokio::spawn(forward(
                Arc::clone(&self.store),
                owner.clone(),
                generation,
                Arc::clone(&self.live),
                self.sink.clone(),
                self.reconnect.clone(),
            ))
        });

        if task.is_none() {
            tracing::info!(generation, "no identity, publishing empty snapshot");
            if self
                .sink
                .try_send(SubscriptionUpdate {
                    generation,
                    event: SubscriptionEvent::Snapshot(Vec::new()),
                })
                .is_err()
            {
                tracing::warn!(generation, "update channel full, empty snapshot dropped");
            }
        }

        let handle = self.handle_for(generation, task.as_ref());
        self.active = Some(ActiveSubscription {
            identity: identity.cloned(),
            generation,
            task,
        });
        handle
    }

    /// Tears down the live session, if any. Synchronous: once this returns
    /// no event of the old session will be forwarded.
    pub fn stop(&mut self) {
        self.live.store(NO_GENERATION, Ordering::Release);
        if let Some(active) = self.active.take() {
            tracing::debug!(generation = active.generation, "subscription torn down");
            if let Some(task) = active.task {
                task.abort();
            }
        }
    }

    /// The live generation, or `None` if nothing is live.
    #[must_use]
    pub fn live_generation(&self) -> Option<Generation> {
        match self.live.load(Ordering::Acquire) {
            NO_GENERATION => None,
            g => Some(g),
        }
    }

    /// Returns `true` if `generation` is the live session.
    #[must_use]
    pub fn is_live(&self, generation: Generation) -> bool {
        generation != NO_GENERATION && self.live.load(Ordering::Acquire) == generation
    }

    /// Identity of the live session.
    #[must_use]
    pub fn identity(&self) -> Option<&OwnerId> {
        self.active
            .as_ref()
            .filter(|a| self.is_live(a.generation))
            .and_then(|a| a.identity.as_ref())
    }

    fn handle_for(&self, generation: Generation, task: Option<&JoinHandle<()>>) -> Unsubscribe {
        Unsubscribe {
            generation,
            live: Arc::clone(&self.live),
            task: task.map(JoinHandle::abort_handle),
        }
    }
}

impl<S: RemoteStore> Drop for SubscriptionManager<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background task: pump store events into the engine for one generation.
async fn forward<S: RemoteStore>(
    store: Arc<S>,
    owner: OwnerId,
    generation: Generation,
    live: Arc<AtomicU64>,
    sink: mpsc::Sender<SubscriptionUpdate>,
    reconnect: ReconnectConfig,
) {
    let is_live = || live.load(Ordering::Acquire) == generation;
    let deliver = |event: SubscriptionEvent| {
        let sink = sink.clone();
        let still_live = is_live();
        async move {
            if !still_live {
                return false;
            }
            sink.send(SubscriptionUpdate { generation, event })
                .await
                .is_ok()
        }
    };

    let mut attempt: u32 = 0;
    loop {
        let mut rx = store.subscribe(&owner);
        let mut reason = "subscription stream closed".to_string();

        while let Some(event) = rx.recv().await {
            if !is_live() {
                return;
            }
            match event {
                StoreEvent::Snapshot(docs) => {
                    attempt = 0;
                    if !deliver(SubscriptionEvent::Snapshot(docs)).await {
                        return;
                    }
                }
                StoreEvent::Error(err) => match err.kind() {
                    SubscriptionErrorKind::Permission => {
                        tracing::warn!(owner = %owner, error = %err, "subscription denied");
                        deliver(SubscriptionEvent::Error(SubscriptionError {
                            kind: SubscriptionErrorKind::Permission,
                            message: err.to_string(),
                            will_retry: false,
                        }))
                        .await;
                        return;
                    }
                    SubscriptionErrorKind::Unavailable => {
                        reason = err.to_string();
                        break;
                    }
                    SubscriptionErrorKind::Unknown => {
                        tracing::warn!(owner = %owner, error = %err, "subscription error");
                        if !deliver(SubscriptionEvent::Error(SubscriptionError {
                            kind: SubscriptionErrorKind::Unknown,
                            message: err.to_string(),
                            will_retry: false,
                        }))
                        .await
                        {
                            return;
                        }
                    }
                },
            }
        }
        drop(rx);

        if !is_live() {
            return;
        }
        attempt += 1;
        if attempt > reconnect.max_attempts {
            tracing::warn!(
                owner = %owner,
                attempts = reconnect.max_attempts,
                "giving up on task subscription"
            );
            deliver(SubscriptionEvent::Error(SubscriptionError {
                kind: SubscriptionErrorKind::Unavailable,
                message: format!("{reason}; gave up after {} attempts", reconnect.max_attempts),
                will_retry: false,
            }))
            .await;
            return;
        }

        let delay = reconnect.delay_for(attempt);
        tracing::info!(
            owner = %owner,
            attempt,
            max_attempts = reconnect.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "task subscription unavailable, resubscribing"
        );
        if !deliver(SubscriptionEvent::Error(SubscriptionError {
            kind: SubscriptionErrorKind::Unavailable,
            message: reason,
            will_retry: true,
        }))
        .await
        {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}
