//! Integration tests for the board sync engine against the in-memory store.
//!
//! Covers optimistic moves, edits and deletes end to end: immediate board
//! updates, settling once the store catches up, last-intent-wins for racing
//! moves, rollback on failed writes, subscription health, and teardown.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::similar_names,
    clippy::redundant_clone
)]

use std::sync::Arc;
use std::time::Duration;

use boardsync::board::{
    BoardEntry, BoardError, BoardErrorKind, BoardSync, BoardView, OptimisticPlacement, RequestOutcome,
    SyncConfig, SyncHealth,
};
use boardsync::ledger::MutationState;
use boardsync::store::memory::InMemoryStore;
use boardsync::store::{StoreError, SubscriptionErrorKind};
use boardsync::subscription::ReconnectConfig;
use boardsync_proto::{CanonicalStatus, FieldMap, OwnerId, RawTask, TaskId};
use serde_json::{Value, json};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(2);

fn alice() -> OwnerId {
    OwnerId::new("alice")
}

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

fn raw(value: Value) -> RawTask {
    RawTask::from_value(value).unwrap()
}

fn task_doc(id: &str, owner: &str, status: &str, created_at: &str) -> RawTask {
    raw(json!({
        "id": id,
        "ownerId": owner,
        "title": format!("task {id}"),
        "status": status,
        "createdAt": created_at,
    }))
}

/// The two-task store used by the end-to-end scenario.
fn scenario_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    store.insert(task_doc("1", "alice", "YAPILACAK", "2024-01-01T00:00:00Z"));
    store.insert(task_doc("2", "alice", "done", "2024-01-02T00:00:00Z"));
    store
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: 3,
            jitter: 0.0,
        },
        ..SyncConfig::default()
    }
}

/// Starts an engine for alice and waits for its first live board.
async fn started(
    store: &InMemoryStore,
    config: SyncConfig,
) -> (BoardSync<InMemoryStore>, mpsc::Receiver<BoardError>) {
    let (sync, errors) = BoardSync::new(store.clone(), config);
    sync.start(Some(alice()));
    wait_for_view(&sync, |v| v.health == SyncHealth::Live).await;
    (sync, errors)
}

async fn wait_for_view(
    sync: &BoardSync<InMemoryStore>,
    mut predicate: impl FnMut(&BoardView) -> bool,
) -> Arc<BoardView> {
    let mut rx = sync.watch_board();
    let view = tokio::time::timeout(WAIT, rx.wait_for(|v| predicate(v)))
        .await
        .expect("timed out waiting for board")
        .expect("engine dropped")
        .clone();
    view
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn next_error(errors: &mut mpsc::Receiver<BoardError>) -> BoardError {
    tokio::time::timeout(WAIT, errors.recv())
        .await
        .expect("timed out waiting for error")
        .expect("error channel closed")
}

async fn assert_no_error(errors: &mut mpsc::Receiver<BoardError>) {
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(errors.try_recv().is_err(), "unexpected board error");
}

/// Column and entry of a task on the current board.
fn entry(sync: &BoardSync<InMemoryStore>, task_id: &str) -> Option<(CanonicalStatus, BoardEntry)> {
    let view = sync.board();
    view.board
        .find(&id(task_id))
        .map(|(status, _, entry)| (status, entry.clone()))
}

fn title_edit(title: &str) -> FieldMap {
    let mut update = FieldMap::new();
    update.insert("title".into(), json!(title));
    update
}

// ---------------------------------------------------------------------------
// End-to-end scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_move_before_next_snapshot() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    let view = sync.board();
    assert_eq!(view.board.ids(CanonicalStatus::Todo), ["1"]);
    assert!(view.board.ids(CanonicalStatus::InProgress).is_empty());
    assert_eq!(view.board.ids(CanonicalStatus::Done), ["2"]);

    store.pause_writes();
    let outcome = sync.request_move(&id("1"), CanonicalStatus::Done).unwrap();
    let handle = outcome.handle().cloned().unwrap();

    // Applied synchronously, before the write resolves.
    let view = sync.board();
    assert!(view.board.ids(CanonicalStatus::Todo).is_empty());
    assert_eq!(view.board.ids(CanonicalStatus::Done), ["2", "1"]);
    assert_eq!(sync.mutation_state(&handle), Some(MutationState::InFlight));

    store.resume_writes();
    let view = wait_for_view(&sync, |v| {
        v.board
            .find(&id("1"))
            .is_some_and(|(_, _, entry)| !entry.optimistic)
    })
    .await;
    assert_eq!(view.board.ids(CanonicalStatus::Done), ["2", "1"]);
    assert_eq!(sync.in_flight_count(), 0);
    assert_eq!(store.get(&id("1")).unwrap().get("status"), Some(&json!("done")));
    assert_no_error(&mut errors).await;
}

#[tokio::test]
async fn front_placement_shows_moved_task_first() {
    let store = scenario_store();
    let config = SyncConfig {
        placement: OptimisticPlacement::Front,
        ..fast_config()
    };
    let (sync, _errors) = started(&store, config).await;

    store.pause_writes();
    sync.request_move(&id("1"), CanonicalStatus::Done).unwrap();
    assert_eq!(sync.board().board.ids(CanonicalStatus::Done), ["1", "2"]);

    // Once settled the ordering policy applies again.
    store.resume_writes();
    let view = wait_for_view(&sync, |v| v.board.iter().all(|e| !e.optimistic)).await;
    assert_eq!(view.board.ids(CanonicalStatus::Done), ["2", "1"]);
}

// ---------------------------------------------------------------------------
// Optimism, catch-up, last intent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_snapshot_does_not_revert_in_flight_move() {
    let store = scenario_store();
    let (sync, _errors) = started(&store, fast_config()).await;
    let stale: Vec<RawTask> = vec![store.get(&id("1")).unwrap(), store.get(&id("2")).unwrap()];

    store.pause_writes();
    sync.request_move(&id("1"), CanonicalStatus::InProgress).unwrap();

    let mut rx = sync.watch_board();
    rx.borrow_and_update();
    store.push_snapshot(&alice(), stale.clone());
    store.push_snapshot(&alice(), stale);
    tokio::time::timeout(WAIT, rx.changed()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let view = sync.board();
    assert_eq!(view.board.ids(CanonicalStatus::InProgress), ["1"]);
    assert!(view.board.ids(CanonicalStatus::Todo).is_empty());
    assert_eq!(sync.in_flight_count(), 1);
}

#[tokio::test]
async fn snapshot_reporting_intent_settles_move() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.pause_writes();
    let handle = sync
        .request_move(&id("1"), CanonicalStatus::Done)
        .unwrap()
        .handle()
        .cloned()
        .unwrap();

    // Another client already moved it to done.
    store.insert(task_doc("1", "alice", "completed", "2024-01-01T00:00:00Z"));
    eventually(|| sync.in_flight_count() == 0).await;
    assert!(matches!(
        sync.mutation_state(&handle),
        Some(MutationState::Settled) | None
    ));
    let (status, shown) = entry(&sync, "1").unwrap();
    assert_eq!(status, CanonicalStatus::Done);
    assert!(!shown.optimistic);

    // The late write result changes nothing.
    store.resume_writes();
    assert_no_error(&mut errors).await;
    assert_eq!(sync.board().board.ids(CanonicalStatus::Done), ["2", "1"]);
}

#[tokio::test]
async fn last_intent_wins_over_late_first_write() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.pause_writes();
    let first = sync
        .request_move(&id("1"), CanonicalStatus::InProgress)
        .unwrap()
        .handle()
        .cloned()
        .unwrap();
    let second = sync
        .request_move(&id("1"), CanonicalStatus::Done)
        .unwrap()
        .handle()
        .cloned()
        .unwrap();
    assert_eq!(sync.mutation_state(&first), Some(MutationState::Superseded));
    assert_eq!(sync.board().board.ids(CanonicalStatus::Done), ["2", "1"]);

    // The superseded write lands first and echoes `in_progress`.
    assert!(store.wait_for_held_writes(2, WAIT).await);
    assert!(store.release_write(0, None));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let view = sync.board();
    assert!(view.board.ids(CanonicalStatus::InProgress).is_empty());
    assert_eq!(view.board.ids(CanonicalStatus::Done), ["2", "1"]);
    assert_eq!(sync.mutation_state(&second), Some(MutationState::InFlight));

    assert!(store.release_write(0, None));
    eventually(|| sync.in_flight_count() == 0).await;
    assert_eq!(sync.board().board.ids(CanonicalStatus::Done), ["2", "1"]);
    assert_no_error(&mut errors).await;
}

#[tokio::test]
async fn failure_of_superseded_move_is_silent() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.pause_writes();
    sync.request_move(&id("1"), CanonicalStatus::InProgress).unwrap();
    sync.request_move(&id("1"), CanonicalStatus::Done).unwrap();
    assert!(store.wait_for_held_writes(2, WAIT).await);

    assert!(store.release_write(0, Some(StoreError::Unavailable("offline".into()))));
    assert_no_error(&mut errors).await;
    assert_eq!(sync.board().board.ids(CanonicalStatus::Done), ["2", "1"]);

    store.resume_writes();
    eventually(|| sync.in_flight_count() == 0).await;
}

#[tokio::test]
async fn moves_on_different_tasks_are_independent() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.pause_writes();
    sync.request_move(&id("1"), CanonicalStatus::InProgress).unwrap();
    sync.request_move(&id("2"), CanonicalStatus::InProgress).unwrap();
    assert!(store.wait_for_held_writes(2, WAIT).await);

    // Fail the second task's write only.
    let index = store
        .held_writes()
        .iter()
        .position(|t| *t == id("2"))
        .unwrap();
    assert!(store.release_write(index, Some(StoreError::Other("rejected".into()))));
    let err = next_error(&mut errors).await;
    assert_eq!(err.task_id, Some(id("2")));

    let view = wait_for_view(&sync, |v| v.board.ids(CanonicalStatus::Done) == ["2"]).await;
    assert_eq!(view.board.ids(CanonicalStatus::InProgress), ["1"]);
    store.resume_writes();
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_move_rolls_back_and_reports_retryable_error() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;
    let before = sync.board().board.clone();

    store.fail_next_write(StoreError::Unavailable("offline".into()));
    let handle = sync
        .request_move(&id("1"), CanonicalStatus::Done)
        .unwrap()
        .handle()
        .cloned()
        .unwrap();

    let err = next_error(&mut errors).await;
    assert_eq!(err.task_id, Some(id("1")));
    assert_eq!(err.kind, BoardErrorKind::Move);
    assert!(err.retryable);

    let view = wait_for_view(&sync, |v| v.board.ids(CanonicalStatus::Todo) == ["1"]).await;
    assert_eq!(view.board, before);
    assert!(matches!(
        sync.mutation_state(&handle),
        Some(MutationState::Failed) | None
    ));
    assert_eq!(store.get(&id("1")).unwrap().get("status"), Some(&json!("YAPILACAK")));
}

#[tokio::test]
async fn permission_failure_is_not_retryable() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.fail_next_write(StoreError::PermissionDenied("read-only".into()));
    sync.request_move(&id("2"), CanonicalStatus::Todo).unwrap();

    let err = next_error(&mut errors).await;
    assert!(!err.retryable);
    wait_for_view(&sync, |v| v.board.ids(CanonicalStatus::Done) == ["2"]).await;
}

// ---------------------------------------------------------------------------
// Edits and deletes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn edit_shows_immediately_and_persists() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.pause_writes();
    let outcome = sync.request_edit(&id("2"), title_edit("ship it")).unwrap();
    assert!(matches!(outcome, RequestOutcome::Issued(_)));
    let (_, shown) = entry(&sync, "2").unwrap();
    assert_eq!(shown.task.title, "ship it");
    assert!(shown.optimistic);

    store.resume_writes();
    eventually(|| sync.in_flight_count() == 0).await;
    assert_eq!(store.get(&id("2")).unwrap().get("title"), Some(&json!("ship it")));
    let (_, shown) = entry(&sync, "2").unwrap();
    assert_eq!(shown.task.title, "ship it");
    assert_no_error(&mut errors).await;
}

#[tokio::test]
async fn renaming_back_survives_stale_snapshot() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;
    let stale = vec![store.get(&id("1")).unwrap(), store.get(&id("2")).unwrap()];

    store.pause_writes();
    sync.request_edit(&id("1"), title_edit("draft")).unwrap();
    sync.request_edit(&id("1"), title_edit("task 1")).unwrap();

    // The stale snapshot already carries the final title.
    let mut rx = sync.watch_board();
    rx.borrow_and_update();
    store.push_snapshot(&alice(), stale);
    tokio::time::timeout(WAIT, rx.changed()).await.unwrap().unwrap();
    let (_, shown) = entry(&sync, "1").unwrap();
    assert_eq!(shown.task.title, "task 1");
    assert_eq!(sync.in_flight_count(), 2);

    store.resume_writes();
    eventually(|| sync.in_flight_count() == 0).await;
    assert_eq!(store.get(&id("1")).unwrap().get("title"), Some(&json!("task 1")));
    let (_, shown) = entry(&sync, "1").unwrap();
    assert_eq!(shown.task.title, "task 1");
    assert_no_error(&mut errors).await;
}

#[tokio::test]
async fn failed_edit_restores_title() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.fail_next_write(StoreError::Other("validation failed".into()));
    sync.request_edit(&id("1"), title_edit("renamed")).unwrap();

    let err = next_error(&mut errors).await;
    assert_eq!(err.kind, BoardErrorKind::Edit);
    let view = wait_for_view(&sync, |v| {
        v.board
            .find(&id("1"))
            .is_some_and(|(_, _, e)| e.task.title == "task 1")
    })
    .await;
    assert_eq!(view.board.len(), 2);
}

#[tokio::test]
async fn delete_hides_task_until_store_confirms() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.pause_writes();
    sync.request_delete(&id("2")).unwrap();
    assert!(!sync.board().board.contains(&id("2")));

    store.resume_writes();
    eventually(|| sync.in_flight_count() == 0).await;
    assert!(store.get(&id("2")).is_none());
    assert!(!sync.board().board.contains(&id("2")));
    assert_no_error(&mut errors).await;
}

#[tokio::test]
async fn failed_delete_brings_task_back() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.fail_next_write(StoreError::Unavailable("offline".into()));
    sync.request_delete(&id("2")).unwrap();

    let err = next_error(&mut errors).await;
    assert_eq!(err.kind, BoardErrorKind::Delete);
    wait_for_view(&sync, |v| v.board.contains(&id("2"))).await;
}

#[tokio::test]
async fn remotely_deleted_task_disappears_despite_pending_move() {
    let store = scenario_store();
    let (sync, _errors) = started(&store, fast_config()).await;

    store.pause_writes();
    sync.request_move(&id("1"), CanonicalStatus::Done).unwrap();
    store.push_snapshot(&alice(), vec![store.get(&id("2")).unwrap()]);
    let view = wait_for_view(&sync, |v| !v.board.contains(&id("1"))).await;
    assert_eq!(view.board.ids(CanonicalStatus::Done), ["2"]);
    store.resume_writes();
}

// ---------------------------------------------------------------------------
// Snapshot hygiene
// ---------------------------------------------------------------------------

#[tokio::test]
async fn foreign_and_broken_records_are_dropped() {
    let store = scenario_store();
    let (sync, _errors) = started(&store, fast_config()).await;

    store.push_snapshot(
        &alice(),
        vec![
            store.get(&id("1")).unwrap(),
            task_doc("b1", "bob", "todo", "2024-02-01T00:00:00Z"),
            raw(json!({"ownerId": "alice", "status": "todo"})),
        ],
    );
    let view = wait_for_view(&sync, |v| v.board.len() == 1).await;
    assert_eq!(view.board.ids(CanonicalStatus::Todo), ["1"]);
}

// ---------------------------------------------------------------------------
// Subscription health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_subscription_error_marks_board_stale() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.push_error(&alice(), StoreError::Other("index missing".into()));
    let err = next_error(&mut errors).await;
    assert_eq!(
        err.kind,
        BoardErrorKind::Subscription(SubscriptionErrorKind::Unknown)
    );
    assert!(err.task_id.is_none());
    assert!(!err.retryable);

    let view = wait_for_view(&sync, |v| v.health == SyncHealth::Stale).await;
    assert_eq!(view.board.len(), 2);
}

#[tokio::test]
async fn unavailable_subscription_recovers() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.push_error(&alice(), StoreError::Unavailable("network down".into()));
    let err = next_error(&mut errors).await;
    assert_eq!(
        err.kind,
        BoardErrorKind::Subscription(SubscriptionErrorKind::Unavailable)
    );
    assert!(err.retryable);

    let view = wait_for_view(&sync, |v| v.health == SyncHealth::Live).await;
    assert_eq!(view.board.len(), 2);
}

#[tokio::test]
async fn denied_identity_shows_denied_board() {
    let store = scenario_store();
    store.deny(&alice());
    let (sync, mut errors) = BoardSync::new(store.clone(), fast_config());
    sync.start(Some(alice()));

    let err = next_error(&mut errors).await;
    assert_eq!(
        err.kind,
        BoardErrorKind::Subscription(SubscriptionErrorKind::Permission)
    );
    let view = wait_for_view(&sync, |v| v.health == SyncHealth::Denied).await;
    assert!(view.board.is_empty());
}

// ---------------------------------------------------------------------------
// Teardown and identity changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_drops_pending_mutations_and_ignores_late_results() {
    let store = scenario_store();
    let (sync, mut errors) = started(&store, fast_config()).await;

    store.pause_writes();
    let handle = sync
        .request_move(&id("1"), CanonicalStatus::Done)
        .unwrap()
        .handle()
        .cloned()
        .unwrap();
    assert!(store.wait_for_held_writes(1, WAIT).await);

    sync.shutdown();
    let view = sync.board();
    assert!(view.board.is_empty());
    assert_eq!(view.health, SyncHealth::Idle);
    assert_eq!(sync.mutation_state(&handle), None);
    assert_eq!(sync.in_flight_count(), 0);

    assert!(store.release_write(0, Some(StoreError::Unavailable("late".into()))));
    assert_no_error(&mut errors).await;
    assert!(sync.board().board.is_empty());
    assert_eq!(store.subscriber_count(&alice()), 0);
}

#[tokio::test]
async fn identity_switch_never_shows_previous_tasks() {
    let store = scenario_store();
    store.insert(task_doc("b1", "bob", "doing", "2024-03-01T00:00:00Z"));
    let (sync, _errors) = started(&store, fast_config()).await;
    assert_eq!(sync.board().board.len(), 2);

    sync.start(Some(OwnerId::new("bob")));
    assert!(sync.board().board.is_empty());
    assert_eq!(sync.board().health, SyncHealth::Connecting);

    let view = wait_for_view(&sync, |v| v.health == SyncHealth::Live).await;
    assert_eq!(view.board.ids(CanonicalStatus::InProgress), ["b1"]);
    assert_eq!(view.board.len(), 1);

    // Writes for alice no longer reach this board.
    store.insert(task_doc("3", "alice", "todo", "2024-04-01T00:00:00Z"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sync.board().board.contains(&id("3")));
    assert_eq!(sync.identity(), Some(OwnerId::new("bob")));
}

#[tokio::test]
async fn restarting_same_identity_keeps_pending_moves() {
    let store = scenario_store();
    let (sync, _errors) = started(&store, fast_config()).await;

    store.pause_writes();
    sync.request_move(&id("1"), CanonicalStatus::Done).unwrap();
    sync.start(Some(alice()));
    assert_eq!(sync.in_flight_count(), 1);
    assert_eq!(sync.board().board.ids(CanonicalStatus::Done), ["2", "1"]);
    store.resume_writes();
    eventually(|| sync.in_flight_count() == 0).await;
}

#[tokio::test]
async fn no_identity_yields_empty_idle_board() {
    let store = scenario_store();
    let (sync, _errors) = BoardSync::new(store.clone(), fast_config());
    sync.start(None);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let view = sync.board();
    assert!(view.board.is_empty());
    assert_eq!(view.health, SyncHealth::Idle);
    assert_eq!(store.subscriber_count(&alice()), 0);
}
