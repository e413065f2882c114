//! Integration tests for drag-and-drop gestures driving the board engine.
//!
//! A drop into another column must show the card there immediately, persist
//! the move, and snap the card back to where it was picked up if the store
//! rejects the write.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use boardsync::board::{
    BoardError, BoardSync, BoardView, DragDropController, DragState, DropOutcome, DropTarget,
    InvalidDrop, SyncConfig, SyncError, SyncHealth,
};
use boardsync::store::StoreError;
use boardsync::store::memory::InMemoryStore;
use boardsync_proto::{CanonicalStatus, OwnerId, RawTask, TaskId};
use serde_json::json;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(2);

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

/// Store with three todo cards (newest first: a, b, c) and one done card.
fn seeded_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    for (task, status, created) in [
        ("a", "todo", "2024-05-03T00:00:00Z"),
        ("b", "todo", "2024-05-02T00:00:00Z"),
        ("c", "To Do", "2024-05-01T00:00:00Z"),
        ("d", "done", "2024-04-01T00:00:00Z"),
    ] {
        store.insert(
            RawTask::from_value(json!({
                "id": task,
                "ownerId": "alice",
                "title": task.to_uppercase(),
                "status": status,
                "createdAt": created,
            }))
            .unwrap(),
        );
    }
    store
}

async fn live_controller(
    store: &InMemoryStore,
) -> (
    DragDropController<InMemoryStore>,
    BoardSync<InMemoryStore>,
    mpsc::Receiver<BoardError>,
) {
    let (sync, errors) = BoardSync::new(store.clone(), SyncConfig::default());
    sync.start(Some(OwnerId::new("alice")));
    wait_for_view(&sync, |v| v.health == SyncHealth::Live).await;
    (DragDropController::new(sync.clone()), sync, errors)
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

const fn target(column: CanonicalStatus, index: usize) -> Option<DropTarget> {
    Some(DropTarget { column, index })
}

// ---------------------------------------------------------------------------
// Cross-column drops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drop_into_other_column_persists() {
    let store = seeded_store();
    let (mut drag, sync, _errors) = live_controller(&store).await;
    assert_eq!(sync.board().board.ids(CanonicalStatus::Todo), ["a", "b", "c"]);

    store.pause_writes();
    drag.begin(&id("b")).unwrap();
    let outcome = drag
        .drop_at(target(CanonicalStatus::InProgress, 0))
        .unwrap();
    assert!(matches!(outcome, DropOutcome::Moved(_)));
    assert_eq!(drag.state(), &DragState::Idle);

    let view = sync.board();
    assert_eq!(view.board.ids(CanonicalStatus::Todo), ["a", "c"]);
    assert_eq!(view.board.ids(CanonicalStatus::InProgress), ["b"]);

    store.resume_writes();
    wait_for_view(&sync, |v| v.board.iter().all(|e| !e.optimistic)).await;
    assert_eq!(
        store.get(&id("b")).unwrap().get("status"),
        Some(&json!("in_progress"))
    );
}

#[tokio::test]
async fn rejected_drop_snaps_back_to_origin() {
    let store = seeded_store();
    let (mut drag, sync, mut errors) = live_controller(&store).await;
    let before = sync.board().board.clone();

    store.fail_next_write(StoreError::PermissionDenied("board is read-only".into()));
    drag.begin(&id("b")).unwrap();
    drag.drop_at(target(CanonicalStatus::Done, 1)).unwrap();

    let err = tokio::time::timeout(WAIT, errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(err.task_id, Some(id("b")));
    assert!(!err.retryable);

    let view = wait_for_view(&sync, |v| v.board.ids(CanonicalStatus::Done) == ["d"]).await;
    assert_eq!(view.board, before);
    assert_eq!(view.board.ids(CanonicalStatus::Todo), ["a", "b", "c"]);
}

#[tokio::test]
async fn dragging_back_while_in_flight_keeps_last_intent() {
    let store = seeded_store();
    let (mut drag, sync, _errors) = live_controller(&store).await;

    store.pause_writes();
    drag.begin(&id("a")).unwrap();
    drag.drop_at(target(CanonicalStatus::Done, 0)).unwrap();
    drag.begin(&id("a")).unwrap();
    drag.drop_at(target(CanonicalStatus::Todo, 0)).unwrap();
    assert_eq!(sync.board().board.ids(CanonicalStatus::Todo), ["a", "b", "c"]);

    store.resume_writes();
    let view = wait_for_view(&sync, |v| v.board.iter().all(|e| !e.optimistic)).await;
    assert_eq!(view.board.ids(CanonicalStatus::Todo), ["a", "b", "c"]);
    assert_eq!(view.board.ids(CanonicalStatus::Done), ["d"]);
    assert_eq!(store.get(&id("a")).unwrap().get("status"), Some(&json!("todo")));
}

#[tokio::test]
async fn drop_on_origin_after_remote_move_moves_card_back() {
    let store = seeded_store();
    let (mut drag, sync, _errors) = live_controller(&store).await;

    drag.begin(&id("b")).unwrap();

    // Another client finishes the card while it is being dragged.
    store.insert(
        RawTask::from_value(json!({
            "id": "b",
            "ownerId": "alice",
            "title": "B",
            "status": "done",
            "createdAt": "2024-05-02T00:00:00Z",
        }))
        .unwrap(),
    );
    wait_for_view(&sync, |v| v.board.ids(CanonicalStatus::Done).contains(&"b")).await;

    let outcome = drag.drop_at(target(CanonicalStatus::Todo, 5)).unwrap();
    assert!(matches!(outcome, DropOutcome::Moved(_)));
    assert_eq!(sync.board().board.ids(CanonicalStatus::Todo), ["a", "b", "c"]);

    wait_for_view(&sync, |v| v.board.iter().all(|e| !e.optimistic)).await;
    assert_eq!(store.get(&id("b")).unwrap().get("status"), Some(&json!("todo")));
    assert_eq!(sync.board().board.ids(CanonicalStatus::Done), ["d"]);
}

// ---------------------------------------------------------------------------
// Same-column and invalid drops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reorder_within_column_writes_nothing() {
    let store = seeded_store();
    let (mut drag, sync, _errors) = live_controller(&store).await;
    let revision = store.current_revision();

    drag.begin(&id("a")).unwrap();
    let outcome = drag.drop_at(target(CanonicalStatus::Todo, 2)).unwrap();
    assert_eq!(outcome, DropOutcome::Reordered);
    assert_eq!(sync.in_flight_count(), 0);
    assert_eq!(store.current_revision(), revision);
    assert_eq!(sync.board().board.ids(CanonicalStatus::Todo), ["a", "b", "c"]);
}

#[tokio::test]
async fn drop_outside_columns_and_cancel_change_nothing() {
    let store = seeded_store();
    let (mut drag, sync, _errors) = live_controller(&store).await;

    drag.begin(&id("c")).unwrap();
    assert_eq!(
        drag.drop_at(None).unwrap(),
        DropOutcome::Invalid(InvalidDrop::NoColumn)
    );

    drag.begin(&id("c")).unwrap();
    assert_eq!(
        drag.drop_at(target(CanonicalStatus::Todo, 2)).unwrap(),
        DropOutcome::Invalid(InvalidDrop::SamePosition)
    );

    drag.begin(&id("c")).unwrap();
    assert!(drag.cancel());
    assert!(!drag.cancel());
    assert_eq!(sync.in_flight_count(), 0);
}

#[tokio::test]
async fn card_removed_mid_drag_cannot_be_dropped() {
    let store = seeded_store();
    let (mut drag, sync, _errors) = live_controller(&store).await;

    drag.begin(&id("d")).unwrap();
    let remaining: Vec<RawTask> = ["a", "b", "c"]
        .iter()
        .map(|t| store.get(&id(t)).unwrap())
        .collect();
    store.push_snapshot(&OwnerId::new("alice"), remaining);
    wait_for_view(&sync, |v| !v.board.contains(&id("d"))).await;

    let result = drag.drop_at(target(CanonicalStatus::Todo, 0));
    assert_eq!(result, Err(SyncError::TaskNotFound(id("d"))));
    assert_eq!(drag.state(), &DragState::Idle);
}
