//! `BoardSync`: optimistic Kanban board synchronization library.
//!
//! Keeps a locally authoritative board of tasks in three fixed columns while
//! a remote document store pushes full, possibly stale or out-of-order
//! snapshots. Local moves and edits apply instantly and are reconciled with
//! every incoming snapshot.

pub mod board;
pub mod config;
pub mod ledger;
pub mod ordering;
pub mod status;
pub mod store;
pub mod subscription;
