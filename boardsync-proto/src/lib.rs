//! Shared task document model for `BoardSync`.

pub mod instant;
pub mod status;
pub mod task;

pub use instant::RawInstant;
pub use status::CanonicalStatus;
pub use task::{DecodeError, FieldMap, OwnerId, Priority, RawTask, Revision, Task, TaskId};
