//! Task scheduling for the Loam object store.
//!
//! Every mutable entity in Loam (object, chunk, database, root) owns a
//! [`SerialQueue`]: a strictly-ordered task queue that serializes all
//! mutation of that entity's private state without blocking callers. Queues
//! belonging to different entities drain concurrently on one shared worker
//! pool.
//!
//! All work submitted through this crate is tracked by a process-wide
//! [`TaskGroup`]; [`wait_for_completion`] blocks until every outstanding
//! task has finished, including tasks scheduled by other tasks such as
//! deferred teardown. Destructive teardown (unmapping chunks, closing
//! files) runs as a background task after an entity's retain count reaches
//! zero, so callers must drain the group before assuming OS resources are
//! released.

pub mod group;
pub mod pool;
pub mod queue;

pub use group::{completion_group, wait_for_completion, TaskGroup, TaskTicket};
pub use pool::spawn_tracked;
pub use queue::SerialQueue;
