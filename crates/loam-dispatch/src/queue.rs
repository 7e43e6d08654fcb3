use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};

use tracing::error;

use crate::group::{completion_group, TaskTicket};
use crate::pool;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A strictly-ordered task queue owned by one entity.
///
/// Tasks enqueued on the same queue run one at a time, in submission order,
/// on the shared worker pool; tasks on different queues run concurrently.
/// The handle is cheap to clone and all clones feed the same queue.
///
/// Every task is tracked by the process-wide completion group, so
/// [`wait_for_completion`](crate::wait_for_completion) observes queue work
/// as well as free-standing background tasks.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    label: &'static str,
    pending: Mutex<Pending>,
}

struct Pending {
    tasks: VecDeque<(Task, TaskTicket)>,
    draining: bool,
}

impl SerialQueue {
    /// Create a new, idle queue. The label names the owning entity kind in
    /// log output.
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                label,
                pending: Mutex::new(Pending {
                    tasks: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Append a task and return immediately.
    ///
    /// The task runs after every previously enqueued task on this queue has
    /// finished. A task that panics is logged and skipped; the queue keeps
    /// draining.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let ticket = completion_group().enter();
        let mut pending = self
            .inner
            .pending
            .lock()
            .expect("serial queue lock poisoned");
        pending.tasks.push_back((Box::new(task), ticket));
        if !pending.draining {
            pending.draining = true;
            drop(pending);
            let inner = Arc::clone(&self.inner);
            pool::spawn(move || drain(inner));
        }
    }

    /// Append a task and block the caller until it completes, returning the
    /// task's result.
    ///
    /// This is the only blocking primitive; the wait is unbounded. It must
    /// not be called from a task already running on the same queue; doing
    /// so deadlocks, since the running task would wait for a successor that
    /// can only start after it returns.
    pub fn enqueue_sync<R, F>(&self, task: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.enqueue(move || {
            let _ = tx.send(task());
        });
        rx.recv().expect("serial queue dropped a synchronous task")
    }
}

/// Pop-and-run loop; at most one instance runs per queue at any time.
fn drain(inner: Arc<QueueInner>) {
    loop {
        let (task, ticket) = {
            let mut pending = inner.pending.lock().expect("serial queue lock poisoned");
            match pending.tasks.pop_front() {
                Some(entry) => entry,
                None => {
                    pending.draining = false;
                    return;
                }
            }
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(queue = inner.label, "queue task panicked; continuing");
        }
        drop(ticket);
    }
}
