use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// Counting completion barrier over a set of asynchronous tasks.
///
/// Every task submission calls [`enter`](TaskGroup::enter) and holds the
/// returned [`TaskTicket`] for the task's lifetime; dropping the ticket marks
/// the task complete. [`wait`](TaskGroup::wait) blocks until the outstanding
/// count is zero. Tasks scheduled from within tasks enter the group before
/// their parent's ticket is dropped, so the barrier is transitive.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    outstanding: Mutex<u64>,
    idle: Condvar,
}

impl TaskGroup {
    /// Create a new, empty group.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                outstanding: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Register one task. The task is complete when the ticket is dropped.
    pub fn enter(&self) -> TaskTicket {
        let mut count = self
            .inner
            .outstanding
            .lock()
            .expect("task group lock poisoned");
        *count += 1;
        TaskTicket {
            group: Arc::clone(&self.inner),
        }
    }

    /// Number of tasks currently outstanding.
    pub fn outstanding(&self) -> u64 {
        *self
            .inner
            .outstanding
            .lock()
            .expect("task group lock poisoned")
    }

    /// Block the calling thread until all outstanding tasks have finished.
    ///
    /// Returns immediately if the group is idle. The wait is unbounded.
    pub fn wait(&self) {
        let mut count = self
            .inner
            .outstanding
            .lock()
            .expect("task group lock poisoned");
        while *count > 0 {
            count = self
                .inner
                .idle
                .wait(count)
                .expect("task group lock poisoned");
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII marker for one outstanding task in a [`TaskGroup`].
pub struct TaskTicket {
    group: Arc<GroupInner>,
}

impl Drop for TaskTicket {
    fn drop(&mut self) {
        let mut count = self
            .group
            .outstanding
            .lock()
            .expect("task group lock poisoned");
        *count -= 1;
        if *count == 0 {
            self.group.idle.notify_all();
        }
    }
}

/// The process-wide group tracking all work submitted through this crate.
pub fn completion_group() -> &'static TaskGroup {
    static GROUP: OnceLock<TaskGroup> = OnceLock::new();
    GROUP.get_or_init(TaskGroup::new)
}

/// Block until every task submitted before this call has finished,
/// transitively: tasks scheduled by other tasks count as well.
pub fn wait_for_completion() {
    completion_group().wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_on_idle_group_returns_immediately() {
        let group = TaskGroup::new();
        group.wait();
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn ticket_drop_decrements() {
        let group = TaskGroup::new();
        let ticket = group.enter();
        assert_eq!(group.outstanding(), 1);
        drop(ticket);
        assert_eq!(group.outstanding(), 0);
    }

    #[test]
    fn wait_blocks_until_tickets_drop() {
        let group = TaskGroup::new();
        let ticket = group.enter();
        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(ticket);
        waiter.join().unwrap();
    }

    #[test]
    fn nested_enter_keeps_group_busy() {
        let group = TaskGroup::new();
        let outer = group.enter();
        let inner = group.enter();
        drop(outer);
        assert_eq!(group.outstanding(), 1);
        drop(inner);
        group.wait();
    }
}
