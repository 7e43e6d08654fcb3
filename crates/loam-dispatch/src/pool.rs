use std::sync::OnceLock;

use tokio::runtime::Runtime;

use crate::group::completion_group;

/// The shared worker pool executing queue drains and background tasks.
///
/// Entities cannot exist without serialized mutation, so a failure to start
/// the pool is fatal for the process.
fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .thread_name("loam-dispatch")
            .build()
            .expect("could not start the dispatch worker pool")
    })
}

/// Run `task` on the shared worker pool.
pub(crate) fn spawn<F>(task: F)
where
    F: FnOnce() + Send + 'static,
{
    runtime().spawn_blocking(task);
}

/// Run a free-standing task on the shared worker pool, tracked by the
/// process-wide completion group.
///
/// Used for work that must happen after an entity's own queue has settled,
/// such as teardown once a retain count reaches zero.
pub fn spawn_tracked<F>(task: F)
where
    F: FnOnce() + Send + 'static,
{
    let ticket = completion_group().enter();
    spawn(move || {
        task();
        drop(ticket);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::wait_for_completion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tracked_spawn_is_observed_by_the_barrier() {
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let ran = Arc::clone(&ran);
            spawn_tracked(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for_completion();
        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn tracked_spawn_may_schedule_more_tracked_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            spawn_tracked(move || {
                let ran2 = Arc::clone(&ran);
                spawn_tracked(move || {
                    ran2.fetch_add(1, Ordering::SeqCst);
                });
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for_completion();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
