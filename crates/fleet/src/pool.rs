//! Bounded-concurrency task pool.
//!
//! Tasks are lightweight tokio tasks, not threads. An engine process drives
//! its pool from a current-thread runtime, so every task shares one OS
//! thread and only switches at `.await` points. A task that never awaits
//! starves its siblings.
//!
//! Counts are advisory. [`TaskPool::count`] is read without coordination
//! with concurrent spawns and callers must tolerate slight staleness.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Cheaply cloneable handle to a set of concurrently running tasks.
#[derive(Clone)]
pub struct TaskPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    size: usize,
    permits: Semaphore,
    scheduled: AtomicUsize,
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, AbortHandle>>,
    closed: AtomicBool,
    idle: Notify,
}

/// Held by a running task. Dropping it (normal exit, error, panic or abort)
/// frees the slot.
struct Slot {
    shared: Arc<PoolShared>,
    id: u64,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.shared.handles.lock().remove(&self.id);
        if self.shared.scheduled.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}

impl TaskPool {
    /// Create a pool that runs at most `size` tasks at once.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            shared: Arc::new(PoolShared {
                size,
                permits: Semaphore::new(size),
                scheduled: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                handles: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Schedule `task` and return immediately.
    ///
    /// Tasks beyond `size` are accepted and wait for a free slot. Errors and
    /// panics stop at the task boundary and are logged. Returns `false`, and
    /// drops the task, if the pool has been closed.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            debug!("pool closed, dropping task");
            return false;
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.scheduled.fetch_add(1, Ordering::AcqRel);
        let slot = Slot {
            shared: Arc::clone(&self.shared),
            id,
        };

        let join = tokio::spawn(async move {
            let slot = slot;
            let Ok(_permit) = slot.shared.permits.acquire().await else {
                return;
            };
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = slot.id, error = %format!("{e:#}"), "task failed"),
                Err(panic) => {
                    warn!(task = slot.id, panic = %panic_message(panic.as_ref()), "task panicked")
                }
            }
        });
        // A task that already dropped its slot would leave a stale handle behind.
        let mut handles = self.shared.handles.lock();
        if !join.is_finished() {
            handles.insert(id, join.abort_handle());
        }
        true
    }

    /// Wait until every scheduled task, including ones spawned while waiting, has ended.
    pub async fn join(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.scheduled.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Abort every scheduled task and refuse new ones.
    ///
    /// Safe to call from inside one of the pool's own tasks; that task is
    /// cancelled at its next suspension point.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.permits.close();
        let handles: Vec<AbortHandle> = self.shared.handles.lock().drain().map(|(_, h)| h).collect();
        debug!(tasks = handles.len(), "aborting pool tasks");
        for handle in handles {
            handle.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tasks scheduled and not yet finished, whether running or waiting for a slot.
    pub fn count(&self) -> usize {
        self.shared.scheduled.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.shared.size.saturating_sub(self.count())
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.size())
            .field("count", &self.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn join_waits_for_all_tasks() {
        let pool = TaskPool::new(4);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..6u64 {
            let done = Arc::clone(&done);
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5 * i)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(pool.count(), 6);
        pool.join().await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.free_count(), 4);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_size() {
        let pool = TaskPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        // Over-admitted tasks are accepted, free_count floors at zero.
        assert_eq!(pool.free_count(), 0);
        pool.join().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_and_panics_stay_inside_the_task() {
        let pool = TaskPool::new(3);
        let survivor = Arc::new(AtomicBool::new(false));
        pool.spawn(async { Err(anyhow::anyhow!("bad input")) });
        pool.spawn(async { panic!("task blew up") });
        let flag = Arc::clone(&survivor);
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        pool.join().await;
        assert!(survivor.load(Ordering::SeqCst));
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn tasks_spawned_by_tasks_are_joined() {
        let pool = TaskPool::new(4);
        let done = Arc::new(AtomicBool::new(false));
        let inner_pool = pool.clone();
        let flag = Arc::clone(&done);
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            inner_pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });
        pool.join().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_aborts_everything_including_the_caller() {
        let pool = TaskPool::new(4);
        for _ in 0..2 {
            pool.spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            });
        }
        let closer = pool.clone();
        pool.spawn(async move {
            closer.close();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .expect("pool should drain after close");
        assert!(pool.is_closed());
        assert!(!pool.spawn(async { Ok(()) }));
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }
}
