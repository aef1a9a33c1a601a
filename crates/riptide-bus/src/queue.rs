//! Task queue seam.
//!
//! The dispatch engine never runs subscriber callbacks itself — it enqueues
//! one task per delivery on a [`TaskQueue`] and returns. The queue contract
//! is deliberately small: tasks run at most once, eventually, possibly on
//! another thread.
//!
//! Two implementations ship with the crate:
//!
//! - [`InlineQueue`] runs the task on the calling thread, for tests and
//!   single-threaded embeddings.
//! - [`WorkerPool`] drains one FIFO queue from N worker threads. FIFO drain
//!   is what gives a subscriber the in-publish-order observation guarantee
//!   for its own deliveries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// One unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// The queue the dispatch engine hands delivery tasks to.
///
/// Implementations must run each task at most once, eventually, possibly on
/// another thread.
pub trait TaskQueue: Send + Sync {
    /// Accepts a task for later execution.
    fn enqueue(&self, task: Task);
}

// ---------------------------------------------------------------------------
// InlineQueue
// ---------------------------------------------------------------------------

/// Runs every task immediately on the enqueueing thread.
///
/// Publication and delivery are no longer decoupled in time, but the
/// dispatch path itself is unchanged — useful for deterministic tests and
/// single-threaded embeddings.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl TaskQueue for InlineQueue {
    fn enqueue(&self, task: Task) {
        task();
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Shared state between the pool handle and its workers.
struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    task_ready: Condvar,
    shutdown: AtomicBool,
}

/// A fixed-size worker pool draining one FIFO queue.
///
/// Dropping the pool signals shutdown, lets the workers drain every task
/// already enqueued, and joins them.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns the OS error if a worker thread cannot be spawned.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            task_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("riptide-worker-{i}"))
                .spawn(move || worker_loop(&shared))?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: handles,
        })
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                // Drain fully before honoring shutdown: enqueued tasks still
                // run exactly once.
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.task_ready.wait(&mut queue);
            }
        };
        task();
    }
}

impl TaskQueue for WorkerPool {
    fn enqueue(&self, task: Task) {
        self.shared.queue.lock().push_back(task);
        self.shared.task_ready.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.task_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("backlog", &self.backlog())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_for(count: &Arc<AtomicUsize>, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < expected {
            assert!(Instant::now() < deadline, "tasks did not finish in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_inline_queue_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        InlineQueue.enqueue(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_runs_every_task_once() {
        let pool = WorkerPool::new(4).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let r = Arc::clone(&ran);
            pool.enqueue(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }));
        }
        wait_for(&ran, 100);
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_single_worker_preserves_fifo_order() {
        let pool = WorkerPool::new(1).unwrap();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..50 {
            let seen = Arc::clone(&seen);
            let done = Arc::clone(&done);
            pool.enqueue(Box::new(move || {
                seen.lock().push(i);
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        wait_for(&done, 50);
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_pending_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2).unwrap();
            for _ in 0..20 {
                let r = Arc::clone(&ran);
                pool.enqueue(Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        // Pool joined: everything enqueued before drop has run.
        assert_eq!(ran.load(Ordering::SeqCst), 20);
    }
}
