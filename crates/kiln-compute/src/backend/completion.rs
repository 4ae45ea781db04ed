//! Completion-handler thread pool.
//!
//! Offloaded command-buffer completions are queued here and run on a fixed
//! set of worker threads. Workers wait on a condvar with a timeout so they
//! notice shutdown, and drain everything they can pop before waiting again.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::{ComputeError, ComputeResult};

/// Number of completion worker threads.
pub const COMPLETION_THREADS: usize = 8;
/// Worker condvar timeout.
pub const COMPLETION_WAIT: Duration = Duration::from_millis(500);

/// A unit of completion work.
pub type CompletionTask = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<CompletionTask>,
    /// Queued plus running.
    outstanding: usize,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    work: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed pool of completion-handler threads.
///
/// Dropping the pool requests shutdown, wakes every worker and joins them.
/// Tasks still queued at that point run before the workers exit.
pub struct CompletionPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompletionPool {
    /// Starts [`COMPLETION_THREADS`] workers.
    pub fn new() -> ComputeResult<Self> {
        Self::with_threads(COMPLETION_THREADS)
    }

    pub fn with_threads(count: usize) -> ComputeResult<Self> {
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(count);
        for index in 0..count.max(1) {
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("kiln-completion-{index}"))
                .spawn(move || worker_loop(&shared))
                .map_err(|e| ComputeError::OperationFailed(format!("cannot spawn completion thread: {e}")))?;
            workers.push(worker);
        }
        debug!(threads = workers.len(), "completion pool started");
        Ok(Self { shared, workers: Mutex::new(workers) })
    }

    /// Queues `task`. After shutdown the task runs inline.
    pub fn push(&self, task: CompletionTask) {
        {
            let mut queue = self.shared.lock();
            if !queue.shutdown {
                queue.tasks.push_back(task);
                queue.outstanding += 1;
                drop(queue);
                self.shared.work.notify_one();
                return;
            }
        }
        task();
    }

    /// Tasks queued or running.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }

    /// Blocks until every queued task finished. `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let queue = self.shared.lock();
        let (queue, _) = self
            .shared
            .idle
            .wait_timeout_while(queue, timeout, |q| q.outstanding > 0)
            .unwrap_or_else(|e| e.into_inner());
        queue.outstanding == 0
    }

    /// Stops and joins every worker. Idempotent.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.work.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if worker.join().is_err() {
                error!("completion thread panicked");
            }
        }
    }
}

impl Drop for CompletionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    let mut queue = shared.lock();
    loop {
        while let Some(task) = queue.tasks.pop_front() {
            drop(queue);
            task();
            queue = shared.lock();
            queue.outstanding -= 1;
            if queue.outstanding == 0 {
                shared.idle.notify_all();
            }
        }
        if queue.shutdown {
            return;
        }
        queue = shared
            .work
            .wait_timeout(queue, COMPLETION_WAIT)
            .map(|(q, _)| q)
            .unwrap_or_else(|e| e.into_inner().0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_every_task() {
        let pool = CompletionPool::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = Arc::clone(&count);
            pool.push(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.wait_idle(Duration::from_secs(10)));
        assert_eq!(count.load(Ordering::SeqCst), 100);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_shutdown_then_inline() {
        let pool = CompletionPool::with_threads(2).unwrap();
        pool.shutdown();
        pool.shutdown();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        pool.push(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
