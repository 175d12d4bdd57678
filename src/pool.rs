use crate::error::ServerResult;
use crate::task::Task;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    stop: AtomicBool,
}

/// Fixed set of worker threads draining one global FIFO under a mutex and a
/// condition variable. Submission never blocks; backpressure is applied
/// upstream by the connection cap and the parser's size limits.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> ServerResult<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || worker_loop(shared, i))?;
            workers.push(handle);
        }
        info!(workers = worker_count, "worker pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Push a task and wake one waiter. Tasks submitted after shutdown are
    /// dropped.
    pub fn submit(&self, task: Task) {
        if self.shared.stop.load(Ordering::Acquire) {
            warn!("task submitted after pool shutdown; dropping");
            return;
        }
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            queue.push_back(task);
        }
        self.shared.available.notify_one();
    }

    pub fn queued_len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Flip the stop flag, wake everyone, and join. Workers finish whatever
    /// is still queued before exiting. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.available.notify_all();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.stop.load(Ordering::Acquire) {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        match task {
            Some(task) => task.run(worker_id),
            None => break,
        }
    }
    debug!(worker = worker_id, "worker stopping");
}
