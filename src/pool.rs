//! Worker Pool for Promise Thunks
//!
//! The one pool an execution boundary owns. Resolution batches submit the
//! independent siblings of a requested promise here, and promises with a
//! deadline run here so their caller can stop waiting.
//!
//! Uses a fixed set of worker threads sharing one mpsc queue. Jobs report
//! their results through the promise they settle, not through the pool.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use thiserror::Error;

/// A unit of work for the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool has shut down")]
    ShutDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Message sent to worker threads
enum WorkerMessage {
    Job(Job),
    Shutdown,
}

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True on a thread owned by any worker pool. Resolution on a worker never
/// starts a new batch.
pub fn on_worker_thread() -> bool {
    ON_WORKER.with(Cell::get)
}

pub struct WorkerPool {
    sender: Mutex<Option<Sender<WorkerMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    worker_count: usize,
}

impl WorkerPool {
    /// Create a pool with one worker per CPU core
    pub fn new() -> Result<Self, PoolError> {
        Self::with_workers(num_cpus::get(), "latent-worker")
    }

    /// Create a pool with a specific number of workers
    pub fn with_workers(count: usize, name_prefix: &str) -> Result<Self, PoolError> {
        let count = count.max(1); // At least one worker

        let (sender, receiver) = mpsc::channel::<WorkerMessage>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name_prefix, id))
                .spawn(move || worker_loop(receiver))
                .map_err(|e: io::Error| PoolError::Spawn(e.to_string()))?;
            workers.push(handle);
        }
        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();

        tracing::debug!(workers = count, prefix = name_prefix, "worker pool started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_ids,
            worker_count: count,
        })
    }

    /// Queue a job. Fails once the pool has shut down.
    pub fn submit(&self, job: Job) -> Result<(), PoolError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(PoolError::ShutDown);
        };
        sender
            .send(WorkerMessage::Job(job))
            .map_err(|_| PoolError::ShutDown)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs and let queued ones drain. Waits for the workers
    /// unless called from one of them.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        for _ in 0..self.worker_count {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        drop(sender);

        let here = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        if self.worker_ids.contains(&here) {
            tracing::debug!("worker pool released from one of its own workers; not joining");
            return;
        }
        for worker in workers {
            let _ = worker.join();
        }
        tracing::debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Worker thread main loop
fn worker_loop(receiver: Arc<Mutex<Receiver<WorkerMessage>>>) {
    ON_WORKER.with(|flag| flag.set(true));
    loop {
        let message = {
            let lock = receiver.lock();
            lock.recv()
        };

        match message {
            Ok(WorkerMessage::Job(job)) => {
                // Promise jobs settle their own outcome; a panic here means
                // the promise was already failed by the boundary
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!("pool job panicked");
                }
            }
            Ok(WorkerMessage::Shutdown) | Err(_) => break,
        }
    }
}
