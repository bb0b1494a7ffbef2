//! Fill worker pool for parallel job execution.
//!
//! Workers run on separate threads, pulling jobs from a shared [`JobQueue`]
//! and executing them. There is no cancellation: once queued, a job runs,
//! and shutdown drains the queue before the workers exit.

use crate::{JobQueue, SchedulerError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration for the fill worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time a worker will wait for a job before checking shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,

    /// Prefix of worker thread names
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(num_cpus())
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration; 0 workers means one per core.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: if num_workers == 0 { num_cpus() } else { num_workers },
            poll_interval: Duration::from_millis(100),
            thread_name: "demand-fill-worker".to_string(),
        }
    }

    /// Set the poll interval for workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Worker pool executing jobs from a [`JobQueue`].
///
/// # Example
///
/// ```
/// use demand_loading_scheduler::{JobPriority, JobQueue, WorkerPool, WorkerPoolConfig};
/// use std::sync::mpsc;
/// use std::sync::Arc;
///
/// let queue = Arc::new(JobQueue::new());
/// let pool = WorkerPool::new(queue.clone(), WorkerPoolConfig::new(2)).unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// queue.push(JobPriority::Normal, move || tx.send(42).unwrap());
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<Worker>,
    queue: Arc<JobQueue>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Create and start a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Spawn`] if a worker thread cannot be
    /// created; workers already started are stopped again.
    pub fn new(queue: Arc<JobQueue>, config: WorkerPoolConfig) -> Result<Self, SchedulerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            workers: Vec::with_capacity(config.num_workers),
            queue: queue.clone(),
            shutdown: shutdown.clone(),
        };

        for id in 0..config.num_workers {
            let worker = Worker::new(
                format!("{}-{}", config.thread_name, id),
                queue.clone(),
                shutdown.clone(),
                config.poll_interval,
            )?;
            pool.workers.push(worker);
        }

        Ok(pool)
    }

    /// Get the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Check if the worker pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Shutdown the worker pool gracefully.
    ///
    /// Workers finish every queued job, then exit. Blocks until all workers
    /// have terminated.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.notify_all();
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A single worker thread in the worker pool.
struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(
        name: String,
        queue: Arc<JobQueue>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Result<Self, SchedulerError> {
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || Self::run(queue, shutdown, poll_interval))?;

        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Main worker loop.
    ///
    /// A panicking job is logged and does not take the worker down.
    fn run(queue: Arc<JobQueue>, shutdown: Arc<AtomicBool>, poll_interval: Duration) {
        loop {
            match queue.pop_timeout(poll_interval) {
                Some(job) => {
                    let job_id = job.id;
                    if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                        tracing::error!(job_id, "fill job panicked");
                    }
                }
                None => {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("fill worker thread panicked");
            }
        }
    }
}

/// Get the number of logical CPU cores.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
