//! Priority-ordered job queue for background fills
//!
//! Jobs are executed in priority order, with FIFO ordering within each
//! priority level. Workers block on the queue with a timeout so they can
//! notice shutdown.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Job priority levels
///
/// Higher values are executed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum JobPriority {
    /// Fine-grained data that can wait (tiles)
    Low = 0,

    /// Default priority
    #[default]
    Normal = 1,

    /// Coarse data a launch cannot do without (samplers, mip tails)
    High = 2,
}

/// Unique job identifier
pub type JobId = u64;

type JobFn = Box<dyn FnOnce() + Send + 'static>;

/// A queued unit of background work.
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Job priority level
    pub priority: JobPriority,

    task: JobFn,

    /// Insertion order (used for FIFO within same priority)
    insertion_order: u64,
}

impl Job {
    /// Execute the job, consuming it
    pub fn run(self) {
        (self.task)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // BinaryHeap is a max heap: earlier insertions must compare greater
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other => other,
        }
    }
}

struct QueueState {
    heap: BinaryHeap<Job>,
    next_job_id: JobId,
    insertion_counter: u64,
}

/// Thread-safe priority job queue.
///
/// # Example
///
/// ```
/// use demand_loading_scheduler::{JobPriority, JobQueue};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let queue = JobQueue::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = hits.clone();
/// queue.push(JobPriority::High, move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// queue.pop().unwrap().run();
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_job_id: 1,
                insertion_counter: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Push a job onto the queue and wake one waiting worker.
    pub fn push<F>(&self, priority: JobPriority, task: F) -> JobId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next_job_id;
        state.next_job_id += 1;

        let insertion_order = state.insertion_counter;
        state.insertion_counter += 1;

        state.heap.push(Job {
            id,
            priority,
            task: Box::new(task),
            insertion_order,
        });
        drop(state);

        self.available.notify_one();
        id
    }

    /// Pop the highest priority job without waiting
    pub fn pop(&self) -> Option<Job> {
        self.state.lock().heap.pop()
    }

    /// Pop the highest priority job, waiting up to `timeout` for one to arrive
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        let mut state = self.state.lock();
        if state.heap.is_empty() {
            self.available.wait_for(&mut state, timeout);
        }
        state.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Wake every waiting worker (used at shutdown)
    pub fn notify_all(&self) {
        self.available.notify_all();
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
