//! In-order asynchronous execution streams
//!
//! A [`Stream`] models a device command queue: operations enqueued on it run
//! one after another, in submission order, on a dedicated thread. Enqueueing
//! never blocks; callers that need a result wait on the returned
//! [`StreamEvent`].
//!
//! An operation that panics is treated as a device fault. The stream stops
//! executing, pending events report [`SchedulerError::StreamFailed`], and no
//! further work is accepted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::SchedulerError;

/// Process-unique stream identifier
pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type StreamOp = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for one enqueued operation.
#[derive(Debug)]
pub struct StreamEvent<T> {
    stream: StreamId,
    receiver: Receiver<T>,
}

impl<T> StreamEvent<T> {
    /// Block until the operation has executed and return its result.
    pub fn wait(self) -> Result<T, SchedulerError> {
        self.receiver
            .recv()
            .map_err(|_| SchedulerError::StreamFailed(self.stream))
    }

    /// Wait at most `timeout`; `Ok(None)` means the operation has not run yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, SchedulerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SchedulerError::StreamFailed(self.stream)),
        }
    }
}

/// In-order execution queue backed by its own thread.
///
/// # Example
///
/// ```
/// use demand_loading_scheduler::Stream;
///
/// let stream = Stream::new("copy").unwrap();
/// stream.enqueue(|| { /* upload */ }).unwrap();
/// let sum = stream.enqueue_with_result(|| 2 + 2).unwrap();
/// assert_eq!(sum.wait().unwrap(), 4);
/// stream.synchronize().unwrap();
/// ```
pub struct Stream {
    id: StreamId,
    sender: Mutex<Option<Sender<StreamOp>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    failed: Arc<AtomicBool>,
}

impl Stream {
    /// Create a stream and start its execution thread.
    pub fn new(name: &str) -> Result<Self, SchedulerError> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<StreamOp>();
        let failed = Arc::new(AtomicBool::new(false));

        let thread_failed = failed.clone();
        let thread = thread::Builder::new()
            .name(format!("{name}-stream-{id}"))
            .spawn(move || Self::run(id, receiver, thread_failed))?;

        Ok(Self {
            id,
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            failed,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Returns true once an operation has faulted
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Enqueue an operation without waiting for it.
    pub fn enqueue<F>(&self, op: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) if !self.is_failed() => sender
                .send(Box::new(op))
                .map_err(|_| SchedulerError::StreamFailed(self.id)),
            _ => Err(SchedulerError::StreamFailed(self.id)),
        }
    }

    /// Enqueue an operation and get an event carrying its result.
    pub fn enqueue_with_result<T, F>(&self, op: F) -> Result<StreamEvent<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.enqueue(move || {
            // The waiter may have given up on the event; that is not an error
            let _ = tx.send(op());
        })?;
        Ok(StreamEvent {
            stream: self.id,
            receiver: rx,
        })
    }

    /// Event that completes once everything enqueued so far has executed.
    pub fn record_event(&self) -> Result<StreamEvent<()>, SchedulerError> {
        self.enqueue_with_result(|| ())
    }

    /// Block until all previously enqueued operations have executed.
    pub fn synchronize(&self) -> Result<(), SchedulerError> {
        self.record_event()?.wait()
    }

    fn run(id: StreamId, receiver: Receiver<StreamOp>, failed: Arc<AtomicBool>) {
        while let Ok(op) = receiver.recv() {
            if panic::catch_unwind(AssertUnwindSafe(op)).is_err() {
                tracing::error!(stream = id, "stream operation faulted; stream disabled");
                failed.store(true, Ordering::Release);
                // Dropping the receiver drops every queued operation and
                // with it the senders of their events.
                break;
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the thread finish queued work and exit
        self.sender.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!(stream = self.id, "stream thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("failed", &self.is_failed())
            .finish()
    }
}
