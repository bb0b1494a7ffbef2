//! Demand Loading Scheduler Library
//!
//! Execution machinery for the paging engine: in-order device streams, a
//! priority job queue drained by a bounded pool of fill workers, and the
//! tickets that report when a batch of fills has finished.
//!
//! # Example
//!
//! ```
//! use demand_loading_scheduler::{
//!     JobPriority, JobQueue, Stream, TaskStatus, Ticket, WorkerPool, WorkerPoolConfig,
//! };
//! use std::sync::Arc;
//!
//! let queue = Arc::new(JobQueue::new());
//! let workers = WorkerPool::new(queue.clone(), WorkerPoolConfig::new(2)).unwrap();
//! let stream = Arc::new(Stream::new("device0").unwrap());
//!
//! let ticket = Ticket::new(0);
//! for page in 0..4u64 {
//!     ticket.add_tasks(1);
//!     let (ticket, stream) = (ticket.clone(), stream.clone());
//!     queue.push(JobPriority::Normal, move || {
//!         // Copies are ordered on the stream; wait for ours before reporting
//!         let copied = stream.record_event().and_then(|event| event.wait());
//!         let status = match copied {
//!             Ok(()) => TaskStatus::Succeeded,
//!             Err(err) => TaskStatus::Fatal(err.to_string()),
//!         };
//!         ticket.task_done(page, status);
//!     });
//! }
//! ticket.seal();
//! ticket.wait().unwrap();
//! workers.shutdown();
//! ```

mod error;
mod priority;
mod stream;
mod ticket;
mod worker;

pub use error::SchedulerError;
pub use priority::{Job, JobId, JobPriority, JobQueue};
pub use stream::{Stream, StreamEvent, StreamId};
pub use ticket::{TaskStatus, Ticket};
pub use worker::{WorkerPool, WorkerPoolConfig};
