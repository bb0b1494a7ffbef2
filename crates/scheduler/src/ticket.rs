//! Completion tickets for batches of background tasks
//!
//! A ticket counts the tasks dispatched for one batch. It is signaled once
//! the batch is sealed (no more tasks will be added) and every task has
//! reported back, successfully or not. Waiting blocks only the waiter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::SchedulerError;

/// How a single task finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    /// The task failed; the batch is still usable
    Failed(String),
    /// The task failed in a way that invalidates the whole batch
    Fatal(String),
}

#[derive(Debug, Default)]
struct TicketState {
    total: usize,
    completed: usize,
    sealed: bool,
    failures: Vec<(u64, String)>,
    fatal: Option<String>,
}

impl TicketState {
    fn is_done(&self) -> bool {
        self.sealed && self.completed >= self.total
    }
}

#[derive(Debug)]
struct TicketInner {
    id: u32,
    state: Mutex<TicketState>,
    done: Condvar,
}

/// Completion handle for one batch of tasks.
///
/// Clones share the same state.
///
/// # Example
///
/// ```
/// use demand_loading_scheduler::{TaskStatus, Ticket};
///
/// let ticket = Ticket::new(7);
/// ticket.add_tasks(2);
/// ticket.seal();
/// ticket.task_done(10, TaskStatus::Succeeded);
/// assert!(!ticket.is_done());
/// ticket.task_done(11, TaskStatus::Failed("read error".into()));
/// assert!(ticket.is_done());
/// assert_eq!(ticket.failures(), vec![(11, "read error".to_string())]);
/// ticket.wait().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Ticket {
    inner: Arc<TicketInner>,
}

impl Ticket {
    /// Create an open ticket with no tasks
    pub fn new(id: u32) -> Self {
        Self {
            inner: Arc::new(TicketInner {
                id,
                state: Mutex::new(TicketState::default()),
                done: Condvar::new(),
            }),
        }
    }

    /// Create a ticket that is already signaled
    pub fn completed(id: u32) -> Self {
        let ticket = Self::new(id);
        ticket.seal();
        ticket
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Register `count` more tasks. Must happen before [`Ticket::seal`].
    pub fn add_tasks(&self, count: usize) {
        let mut state = self.inner.state.lock();
        debug_assert!(!state.sealed, "tasks added to a sealed ticket");
        state.total += count;
    }

    /// Record the completion of one task, identified by `key`.
    pub fn task_done(&self, key: u64, status: TaskStatus) {
        let mut state = self.inner.state.lock();
        state.completed += 1;
        match status {
            TaskStatus::Succeeded => {}
            TaskStatus::Failed(reason) => state.failures.push((key, reason)),
            TaskStatus::Fatal(reason) => {
                state.failures.push((key, reason.clone()));
                state.fatal.get_or_insert(reason);
            }
        }
        if state.is_done() {
            self.inner.done.notify_all();
        }
    }

    /// Declare that no more tasks will be added.
    pub fn seal(&self) {
        let mut state = self.inner.state.lock();
        state.sealed = true;
        if state.is_done() {
            self.inner.done.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().is_done()
    }

    /// Block until the ticket is signaled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskFatal`] if any task reported a fatal
    /// failure. Ordinary task failures are available via
    /// [`Ticket::failures`] and do not make `wait` fail.
    pub fn wait(&self) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock();
        while !state.is_done() {
            self.inner.done.wait(&mut state);
        }
        match &state.fatal {
            Some(reason) => Err(SchedulerError::TaskFatal {
                ticket: self.inner.id,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Wait at most `timeout`; returns true if the ticket was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if !state.is_done() {
            self.inner
                .done
                .wait_while_for(&mut state, |state| !state.is_done(), timeout);
        }
        state.is_done()
    }

    /// Total tasks registered so far
    pub fn num_tasks_total(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Tasks that have not reported back yet
    pub fn num_tasks_remaining(&self) -> usize {
        let state = self.inner.state.lock();
        state.total.saturating_sub(state.completed)
    }

    /// Keys and reasons of every failed task
    pub fn failures(&self) -> Vec<(u64, String)> {
        self.inner.state.lock().failures.clone()
    }

    /// The first fatal failure, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.inner.state.lock().fatal.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completed_ticket() {
        let ticket = Ticket::completed(3);
        assert!(ticket.is_done());
        assert_eq!(ticket.id(), 3);
        assert_eq!(ticket.num_tasks_total(), 0);
        ticket.wait().unwrap();
    }

    #[test]
    fn test_not_done_until_sealed() {
        let ticket = Ticket::new(1);
        ticket.add_tasks(1);
        ticket.task_done(5, TaskStatus::Succeeded);
        // Dispatch has not finished; more tasks could still be added
        assert!(!ticket.is_done());
        ticket.seal();
        assert!(ticket.is_done());
    }

    #[test]
    fn test_wait_blocks_until_tasks_complete() {
        let ticket = Ticket::new(1);
        ticket.add_tasks(3);
        ticket.seal();

        let worker_ticket = ticket.clone();
        let handle = thread::spawn(move || {
            for key in 0..3 {
                thread::sleep(Duration::from_millis(5));
                worker_ticket.task_done(key, TaskStatus::Succeeded);
            }
        });

        ticket.wait().unwrap();
        assert_eq!(ticket.num_tasks_remaining(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let ticket = Ticket::new(1);
        ticket.add_tasks(1);
        ticket.seal();
        assert!(!ticket.wait_timeout(Duration::from_millis(10)));
        ticket.task_done(0, TaskStatus::Succeeded);
        assert!(ticket.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_fatal_failure_surfaces_from_wait() {
        let ticket = Ticket::new(9);
        ticket.add_tasks(2);
        ticket.seal();
        ticket.task_done(1, TaskStatus::Fatal("copy failed".into()));
        ticket.task_done(2, TaskStatus::Fatal("second".into()));

        let err = ticket.wait().unwrap_err();
        assert!(matches!(err, SchedulerError::TaskFatal { ticket: 9, ref reason } if reason == "copy failed"));
        assert_eq!(ticket.failures().len(), 2);
        assert_eq!(ticket.fatal_error().as_deref(), Some("copy failed"));
    }
}
