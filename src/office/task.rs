use crate::{error::OfficeError, office::connection::Connection};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Instant;

pub type TaskId = u64;

pub(crate) type Work = Box<dyn FnOnce(&Connection) -> Result<(), OfficeError> + Send>;
pub(crate) type Fail = Arc<dyn Fn(OfficeError) + Send + Sync>;

/// A type-erased unit of work waiting for, or running on, an office instance.
///
/// The typed result lives in a [`ResultSlot`] shared with the caller's
/// [`TaskHandle`]; the task only carries closures that write into it.
pub struct Task {
    id: TaskId,
    submitted_at: Instant,
    work: Work,
    fail: Fail,
}

impl Task {
    pub(crate) fn new<T, F>(id: TaskId, f: F) -> (Task, Arc<ResultSlot<T>>)
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, OfficeError> + Send + 'static,
    {
        let slot = Arc::new(ResultSlot::new());

        let run_slot = Arc::clone(&slot);
        let work: Work = Box::new(move |conn| match f(conn) {
            Ok(value) => {
                run_slot.complete(Ok(value));
                Ok(())
            }
            Err(err) => {
                run_slot.complete(Err(err.clone()));
                Err(err)
            }
        });

        let fail_slot = Arc::clone(&slot);
        let fail: Fail = Arc::new(move |err| {
            fail_slot.complete(Err(err));
        });

        let task = Task {
            id,
            submitted_at: Instant::now(),
            work,
            fail,
        };
        (task, slot)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Resolve the task with `err` without running it.
    pub(crate) fn fail(self, err: OfficeError) {
        (self.fail)(err);
    }

    pub(crate) fn into_parts(self) -> (TaskId, Work, Fail) {
        (self.id, self.work, self.fail)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

enum SlotState<T> {
    Pending,
    Done(Result<T, OfficeError>),
    Taken,
}

/// Single-assignment result cell. The first completion wins; later ones
/// (a hung task finishing after its watchdog fired) are dropped.
pub(crate) struct ResultSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, result: Result<T, OfficeError>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Done(result);
        self.ready.notify_all();
        true
    }

    fn is_done(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        !matches!(*state, SlotState::Pending)
    }

    fn take(&self) -> Result<T, OfficeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Done(result) => return result,
                SlotState::Pending => {
                    *state = SlotState::Pending;
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                SlotState::Taken => unreachable!("task result taken twice"),
            }
        }
    }
}

/// Removes a still-queued task from wherever it is waiting.
pub(crate) trait CancelQueued: Send + Sync {
    fn cancel_queued(&self, id: TaskId) -> bool;
}

/// Caller side of a submitted task.
pub struct TaskHandle<T> {
    id: TaskId,
    slot: Arc<ResultSlot<T>>,
    queue: Weak<dyn CancelQueued>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, slot: Arc<ResultSlot<T>>, queue: Weak<dyn CancelQueued>) -> Self {
        Self { id, slot, queue }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.slot.is_done()
    }

    /// Cancel the task if it has not been dispatched yet. Returns false once
    /// an instance has picked it up (or it already finished).
    pub fn cancel(&self) -> bool {
        match self.queue.upgrade() {
            Some(queue) => queue.cancel_queued(self.id),
            None => false,
        }
    }

    /// Block until the task succeeds or fails.
    pub fn wait(self) -> Result<T, OfficeError> {
        self.slot.take()
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
