//! Task units: the payload the scheduler runs, and the handle used to join it

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a task unit
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

/// Lifecycle of a task unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued, not yet picked up by a worker
    Pending = 0,
    /// Executing on some worker
    Running = 1,
    /// Result slot written
    Completed = 2,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            _ => TaskState::Completed,
        }
    }
}

type BoxedThunk<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

/// Write-once result slot shared between the queue entry, the runner and the handle.
///
/// The thunk lives in the slot rather than in the queue, so whoever claims the slot
/// first runs it: a worker that popped or stole the queue entry, or a joiner that
/// got there before any worker did.
pub(crate) struct TaskSlot<T> {
    id: TaskId,
    state: AtomicU8,
    thunk: Mutex<Option<BoxedThunk<T>>>,
    result: Mutex<Option<Result<T>>>,
    done: Condvar,
}

impl<T> TaskSlot<T> {
    fn new(id: TaskId, thunk: BoxedThunk<T>) -> Self {
        Self {
            id,
            state: AtomicU8::new(TaskState::Pending as u8),
            thunk: Mutex::new(Some(thunk)),
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Claim the task and run it on the calling thread. Returns false if it was
    /// already claimed elsewhere.
    pub(crate) fn try_run(&self) -> bool {
        let claimed = self.state.compare_exchange(
            TaskState::Pending as u8,
            TaskState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if claimed.is_err() {
            return false;
        }
        let thunk = self.thunk.lock().take();
        let outcome = match thunk {
            Some(thunk) => match panic::catch_unwind(AssertUnwindSafe(thunk)) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(task = %self.id, %message, "task unit panicked");
                    Err(Error::TaskPanicked {
                        task: self.id.as_u64(),
                        message,
                    })
                }
            },
            None => Err(Error::runtime(format!("{} claimed without a body", self.id))),
        };
        self.complete(outcome);
        true
    }

    fn complete(&self, outcome: Result<T>) {
        let mut slot = self.result.lock();
        debug_assert!(slot.is_none(), "task result slot written twice");
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.state
            .store(TaskState::Completed as u8, Ordering::Release);
        self.done.notify_all();
    }

    /// Block the current OS thread until the slot is written
    pub(crate) fn wait(&self) {
        let mut slot = self.result.lock();
        while slot.is_none() {
            self.done.wait(&mut slot);
        }
    }

    fn take(&self) -> Option<Result<T>> {
        self.result.lock().take()
    }
}

/// Anything the scheduler queues can run
trait Runnable: Send + Sync {
    fn run(&self) -> bool;
}

impl<T: Send> Runnable for TaskSlot<T> {
    fn run(&self) -> bool {
        self.try_run()
    }
}

/// Type-erased queue entry pointing at a task slot
pub(crate) struct Job {
    pub(crate) id: TaskId,
    unit: Arc<dyn Runnable>,
}

impl Job {
    /// Run the task unless a joiner already claimed it. Returns true if it ran here.
    pub(crate) fn execute(self) -> bool {
        self.unit.run()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

/// Build a queue entry and the slot it will fill. The thunk runs under
/// `catch_unwind`; a panic is stored as `Error::TaskPanicked` so the joiner sees a
/// failure.
pub(crate) fn task_unit<T, F>(thunk: F) -> (Job, Arc<TaskSlot<T>>, TaskId)
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let id = TaskId::next();
    let slot = Arc::new(TaskSlot::new(id, Box::new(thunk)));
    let unit: Arc<dyn Runnable> = Arc::clone(&slot) as Arc<dyn Runnable>;
    (Job { id, unit }, slot, id)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a submitted task unit
///
/// Joining consumes the handle and yields the task's value or its failure.
/// Dropping a handle without joining detaches the task; use a
/// [`TaskScope`](crate::runtime::TaskScope) when failures must not be lost.
pub struct TaskHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) slot: Arc<TaskSlot<T>>,
}

impl<T> TaskHandle<T> {
    /// Identifier of the underlying task unit
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.slot.state()
    }

    /// True once the result slot has been written
    pub fn is_finished(&self) -> bool {
        self.slot.is_complete()
    }

    /// Take the result of a finished task. Only valid once `is_finished` is true.
    pub(crate) fn take_result(self) -> Result<T> {
        self.slot
            .take()
            .unwrap_or_else(|| Err(Error::runtime(format!("{} result already taken", self.id))))
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("task_"));
    }

    #[test]
    fn test_job_fills_slot_once() {
        let (job, slot, id) = task_unit(|| Ok(21 * 2));
        let handle = TaskHandle { id, slot };
        assert_eq!(handle.state(), TaskState::Pending);
        job.execute();
        assert!(handle.is_finished());
        assert_eq!(handle.take_result(), Ok(42));
    }

    #[test]
    fn test_slot_runs_once() {
        let (job, slot, id) = task_unit(|| Ok("ran"));
        let handle = TaskHandle { id, slot };
        assert!(handle.slot.try_run());
        assert!(!job.execute());
        assert_eq!(handle.take_result(), Ok("ran"));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let (job, slot, id) = task_unit::<i64, _>(|| panic!("kaboom"));
        let handle = TaskHandle { id, slot };
        job.execute();
        match handle.take_result() {
            Err(Error::TaskPanicked { task, message }) => {
                assert_eq!(task, id.as_u64());
                assert_eq!(message, "kaboom");
            }
            other => panic!("expected TaskPanicked, got {:?}", other),
        }
    }
}
