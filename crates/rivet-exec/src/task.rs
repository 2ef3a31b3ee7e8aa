//! Tasks: resumable bodies with explicit lifecycle
//!
//! A task body is a closure polled repeatedly by the executor. Each poll
//! returns what happened: the task yielded its slice, parked itself on an
//! awaitable, or finished. There is no stack switching; a body that needs
//! to resume mid-work carries its own state across polls.
//!
//! Panics do not cross the task boundary. `poll()` catches them, marks
//! the task FAILURE, and reports a completion carrying `Panicked`, so one
//! broken task cannot take the executor down.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rivet_core::event::Event;
use rivet_core::{rerror, RivetError, RivetResult};

/// Identifier of a task within its executor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const NONE: TaskId = TaskId(u64::MAX);

    #[inline]
    pub const fn new(id: u64) -> Self {
        TaskId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Not currently executing; may or may not be queued.
    Waiting = 0,

    /// Body is on the stack right now.
    Running = 1,

    /// Finished cleanly.
    Success = 2,

    /// Finished with an error or a panic.
    Failure = 3,
}

impl TaskState {
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }
}

/// Scheduling class. High drains before Normal every quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskPriority {
    High = 0,
    Normal = 1,
}

impl TaskPriority {
    pub const COUNT: usize = 2;
}

/// What one poll of a task body produced.
pub enum TaskPoll {
    /// Gave up the slice voluntarily; wants to run again next quantum.
    Yielded,

    /// Parked on an awaitable; something else will reschedule it.
    Pending,

    /// Done. The executor records SUCCESS or FAILURE from the result.
    Complete(RivetResult<()>),
}

/// Per-poll context handed to the body.
pub struct TaskCx {
    slice_deadline: Instant,
    task: Option<Rc<Task>>,
    exec: Option<crate::executor::Executor>,
}

impl TaskCx {
    #[cfg(test)]
    pub(crate) fn new(slice: Duration) -> TaskCx {
        TaskCx { slice_deadline: Instant::now() + slice, task: None, exec: None }
    }

    pub(crate) fn for_task(
        slice: Duration,
        task: Rc<Task>,
        exec: crate::executor::Executor,
    ) -> TaskCx {
        TaskCx {
            slice_deadline: Instant::now() + slice,
            task: Some(task),
            exec: Some(exec),
        }
    }

    /// A long-running body checks this in its loop and returns
    /// `TaskPoll::Yielded` when it turns true.
    #[inline]
    pub fn should_yield(&self) -> bool {
        Instant::now() >= self.slice_deadline
    }

    /// The task being polled. Awaitables register this for wakeup.
    pub fn task(&self) -> &Rc<Task> {
        self.task.as_ref().expect("task context used outside the executor")
    }

    pub fn executor(&self) -> &crate::executor::Executor {
        self.exec.as_ref().expect("task context used outside the executor")
    }
}

type TaskBody = Box<dyn FnMut(&mut TaskCx) -> TaskPoll>;

pub struct Task {
    id: TaskId,
    priority: TaskPriority,
    state: Cell<TaskState>,
    /// Idempotent-scheduling latch; owned by the queue.
    pub(crate) queued: Cell<bool>,
    body: RefCell<TaskBody>,
    completion: Rc<Event>,
}

impl Task {
    pub fn new(
        id: TaskId,
        priority: TaskPriority,
        body: impl FnMut(&mut TaskCx) -> TaskPoll + 'static,
    ) -> Rc<Task> {
        Rc::new(Task {
            id,
            priority,
            state: Cell::new(TaskState::Waiting),
            queued: Cell::new(false),
            body: RefCell::new(Box::new(body)),
            completion: Event::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    /// Set once the task reaches SUCCESS or FAILURE.
    #[inline]
    pub fn completion(&self) -> &Rc<Event> {
        &self.completion
    }

    /// Run the body once. Catches panics; a panicking task is FAILURE and
    /// its poll reports `Complete(Err(Panicked))`.
    pub(crate) fn poll(&self, cx: &mut TaskCx) -> TaskPoll {
        self.state.set(TaskState::Running);
        let mut body = self.body.borrow_mut();
        match catch_unwind(AssertUnwindSafe(|| (body)(cx))) {
            Ok(poll) => poll,
            Err(_) => {
                rerror!("task {} panicked", self.id);
                TaskPoll::Complete(Err(RivetError::Panicked))
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({}, {:?}, {:?})", self.id, self.priority, self.state.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_runs_body() {
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let task = Task::new(TaskId::new(1), TaskPriority::Normal, move |_cx| {
            h.set(h.get() + 1);
            TaskPoll::Complete(Ok(()))
        });
        let mut cx = TaskCx::new(Duration::from_millis(1));
        assert!(matches!(task.poll(&mut cx), TaskPoll::Complete(Ok(()))));
        assert_eq!(hits.get(), 1);
        assert_eq!(task.state(), TaskState::Running); // executor records the end state
    }

    #[test]
    fn test_panic_is_contained() {
        let task = Task::new(TaskId::new(2), TaskPriority::Normal, |_cx| {
            panic!("boom");
        });
        let mut cx = TaskCx::new(Duration::from_millis(1));
        match task.poll(&mut cx) {
            TaskPoll::Complete(Err(RivetError::Panicked)) => {}
            _ => panic!("expected contained panic"),
        }
    }

    #[test]
    fn test_body_state_survives_polls() {
        let task = Task::new(TaskId::new(3), TaskPriority::High, {
            let mut n = 0;
            move |_cx| {
                n += 1;
                if n < 3 {
                    TaskPoll::Yielded
                } else {
                    TaskPoll::Complete(Ok(()))
                }
            }
        });
        let mut cx = TaskCx::new(Duration::from_millis(1));
        assert!(matches!(task.poll(&mut cx), TaskPoll::Yielded));
        assert!(matches!(task.poll(&mut cx), TaskPoll::Yielded));
        assert!(matches!(task.poll(&mut cx), TaskPoll::Complete(Ok(()))));
    }

    #[test]
    fn test_slice_deadline_elapses() {
        let cx = TaskCx::new(Duration::from_secs(0));
        assert!(cx.should_yield());
        let cx = TaskCx::new(Duration::from_secs(3600));
        assert!(!cx.should_yield());
    }
}
