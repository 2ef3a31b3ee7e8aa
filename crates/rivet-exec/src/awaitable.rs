//! Awaitable: parking a task on an event
//!
//! Three explicit states: Idle (nothing registered), Registered (observer
//! installed, task parked), Ready (event fired or died). `wait()` checks
//! readiness first, so waiting on an already-set event costs nothing and
//! the task never suspends.
//!
//! When the event fires, the observer marks the awaitable Ready and
//! SCHEDULES the task; it never resumes it inline. The set() call may be
//! deep inside the reactor's notify drain, and re-entering a task body
//! from there would run user code under engine invariants that are
//! mid-update. The task resumes on the executor's next quantum.
//!
//! An event that is destroyed while observed wakes the waiter too, with
//! `was_detached()` set, so a task parked on a vanishing owner is not
//! leaked.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use rivet_core::event::{Event, EventObserver, EventSignal};
use rivet_core::rtrace;
use rivet_reactor::operation::OpHandle;

use crate::executor::Executor;
use crate::task::{Task, TaskCx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AwaitState {
    Idle = 0,
    Registered = 1,
    Ready = 2,
}

struct AwaitInner {
    state: Cell<AwaitState>,
    detached: Cell<bool>,
    task: RefCell<Weak<Task>>,
    exec: RefCell<Option<Executor>>,
}

impl EventObserver for AwaitInner {
    fn on_event(&self, signal: EventSignal) {
        self.state.set(AwaitState::Ready);
        if signal == EventSignal::Detached {
            self.detached.set(true);
        }
        let task = self.task.borrow_mut().upgrade();
        let exec = self.exec.borrow_mut().take();
        if let (Some(task), Some(exec)) = (task, exec) {
            rtrace!("awaitable ready, scheduling task {}", task.id());
            // Schedule, never resume inline.
            exec.schedule(&task);
        }
    }
}

/// One wait slot. Reusable via `reset()` after the wake was consumed.
pub struct Awaitable {
    inner: Rc<AwaitInner>,
}

impl Awaitable {
    pub fn new() -> Awaitable {
        Awaitable {
            inner: Rc::new(AwaitInner {
                state: Cell::new(AwaitState::Idle),
                detached: Cell::new(false),
                task: RefCell::new(Weak::new()),
                exec: RefCell::new(None),
            }),
        }
    }

    #[inline]
    pub fn state(&self) -> AwaitState {
        self.inner.state.get()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.inner.state.get() == AwaitState::Ready
    }

    /// The wake came from the event being destroyed, not set.
    #[inline]
    pub fn was_detached(&self) -> bool {
        self.inner.detached.get()
    }

    /// Park the current task on `event` unless it is already set.
    ///
    /// Returns true when the event was ready (no registration happened;
    /// keep running). Returns false when the task is now registered; the
    /// body must return `TaskPoll::Pending`.
    pub fn wait(&self, event: &Event, cx: &TaskCx) -> bool {
        match self.inner.state.get() {
            AwaitState::Ready => return true,
            AwaitState::Registered => return false,
            AwaitState::Idle => {}
        }
        *self.inner.task.borrow_mut() = Rc::downgrade(cx.task());
        *self.inner.exec.borrow_mut() = Some(cx.executor().clone());
        let weak = Rc::downgrade(&self.inner) as Weak<dyn EventObserver>;
        if event.observe(weak) {
            // Already set; undo the registration bookkeeping.
            *self.inner.task.borrow_mut() = Weak::new();
            *self.inner.exec.borrow_mut() = None;
            self.inner.state.set(AwaitState::Ready);
            return true;
        }
        self.inner.state.set(AwaitState::Registered);
        false
    }

    /// Park on an operation's completion event. Same contract as `wait`.
    pub fn wait_op(&self, handle: &OpHandle, cx: &TaskCx) -> bool {
        self.wait(handle.event(), cx)
    }

    /// Back to Idle for the next wait.
    pub fn reset(&self) {
        self.inner.state.set(AwaitState::Idle);
        self.inner.detached.set(false);
        *self.inner.task.borrow_mut() = Weak::new();
        *self.inner.exec.borrow_mut() = None;
    }
}

impl Default for Awaitable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::task::{TaskPoll, TaskPriority, TaskState};
    use rivet_reactor::params::OperationParams;
    use rivet_reactor::reactor::{Reactor, ReactorConfig};
    use rivet_reactor::resource::Resource;
    use std::time::Duration;

    fn exec() -> Executor {
        Executor::new(ExecutorConfig {
            quantum: Duration::from_secs(5),
            slice: Duration::from_millis(5),
            remote_capacity: 8,
        })
    }

    #[test]
    fn test_ready_event_skips_suspension() {
        let e = exec();
        let ev = Event::new();
        ev.set();
        let aw = Awaitable::new();
        let polls = Rc::new(Cell::new(0));
        let p = polls.clone();
        let ev2 = ev.clone();
        let t = e.spawn(TaskPriority::Normal, move |cx| {
            p.set(p.get() + 1);
            assert!(aw.wait(&ev2, cx));
            TaskPoll::Complete(Ok(()))
        });
        e.run();
        // One poll: the wait never parked.
        assert_eq!(polls.get(), 1);
        assert_eq!(t.state(), TaskState::Success);
        assert_eq!(ev.observer_count(), 0);
    }

    #[test]
    fn test_set_schedules_but_never_resumes_inline() {
        let e = exec();
        let ev = Event::new();
        let aw = Rc::new(Awaitable::new());
        let polls = Rc::new(Cell::new(0));

        let t = {
            let aw = aw.clone();
            let polls = polls.clone();
            let ev = ev.clone();
            e.spawn(TaskPriority::Normal, move |cx| {
                polls.set(polls.get() + 1);
                if aw.wait(&ev, cx) {
                    TaskPoll::Complete(Ok(()))
                } else {
                    TaskPoll::Pending
                }
            })
        };

        e.run();
        assert_eq!(polls.get(), 1);
        assert_eq!(aw.state(), AwaitState::Registered);

        ev.set();
        // Scheduled, not resumed: the poll count is unchanged until run().
        assert_eq!(polls.get(), 1);
        assert!(aw.is_ready());
        assert!(!e.is_idle());

        e.run();
        assert_eq!(polls.get(), 2);
        assert_eq!(t.state(), TaskState::Success);
    }

    #[test]
    fn test_destroyed_event_wakes_with_detached() {
        let e = exec();
        let ev = Event::new();
        let aw = Rc::new(Awaitable::new());

        let t = {
            let aw = aw.clone();
            // Weak: holding the event in the body would keep it alive.
            let wev = Rc::downgrade(&ev);
            e.spawn(TaskPriority::Normal, move |cx| {
                if aw.is_ready() {
                    return if aw.was_detached() {
                        TaskPoll::Complete(Err(rivet_core::RivetError::Canceled))
                    } else {
                        TaskPoll::Complete(Ok(()))
                    };
                }
                match wev.upgrade() {
                    Some(ev) => {
                        if aw.wait(&ev, cx) {
                            TaskPoll::Complete(Ok(()))
                        } else {
                            TaskPoll::Pending
                        }
                    }
                    None => TaskPoll::Complete(Err(rivet_core::RivetError::Canceled)),
                }
            })
        };

        e.run();
        drop(ev);
        assert!(aw.was_detached());
        e.run();
        assert_eq!(t.state(), TaskState::Failure);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let aw = Awaitable::new();
        aw.inner.state.set(AwaitState::Ready);
        aw.inner.detached.set(true);
        aw.reset();
        assert_eq!(aw.state(), AwaitState::Idle);
        assert!(!aw.was_detached());
    }

    /// End to end: a task submits an operation, parks on its completion
    /// event, the reactor completes it, the task resumes with the result.
    #[test]
    fn test_task_waits_for_operation() {
        let e = exec();
        let (r, _ctl) = Reactor::with_loopback(ReactorConfig {
            max_ops: 8,
            max_contexts: 4,
            completion_batch: 4,
        });
        r.start().unwrap();

        let result = Rc::new(Cell::new(None));
        let t = {
            let r = r.clone();
            let result = result.clone();
            let mut pending: Option<(Resource, rivet_reactor::operation::OpHandle, Awaitable)> =
                None;
            e.spawn(TaskPriority::Normal, move |cx| {
                if pending.is_none() {
                    let res = Resource::new(&r);
                    let h = res.submit(OperationParams::Nop).unwrap();
                    pending = Some((res, h, Awaitable::new()));
                }
                let (_res, h, aw) = pending.as_ref().unwrap();
                if aw.wait_op(h, cx) {
                    result.set(h.try_result());
                    TaskPoll::Complete(Ok(()))
                } else {
                    TaskPoll::Pending
                }
            })
        };

        e.run(); // task submits and parks
        assert_eq!(t.state(), TaskState::Waiting);
        r.step().unwrap(); // reactor completes and notifies
        e.run(); // task resumes
        assert_eq!(t.state(), TaskState::Success);
        assert_eq!(result.get().unwrap().unwrap(), 0);
    }
}
