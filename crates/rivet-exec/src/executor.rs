//! Quantum-bounded cooperative executor
//!
//! `run()` is one quantum: drain the remote wake mailbox, then pop and
//! poll tasks until the queue empties or the quantum's wall-clock budget
//! is spent. A task that yields goes to the back of its lane, so within a
//! quantum runnable tasks round-robin; a task that parks is not requeued,
//! its awaitable reschedules it later.
//!
//! The queue borrow is released before a body runs, so bodies may spawn
//! and schedule freely. Task completion fires the task's completion event
//! after all executor bookkeeping is done.
//!
//! `Executor` is a cloneable handle; the mailbox (`RemoteWaker`) is the
//! only surface another thread may touch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

use rivet_core::env::env_get;
use rivet_core::{rdebug, rinfo, rtrace};

use crate::queue::TaskQueue;
use crate::remote::RemoteWaker;
use crate::task::{Task, TaskCx, TaskId, TaskPoll, TaskPriority, TaskState};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock budget of one `run()` call (RVT_QUANTUM_US).
    pub quantum: Duration,
    /// Budget one task gets before `should_yield()` turns true
    /// (RVT_SLICE_US).
    pub slice: Duration,
    /// Remote wake mailbox capacity (RVT_REMOTE_QUEUE).
    pub remote_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_micros(10_000),
            slice: Duration::from_micros(1_000),
            remote_capacity: 64,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            quantum: Duration::from_micros(env_get(
                "RVT_QUANTUM_US",
                d.quantum.as_micros() as u64,
            )),
            slice: Duration::from_micros(env_get("RVT_SLICE_US", d.slice.as_micros() as u64)),
            remote_capacity: env_get("RVT_REMOTE_QUEUE", d.remote_capacity),
        }
    }
}

struct ExecInner {
    config: ExecutorConfig,
    queue: TaskQueue,
    /// Strong: the executor owns a task from spawn until it finishes or
    /// is destroyed, so fire-and-forget spawns stay alive while parked.
    registry: HashMap<TaskId, Rc<Task>>,
    next_id: u64,
}

#[derive(Clone)]
pub struct Executor {
    inner: Rc<RefCell<ExecInner>>,
    mailbox: Arc<ArrayQueue<u64>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Executor {
        let mailbox = Arc::new(ArrayQueue::new(config.remote_capacity));
        let inner = ExecInner {
            config,
            queue: TaskQueue::new(),
            registry: HashMap::new(),
            next_id: 0,
        };
        Executor { inner: Rc::new(RefCell::new(inner)), mailbox }
    }

    /// Create, register and schedule a task.
    pub fn spawn(
        &self,
        priority: TaskPriority,
        body: impl FnMut(&mut TaskCx) -> TaskPoll + 'static,
    ) -> Rc<Task> {
        let mut ex = self.inner.borrow_mut();
        ex.next_id += 1;
        let task = Task::new(TaskId::new(ex.next_id), priority, body);
        ex.registry.insert(task.id(), Rc::clone(&task));
        ex.queue.schedule(&task);
        rdebug!("task {} spawned ({:?})", task.id(), priority);
        task
    }

    /// Make a task runnable. Idempotent; finished tasks are ignored.
    pub fn schedule(&self, task: &Rc<Task>) {
        self.inner.borrow_mut().queue.schedule(task);
    }

    /// Wake handle another thread may hold.
    pub fn remote_waker(&self) -> RemoteWaker {
        RemoteWaker::new(Arc::clone(&self.mailbox))
    }

    /// Forget a task: unregister it and kill its queue entry. Its next
    /// pop is skipped; nothing else references it from here.
    pub fn handle_task_destroyed(&self, id: TaskId) {
        let mut ex = self.inner.borrow_mut();
        ex.registry.remove(&id);
        ex.queue.erase(id);
        rtrace!("task {} destroyed", id);
    }

    pub fn task_count(&self) -> usize {
        self.inner.borrow().registry.len()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.borrow().queue.is_empty() && self.mailbox.is_empty()
    }

    /// One quantum. Returns the number of task polls performed.
    pub fn run(&self) -> usize {
        self.drain_mailbox();

        let (quantum, slice) = {
            let ex = self.inner.borrow();
            (ex.config.quantum, ex.config.slice)
        };
        let started = Instant::now();
        let mut polled = 0usize;

        loop {
            if polled > 0 && started.elapsed() >= quantum {
                rtrace!("quantum spent after {} polls", polled);
                break;
            }
            let Some(task) = self.inner.borrow_mut().queue.pop() else { break };

            // Queue borrow released: the body may spawn and schedule.
            let mut cx = TaskCx::for_task(slice, Rc::clone(&task), self.clone());
            let poll = task.poll(&mut cx);
            polled += 1;

            match poll {
                TaskPoll::Yielded => {
                    task.set_state(TaskState::Waiting);
                    self.inner.borrow_mut().queue.schedule(&task);
                }
                TaskPoll::Pending => {
                    // Parked; its awaitable reschedules it.
                    task.set_state(TaskState::Waiting);
                }
                TaskPoll::Complete(result) => {
                    let state = match &result {
                        Ok(()) => TaskState::Success,
                        Err(e) => {
                            rdebug!("task {} failed: {}", task.id(), e);
                            TaskState::Failure
                        }
                    };
                    task.set_state(state);
                    self.inner.borrow_mut().registry.remove(&task.id());
                    // After bookkeeping: observers may schedule tasks.
                    task.completion().set();
                    rtrace!("task {} finished: {:?}", task.id(), state);
                }
            }
        }
        polled
    }

    /// Run quanta until idle, up to `max_quanta`. Returns true when idle
    /// was reached.
    pub fn run_until_idle(&self, max_quanta: usize) -> bool {
        for _ in 0..max_quanta {
            if self.is_idle() {
                return true;
            }
            self.run();
        }
        self.is_idle()
    }

    fn drain_mailbox(&self) {
        while let Some(raw) = self.mailbox.pop() {
            let id = TaskId::new(raw);
            let mut ex = self.inner.borrow_mut();
            match ex.registry.get(&id).cloned() {
                Some(task) => {
                    rtrace!("task {}: remote wake", id);
                    ex.queue.schedule(&task);
                }
                None => rdebug!("remote wake for unknown task {}", id),
            }
        }
    }
}

impl Drop for ExecInner {
    fn drop(&mut self) {
        let live = self.registry.len();
        if live > 0 {
            rinfo!("executor dropped with {} tasks registered", live);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    fn exec() -> Executor {
        Executor::new(ExecutorConfig {
            quantum: Duration::from_secs(5),
            slice: Duration::from_millis(5),
            remote_capacity: 8,
        })
    }

    #[test]
    fn test_spawn_runs_to_completion() {
        let e = exec();
        let t = e.spawn(TaskPriority::Normal, |_cx| TaskPoll::Complete(Ok(())));
        assert_eq!(e.run(), 1);
        assert_eq!(t.state(), TaskState::Success);
        assert!(t.completion().is_set());
        assert_eq!(e.task_count(), 0);
        assert!(e.is_idle());
    }

    #[test]
    fn test_yielding_tasks_round_robin() {
        let e = exec();
        let order = Rc::new(StdRefCell::new(Vec::new()));
        for name in 1u64..=3 {
            let order = order.clone();
            let mut rounds = 0;
            e.spawn(TaskPriority::Normal, move |_cx| {
                order.borrow_mut().push(name);
                rounds += 1;
                if rounds < 3 {
                    TaskPoll::Yielded
                } else {
                    TaskPoll::Complete(Ok(()))
                }
            });
        }
        e.run();
        assert_eq!(*order.borrow(), vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_quantum_bounds_forever_yielding_tasks() {
        // Two always-runnable tasks that never complete: run() must give
        // the caller control back once the quantum is spent, with both
        // tasks requeued for the next one.
        let e = Executor::new(ExecutorConfig {
            quantum: Duration::from_millis(20),
            slice: Duration::from_millis(1),
            remote_capacity: 8,
        });
        let a = e.spawn(TaskPriority::Normal, |_cx| TaskPoll::Yielded);
        let b = e.spawn(TaskPriority::Normal, |_cx| TaskPoll::Yielded);

        let started = Instant::now();
        let polled = e.run();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(polled >= 2, "both tasks run within one quantum");
        assert_eq!(a.state(), TaskState::Waiting);
        assert_eq!(b.state(), TaskState::Waiting);
        assert!(!e.is_idle());

        // And the next quantum picks them right back up.
        assert!(e.run() >= 2);
    }

    #[test]
    fn test_high_priority_runs_first() {
        let e = exec();
        let order = Rc::new(StdRefCell::new(Vec::new()));
        for (name, prio) in [(1u64, TaskPriority::Normal), (2, TaskPriority::High)] {
            let order = order.clone();
            e.spawn(prio, move |_cx| {
                order.borrow_mut().push(name);
                TaskPoll::Complete(Ok(()))
            });
        }
        e.run();
        assert_eq!(*order.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_panic_becomes_failure() {
        let e = exec();
        let ok = e.spawn(TaskPriority::Normal, |_cx| TaskPoll::Complete(Ok(())));
        let bad = e.spawn(TaskPriority::Normal, |_cx| panic!("kaboom"));
        e.run();
        assert_eq!(bad.state(), TaskState::Failure);
        assert!(bad.completion().is_set());
        assert_eq!(ok.state(), TaskState::Success);
        assert_eq!(e.task_count(), 0);
    }

    #[test]
    fn test_parked_task_waits_for_schedule() {
        let e = exec();
        let mut first = true;
        let t = e.spawn(TaskPriority::Normal, move |_cx| {
            if first {
                first = false;
                TaskPoll::Pending
            } else {
                TaskPoll::Complete(Ok(()))
            }
        });
        e.run();
        assert_eq!(t.state(), TaskState::Waiting);
        assert!(e.is_idle()); // parked, not queued

        e.schedule(&t);
        e.run();
        assert_eq!(t.state(), TaskState::Success);
    }

    #[test]
    fn test_destroyed_task_never_polled() {
        let e = exec();
        let hits = Rc::new(StdRefCell::new(0));
        let h = hits.clone();
        let t = e.spawn(TaskPriority::Normal, move |_cx| {
            *h.borrow_mut() += 1;
            TaskPoll::Complete(Ok(()))
        });
        e.handle_task_destroyed(t.id());
        e.run();
        assert_eq!(*hits.borrow(), 0);
        assert_eq!(e.task_count(), 0);
    }

    #[test]
    fn test_body_can_spawn() {
        let e = exec();
        let e2 = e.clone();
        let child_done = Rc::new(StdRefCell::new(false));
        let flag = child_done.clone();
        e.spawn(TaskPriority::Normal, move |_cx| {
            let flag = flag.clone();
            e2.spawn(TaskPriority::Normal, move |_cx| {
                *flag.borrow_mut() = true;
                TaskPoll::Complete(Ok(()))
            });
            TaskPoll::Complete(Ok(()))
        });
        e.run();
        assert!(*child_done.borrow());
    }

    #[test]
    fn test_cx_exposes_current_task() {
        let e = exec();
        let seen = Rc::new(StdRefCell::new(TaskId::NONE));
        let s = seen.clone();
        let t = e.spawn(TaskPriority::Normal, move |cx| {
            *s.borrow_mut() = cx.task().id();
            TaskPoll::Complete(Ok(()))
        });
        e.run();
        assert_eq!(*seen.borrow(), t.id());
    }
}
