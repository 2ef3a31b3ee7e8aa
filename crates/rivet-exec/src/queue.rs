//! Two-priority run queue
//!
//! FIFO per lane, High lane drained before Normal. Entries hold `Weak`
//! task references: the queue never keeps a task alive, and a dead entry
//! is skipped on pop. Erasure is tombstoning by id (no mid-queue removal);
//! the tombstone is consumed when its entry reaches the front. Each task
//! carries a `queued` latch so scheduling an already-queued task is a
//! no-op instead of a duplicate entry.

use std::collections::{HashSet, VecDeque};
use std::rc::{Rc, Weak};

use rivet_core::rtrace;

use crate::task::{Task, TaskId, TaskPriority};

struct Entry {
    seq: u64,
    id: TaskId,
    task: Weak<Task>,
}

pub struct TaskQueue {
    lanes: [VecDeque<Entry>; TaskPriority::COUNT],
    seq: u64,
    tombstones: HashSet<TaskId>,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue {
            lanes: [VecDeque::new(), VecDeque::new()],
            seq: 0,
            tombstones: HashSet::new(),
        }
    }

    /// Enqueue a task. Returns false when it was already queued or has
    /// already finished.
    pub fn schedule(&mut self, task: &Rc<Task>) -> bool {
        if task.state().is_finished() {
            return false;
        }
        if task.queued.replace(true) {
            return false;
        }
        self.seq += 1;
        let entry = Entry { seq: self.seq, id: task.id(), task: Rc::downgrade(task) };
        rtrace!("task {}: queued (seq {})", entry.id, entry.seq);
        // A re-scheduled erased task must not be skipped by its old tombstone.
        self.tombstones.remove(&entry.id);
        self.lanes[task.priority() as usize].push_back(entry);
        true
    }

    /// Next runnable task, High lane first. Skips dead and erased entries.
    pub fn pop(&mut self) -> Option<Rc<Task>> {
        for lane in &mut self.lanes {
            while let Some(entry) = lane.pop_front() {
                let erased = self.tombstones.remove(&entry.id);
                let Some(task) = entry.task.upgrade() else { continue };
                task.queued.set(false);
                if erased {
                    continue;
                }
                rtrace!("task {}: popped (seq {})", entry.id, entry.seq);
                return Some(task);
            }
        }
        None
    }

    /// Mark a task's queue entry dead without touching the queue.
    pub fn erase(&mut self, id: TaskId) {
        self.tombstones.insert(id);
    }

    /// Entries currently queued, dead and erased ones included.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
