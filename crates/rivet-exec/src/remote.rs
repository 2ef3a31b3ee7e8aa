//! Remote wake mailbox
//!
//! Everything in a region is single-threaded; this is the one crossing
//! point. A `RemoteWaker` is `Send + Sync` and carries only task ids
//! through a bounded lock-free queue; the owning executor drains it at
//! the top of each `run()`. A full mailbox drops the wake and reports it,
//! the remote side retries; task state is never touched off-thread.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::task::TaskId;

#[derive(Clone)]
pub struct RemoteWaker {
    mailbox: Arc<ArrayQueue<u64>>,
}

impl RemoteWaker {
    pub(crate) fn new(mailbox: Arc<ArrayQueue<u64>>) -> RemoteWaker {
        RemoteWaker { mailbox }
    }

    /// Request a wake for a task on the owning executor's thread.
    /// Returns false when the mailbox is full; the caller retries.
    pub fn wake(&self, id: TaskId) -> bool {
        self.mailbox.push(id.as_u64()).is_ok()
    }

    pub fn capacity(&self) -> usize {
        self.mailbox.capacity()
    }
}
