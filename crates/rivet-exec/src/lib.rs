//! rivet-exec: cooperative task execution
//!
//! Single-threaded, quantum-bounded. Tasks are resumable closures in a
//! two-priority run queue; awaitables bridge reactor events back into
//! task scheduling; a bounded mailbox is the only cross-thread surface.
//! One executor pairs with one reactor per region thread.

pub mod awaitable;
pub mod executor;
pub mod queue;
pub mod remote;
pub mod task;

pub use awaitable::{AwaitState, Awaitable};
pub use executor::{Executor, ExecutorConfig};
pub use queue::TaskQueue;
pub use remote::RemoteWaker;
pub use task::{Task, TaskCx, TaskId, TaskPoll, TaskPriority, TaskState};
