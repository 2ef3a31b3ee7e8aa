//! rivet-reactor: single-threaded completion engine
//!
//! One reactor per thread drives the full operation lifecycle: spool,
//! submit, complete, notify, reap. The completion backend is pluggable;
//! io_uring in production on Linux, a deterministic loopback everywhere
//! else and in tests. See `reactor` for the step pipeline, `context` for
//! the deferred-action index discipline, and `operation` for the
//! handle/pool split that makes dropping a handle mid-I/O safe.

pub mod backend;
pub mod context;
pub mod loopback;
pub mod operation;
pub mod params;
pub mod reactor;
pub mod resource;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod net;
        pub mod uring;
        pub use net::Socket;
        pub use uring::UringBackend;
    }
}

pub use backend::{Completion, CompletionBackend, SubmitEntry};
pub use context::{ActionIndex, ActionSet, Cursor, DeferredAction, ResourceContext};
pub use loopback::{LoopbackBackend, LoopbackControl};
pub use operation::{CompletionKind, OpHandle, OpOutcome, Operation};
pub use params::{Address, BufferHandle, OperationParams};
pub use reactor::{Reactor, ReactorConfig, ReactorPhase};
pub use resource::Resource;
