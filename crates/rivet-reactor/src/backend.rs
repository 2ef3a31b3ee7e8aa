//! Completion backend abstraction
//!
//! A `CompletionBackend` accepts submission entries tagged with an opaque
//! operation key, later yields completions carrying the same key, and
//! supports cancel-by-key. io_uring is the production implementation
//! (`UringBackend`); `LoopbackBackend` is the deterministic in-process one
//! used by tests and non-Linux builds. The reactor is generic over the
//! trait via `Box<dyn CompletionBackend>`: swap the backend, the reactor
//! does not change.
//!
//! **Contract:** `submit()` and `flush()` must never block. A full
//! submission queue is reported as `RivetError::RingFull` and is
//! backpressure, not failure: the reactor retries on its next step.
//!
//! **Result convention:** negative completion results encode `-errno`;
//! non-negative ones are the success payload (byte count, fd, ...).
//!
//! **Pointer stability:** entries may carry raw pointers derived from
//! `OperationParams` (buffers, sockaddrs, timespecs). The reactor keeps
//! the owning operation alive and unmoved until the completion for its key
//! has been delivered; that is the whole point of the abandonment
//! protocol.

use rivet_core::id::OpId;
use rivet_core::RivetResult;

use crate::params::OperationParams;

/// One submission handed to the backend.
pub struct SubmitEntry<'a> {
    /// Operation key, round-tripped through the backend's user_data.
    pub key: OpId,
    /// What to do. The backend matches exhaustively.
    pub params: &'a OperationParams,
}

/// A completed operation from the backend.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// The key that was submitted.
    pub key: OpId,
    /// Return value, or negative errno.
    pub result: i64,
    /// More completions follow for this key (multi-shot operations).
    pub more: bool,
}

/// Async submission and completion.
pub trait CompletionBackend {
    /// Queue a single operation. Not yet kicked.
    ///
    /// Returns `Err(RingFull)` when the submission queue is full.
    fn submit(&mut self, entry: SubmitEntry<'_>) -> RivetResult<()>;

    /// Kick all queued submissions. Returns the number submitted.
    fn flush(&mut self) -> RivetResult<usize>;

    /// Drain up to `buf.len()` completions, non-blocking.
    /// Returns the number written; 0 when nothing is ready.
    fn poll_completions(&mut self, buf: &mut [Completion]) -> usize;

    /// Request cancellation of an in-flight operation by key.
    ///
    /// Best-effort: the operation may complete before the cancel takes
    /// effect, in which case its normal completion is delivered and the
    /// cancel acknowledgment is dropped.
    fn cancel(&mut self, key: OpId) -> RivetResult<()>;

    /// Operations submitted but not yet completed.
    fn inflight(&self) -> usize;

    /// Entries the backend can queue before a flush.
    fn capacity(&self) -> usize;

    /// Drain remaining completions and release resources.
    fn shutdown(&mut self);
}
