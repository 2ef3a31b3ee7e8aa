//! Operations and their user-side handles
//!
//! An `Operation` is a pool entry owned by the reactor: parameters, the
//! per-op state machine, and the shared cells its `OpHandle` reads. The
//! handle and the operation never hold references to each other; they
//! share two `Rc`s (a readiness `Event` and an outcome cell), so either
//! side may outlive the other. Dropping the handle abandons the operation:
//! it keeps running, its parameters stay pinned for the backend, and the
//! reactor reaps it through the normal TERMINAL path.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use rivet_core::error::Errno;
use rivet_core::event::Event;
use rivet_core::id::{CtxId, OpId};
use rivet_core::op_state::{OpEvent, OpState, OpStateMachine};
use rivet_core::{RivetError, RivetResult};

use crate::params::OperationParams;

/// How an operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Normal completion; no cancel was involved.
    Completed,

    /// The cancel won: the operation did not run to completion.
    Canceled,

    /// A cancel was requested but the operation finished first.
    /// The result is the real one and must not be discarded.
    CompletedAfterCancel,
}

/// Final result of an operation.
#[derive(Debug, Clone, Copy)]
pub struct OpOutcome {
    pub kind: CompletionKind,
    /// Raw backend result; negative encodes `-errno`.
    pub raw: i64,
}

impl OpOutcome {
    /// Interpret the outcome: cancellation and system errors become
    /// errors, anything else is the success payload.
    pub fn result(&self) -> RivetResult<i64> {
        if self.kind == CompletionKind::Canceled {
            return Err(RivetError::Canceled);
        }
        Ok(Errno::check(self.raw)?)
    }
}

/// Pool-resident state of one asynchronous operation.
pub struct Operation {
    id: OpId,
    ctx: CtxId,
    sm: OpStateMachine,
    params: OperationParams,
    cancel_requested: bool,
    /// Survives its resource: the detach cancel sweep skips it.
    daemonized: bool,
    event: Rc<Event>,
    outcome: Rc<Cell<Option<OpOutcome>>>,
    /// Intermediate results of a multi-shot operation, oldest first.
    progress: Rc<RefCell<Vec<i64>>>,
}

impl Operation {
    pub fn new(id: OpId, ctx: CtxId, params: OperationParams) -> (Operation, OpHandle) {
        let event = Event::new();
        let outcome = Rc::new(Cell::new(None));
        let progress = Rc::new(RefCell::new(Vec::new()));
        let op = Operation {
            id,
            ctx,
            sm: OpStateMachine::new(),
            params,
            cancel_requested: false,
            daemonized: false,
            event: Rc::clone(&event),
            outcome: Rc::clone(&outcome),
            progress: Rc::clone(&progress),
        };
        let handle = OpHandle { id, ctx, event, outcome, progress };
        (op, handle)
    }

    #[inline]
    pub fn id(&self) -> OpId {
        self.id
    }

    #[inline]
    pub fn ctx(&self) -> CtxId {
        self.ctx
    }

    #[inline]
    pub fn state(&self) -> OpState {
        self.sm.state()
    }

    #[inline]
    pub fn params(&self) -> &OperationParams {
        &self.params
    }

    #[inline]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    #[inline]
    pub fn is_daemonized(&self) -> bool {
        self.daemonized
    }

    pub fn daemonize(&mut self) {
        self.daemonized = true;
    }

    /// The operation (or its cancel request) was handed to the backend.
    pub fn mark_submitted(&mut self) -> OpState {
        self.sm.handle_event(OpEvent::Submission)
    }

    /// Request cancellation.
    ///
    /// From SPOOLED nothing is in flight, so the operation completes as
    /// cancelled on the spot. From WORKING the cancel must travel to the
    /// backend first; the returned state tells the caller which happened.
    pub fn request_cancel(&mut self) -> OpState {
        self.cancel_requested = true;
        let next = self.sm.handle_event(OpEvent::Cancel);
        if next == OpState::Complete {
            self.outcome.set(Some(OpOutcome {
                kind: CompletionKind::Canceled,
                raw: -(libc::ECANCELED as i64),
            }));
        }
        next
    }

    /// The backend delivered the final result.
    pub fn complete(&mut self, raw: i64) -> OpState {
        let kind = if self.cancel_requested {
            if raw == -(libc::ECANCELED as i64) {
                CompletionKind::Canceled
            } else {
                CompletionKind::CompletedAfterCancel
            }
        } else {
            CompletionKind::Completed
        };
        self.outcome.set(Some(OpOutcome { kind, raw }));
        self.sm.handle_event(OpEvent::Completion)
    }

    /// The backend delivered a non-final result (multi-shot). The state
    /// machine does not move; only the last completion does that.
    pub fn record_progress(&mut self, raw: i64) {
        self.progress.borrow_mut().push(raw);
        self.event.set();
        self.event.reset();
    }

    /// Tell the owner. Fires the shared event; the state machine moves to
    /// TERMINAL and the operation becomes reapable.
    pub fn notify(&mut self) -> OpState {
        let next = self.sm.handle_event(OpEvent::Notification);
        self.event.set();
        next
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation({:?}, ctx={}, {}, {})",
            self.id,
            self.ctx,
            self.params.kind(),
            self.sm.state()
        )
    }
}

/// User-side handle to an operation.
///
/// Shares the readiness event and outcome cell with the pool entry.
/// Dropping it does not cancel anything.
pub struct OpHandle {
    id: OpId,
    ctx: CtxId,
    event: Rc<Event>,
    outcome: Rc<Cell<Option<OpOutcome>>>,
    progress: Rc<RefCell<Vec<i64>>>,
}

impl OpHandle {
    #[inline]
    pub fn id(&self) -> OpId {
        self.id
    }

    #[inline]
    pub fn ctx(&self) -> CtxId {
        self.ctx
    }

    /// The event set when the operation is notified. Register an observer
    /// on it to wait cooperatively.
    #[inline]
    pub fn event(&self) -> &Rc<Event> {
        &self.event
    }

    /// Outcome, if the operation has been notified (or locally cancelled).
    #[inline]
    pub fn outcome(&self) -> Option<OpOutcome> {
        self.outcome.get()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Convenience: outcome interpreted as a result.
    /// None while still in flight.
    pub fn try_result(&self) -> Option<RivetResult<i64>> {
        self.outcome.get().map(|o| o.result())
    }

    /// Take intermediate multi-shot results accumulated so far.
    pub fn drain_progress(&self) -> Vec<i64> {
        std::mem::take(&mut *self.progress.borrow_mut())
    }
}

impl fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpHandle({:?}, done={})", self.id, self.is_done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(params: OperationParams) -> (Operation, OpHandle) {
        Operation::new(OpId::new(0, 1), CtxId::new(0), params)
    }

    #[test]
    fn test_happy_path_outcome() {
        let (mut op, handle) = make(OperationParams::Nop);
        assert!(!handle.is_done());

        op.mark_submitted();
        op.complete(17);
        op.notify();

        assert_eq!(op.state(), OpState::Terminal);
        let out = handle.outcome().unwrap();
        assert_eq!(out.kind, CompletionKind::Completed);
        assert_eq!(out.result().unwrap(), 17);
        assert!(handle.event().is_set());
    }

    #[test]
    fn test_cancel_before_submit_completes_locally() {
        let (mut op, handle) = make(OperationParams::Nop);
        let next = op.request_cancel();
        assert_eq!(next, OpState::Complete);

        let out = handle.outcome().unwrap();
        assert_eq!(out.kind, CompletionKind::Canceled);
        assert_eq!(out.result(), Err(RivetError::Canceled));
    }

    #[test]
    fn test_cancel_in_flight_classification() {
        let (mut op, handle) = make(OperationParams::Nop);
        op.mark_submitted();
        assert_eq!(op.request_cancel(), OpState::CancelSpooled);
        op.mark_submitted(); // cancel went to the backend
        op.complete(-(libc::ECANCELED as i64));
        op.notify();

        assert_eq!(handle.outcome().unwrap().kind, CompletionKind::Canceled);
    }

    #[test]
    fn test_completion_outruns_cancel() {
        let (mut op, handle) = make(OperationParams::Nop);
        op.mark_submitted();
        op.request_cancel();
        op.mark_submitted();
        // The real completion arrived before the cancel took effect.
        op.complete(128);
        op.notify();

        let out = handle.outcome().unwrap();
        assert_eq!(out.kind, CompletionKind::CompletedAfterCancel);
        assert_eq!(out.result().unwrap(), 128);
    }

    #[test]
    fn test_sys_error_result() {
        let (mut op, handle) = make(OperationParams::Nop);
        op.mark_submitted();
        op.complete(-(libc::EBADF as i64));
        op.notify();

        assert_eq!(
            handle.try_result().unwrap(),
            Err(RivetError::Sys(Errno(libc::EBADF)))
        );
    }

    #[test]
    fn test_multi_shot_progress() {
        let (mut op, handle) = make(OperationParams::Nop);
        op.mark_submitted();
        op.record_progress(10);
        op.record_progress(20);
        assert!(!handle.is_done());
        assert_eq!(handle.drain_progress(), vec![10, 20]);

        op.complete(30);
        op.notify();
        assert_eq!(handle.try_result().unwrap().unwrap(), 30);
    }

    #[test]
    fn test_handle_outlives_operation() {
        let (mut op, handle) = make(OperationParams::Nop);
        op.mark_submitted();
        op.complete(5);
        op.notify();
        drop(op); // reaped

        assert_eq!(handle.try_result().unwrap().unwrap(), 5);
    }
}
