//! The reactor: single-threaded completion engine
//!
//! Owns the operation pool, the context slab, the three deferred-action
//! indexes and the completion backend. `step()` is the whole engine:
//!
//!   1. drain the SUBMIT index (spooled ops and pending cancels go to the
//!      backend; a full ring re-queues and stops),
//!   2. flush the backend,
//!   3. poll completions and advance state machines,
//!   4. drain the NOTIFY index (fire events, ops go TERMINAL),
//!   5. drain the REMOVE index (reap terminal ops, reap dead contexts).
//!
//! Submit-drain running before the completion poll is load-bearing: a
//! cancel requested last step is always handed to the backend before its
//! operation's completion can be observed, so a completion never lands on
//! a CANCEL_SPOOLED operation.
//!
//! The operation pool is sized once and never grows. Backends keep raw
//! pointers into operation parameters while a request is in flight, so an
//! `Operation` must not move until it reaches TERMINAL; a fixed slab of
//! slots gives that for free. A stale completion (slot recycled since the
//! key was minted) is detected by generation mismatch and dropped.
//!
//! `Reactor` is a cheap cloneable handle; everything lives behind one
//! `Rc<RefCell>`, single-threaded by construction.

use std::cell::RefCell;
use std::rc::Rc;

use rivet_core::env::env_get;
use rivet_core::id::{CtxId, OpId};
use rivet_core::op_state::OpState;
use rivet_core::{rdebug, rinfo, rtrace, rwarn, RivetError, RivetResult};

use crate::backend::{Completion, CompletionBackend, SubmitEntry};
use crate::context::{ActionIndex, DeferredAction, ResourceContext};
use crate::loopback::{LoopbackBackend, LoopbackControl};
use crate::operation::{OpHandle, Operation};
use crate::params::OperationParams;

/// Reactor sizing, overridable from the environment.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Operation pool slots (RVT_MAX_OPS).
    pub max_ops: usize,
    /// Context slab slots (RVT_MAX_CONTEXTS).
    pub max_contexts: usize,
    /// Completions drained per poll call (RVT_COMPLETION_BATCH).
    pub completion_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_ops: 1024,
            max_contexts: 256,
            completion_batch: 64,
        }
    }
}

impl ReactorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_ops: env_get("RVT_MAX_OPS", d.max_ops),
            max_contexts: env_get("RVT_MAX_CONTEXTS", d.max_contexts),
            completion_batch: env_get("RVT_COMPLETION_BATCH", d.completion_batch),
        }
    }
}

/// Lifecycle of the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReactorPhase {
    /// Constructed, not started.
    Initial = 0,

    /// Accepting and processing operations.
    Running = 1,

    /// No new operations; in-flight ones run to completion.
    Stopping = 2,

    /// No new operations; in-flight ones are being cancelled.
    Halting = 3,

    /// Backend released. Nothing works anymore.
    Stopped = 4,
}

struct ReactorInner {
    config: ReactorConfig,
    phase: ReactorPhase,
    backend: Box<dyn CompletionBackend>,

    contexts: Vec<Option<ResourceContext>>,
    free_contexts: Vec<u32>,

    /// Fixed-size pool. A slot's Operation must not move while in flight;
    /// the Vec is sized at construction and never pushed to.
    ops: Vec<Option<Operation>>,
    free_ops: Vec<u32>,
    generations: Vec<u32>,

    submit_idx: ActionIndex,
    notify_idx: ActionIndex,
    remove_idx: ActionIndex,
}

/// Cloneable handle to the engine.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<ReactorInner>>,
}

impl Reactor {
    pub fn new(backend: Box<dyn CompletionBackend>, mut config: ReactorConfig) -> Reactor {
        // A zero batch would make the poll loop spin forever.
        config.completion_batch = config.completion_batch.max(1);
        let max_ops = config.max_ops;
        let max_ctx = config.max_contexts;
        let inner = ReactorInner {
            config,
            phase: ReactorPhase::Initial,
            backend,
            contexts: (0..max_ctx).map(|_| None).collect(),
            free_contexts: (0..max_ctx as u32).rev().collect(),
            ops: (0..max_ops).map(|_| None).collect(),
            free_ops: (0..max_ops as u32).rev().collect(),
            generations: vec![0; max_ops],
            submit_idx: ActionIndex::new(DeferredAction::Submit),
            notify_idx: ActionIndex::new(DeferredAction::Notify),
            remove_idx: ActionIndex::new(DeferredAction::Remove),
        };
        Reactor { inner: Rc::new(RefCell::new(inner)) }
    }

    /// Reactor over the deterministic loopback backend.
    pub fn with_loopback(config: ReactorConfig) -> (Reactor, LoopbackControl) {
        let (backend, control) = LoopbackBackend::new(config.max_ops);
        (Reactor::new(Box::new(backend), config), control)
    }

    pub fn start(&self) -> RivetResult<()> {
        let mut r = self.inner.borrow_mut();
        if r.phase != ReactorPhase::Initial {
            return Err(RivetError::AlreadyInitialized);
        }
        r.phase = ReactorPhase::Running;
        rinfo!(
            "reactor started: {} op slots, {} contexts",
            r.config.max_ops,
            r.config.max_contexts
        );
        Ok(())
    }

    pub fn phase(&self) -> ReactorPhase {
        self.inner.borrow().phase
    }

    /// Stop accepting operations; in-flight ones run to completion.
    pub fn stop(&self) {
        let mut r = self.inner.borrow_mut();
        if r.phase == ReactorPhase::Running {
            r.phase = ReactorPhase::Stopping;
            rinfo!("reactor stopping, {} ops live", r.live_ops());
        }
    }

    /// Stop accepting operations and cancel everything in flight.
    pub fn halt(&self) {
        let mut r = self.inner.borrow_mut();
        if matches!(r.phase, ReactorPhase::Running | ReactorPhase::Stopping) {
            r.phase = ReactorPhase::Halting;
            rinfo!("reactor halting, cancelling {} live ops", r.live_ops());
            r.cancel_all();
        }
    }

    /// Release the backend. Only legal once nothing references the
    /// reactor anymore: no attached contexts, no live operations, nothing
    /// in flight. Violating that order is `ShutdownBusy`, not a panic,
    /// because it is reachable from user code.
    pub fn shutdown(&self) -> RivetResult<()> {
        let mut r = self.inner.borrow_mut();
        if r.phase == ReactorPhase::Stopped {
            return Ok(());
        }
        let attached = r
            .contexts
            .iter()
            .flatten()
            .filter(|c| c.is_attached())
            .count();
        if attached > 0 || !r.drained() {
            rwarn!(
                "shutdown refused: {} attached contexts, {} live ops, {} inflight",
                attached,
                r.live_ops(),
                r.backend.inflight()
            );
            return Err(RivetError::ShutdownBusy);
        }
        r.submit_idx.truncate();
        r.notify_idx.truncate();
        r.remove_idx.truncate();
        r.backend.shutdown();
        r.phase = ReactorPhase::Stopped;
        rinfo!("reactor stopped");
        Ok(())
    }

    /// No live operations, nothing queued, nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.inner.borrow().drained()
    }

    /// One engine pass. Returns the number of completions processed.
    pub fn step(&self) -> RivetResult<usize> {
        let mut r = self.inner.borrow_mut();
        if matches!(r.phase, ReactorPhase::Initial | ReactorPhase::Stopped) {
            return Err(RivetError::NotInitialized);
        }
        r.drain_submit()?;
        match r.backend.flush() {
            Ok(_) => {}
            // A busy kernel side is backpressure, not failure: staged
            // entries stay queued and the next pass re-kicks them. Keep
            // going so completions are still drained this step.
            Err(RivetError::RingFull) => rdebug!("flush backpressure, retrying next step"),
            Err(e) => return Err(e),
        }
        let completed = r.poll_completions();
        r.drain_notify();
        r.drain_remove();
        Ok(completed)
    }

    /// Allocate a context for a new resource. Used by `Resource`.
    pub fn create_context(&self) -> RivetResult<CtxId> {
        let mut r = self.inner.borrow_mut();
        if r.phase != ReactorPhase::Running {
            return Err(match r.phase {
                ReactorPhase::Initial => RivetError::NotInitialized,
                _ => RivetError::ShutdownBusy,
            });
        }
        let slot = r.free_contexts.pop().ok_or(RivetError::QueueFull)?;
        let id = CtxId::new(slot);
        r.contexts[slot as usize] = Some(ResourceContext::new(id));
        rtrace!("context {} created", id);
        Ok(id)
    }

    /// Record the descriptor a context is responsible for closing.
    pub fn set_context_fd(&self, id: CtxId, fd: std::os::fd::RawFd) {
        let mut r = self.inner.borrow_mut();
        if let Some(ctx) = r.context_mut(id) {
            ctx.fd = fd;
        }
    }

    /// The user-side resource is gone. Non-daemonized operations it still
    /// has in flight are cancelled (their results have no reader), the
    /// context stays alive until everything drains, and an owned
    /// descriptor is released through a daemonized close operation.
    pub fn detach_context(&self, id: CtxId) {
        let mut r = self.inner.borrow_mut();
        let fd = match r.context_mut(id) {
            Some(ctx) => {
                ctx.detach();
                let fd = ctx.fd;
                ctx.fd = -1;
                fd
            }
            None => return,
        };
        r.cancel_context_ops(id);
        if fd >= 0 && matches!(r.phase, ReactorPhase::Running) {
            // Nobody holds the handle; the op is abandoned by construction
            // and reaped through the normal path.
            match r.spool(id, OperationParams::Close { fd }, true) {
                Ok(_handle) => rdebug!("context {}: daemonized close of fd {}", id, fd),
                Err(e) => {
                    rwarn!("context {}: daemonized close failed ({}), closing inline", id, e);
                    unsafe { libc::close(fd) };
                }
            }
        } else if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        r.reap_context_if_dead(id);
    }

    /// Spool an operation on a context. The operation is submitted to the
    /// backend on the next `step()`.
    pub fn start_operation(&self, ctx: CtxId, params: OperationParams) -> RivetResult<OpHandle> {
        let mut r = self.inner.borrow_mut();
        match r.phase {
            ReactorPhase::Running => {}
            ReactorPhase::Initial => return Err(RivetError::NotInitialized),
            _ => return Err(RivetError::ShutdownBusy),
        }
        r.spool(ctx, params, false)
    }

    /// Like `start_operation`, but the operation survives its resource:
    /// detaching the context does not cancel it.
    pub fn start_daemonized(&self, ctx: CtxId, params: OperationParams) -> RivetResult<OpHandle> {
        let mut r = self.inner.borrow_mut();
        match r.phase {
            ReactorPhase::Running => {}
            ReactorPhase::Initial => return Err(RivetError::NotInitialized),
            _ => return Err(RivetError::ShutdownBusy),
        }
        r.spool(ctx, params, true)
    }

    /// Request cancellation of an operation.
    ///
    /// Too-late cancels (already complete, already being cancelled) are
    /// fine and do nothing. A recycled or unknown key is `StaleHandle`.
    pub fn cancel(&self, id: OpId) -> RivetResult<()> {
        let mut r = self.inner.borrow_mut();
        r.cancel_op(id)
    }

    /// State of an operation, None once reaped.
    pub fn op_state(&self, id: OpId) -> Option<OpState> {
        let r = self.inner.borrow();
        r.op_ref(id).map(|op| op.state())
    }

    pub fn live_op_count(&self) -> usize {
        self.inner.borrow().live_ops()
    }

    pub fn context_count(&self) -> usize {
        self.inner.borrow().contexts.iter().flatten().count()
    }
}

impl ReactorInner {
    fn live_ops(&self) -> usize {
        self.ops.iter().flatten().count()
    }

    fn drained(&self) -> bool {
        self.live_ops() == 0
            && self.backend.inflight() == 0
            && self.submit_idx.is_empty()
            && self.notify_idx.is_empty()
            && self.remove_idx.is_empty()
    }

    fn context_mut(&mut self, id: CtxId) -> Option<&mut ResourceContext> {
        self.contexts.get_mut(id.as_usize())?.as_mut()
    }

    fn op_ref(&self, id: OpId) -> Option<&Operation> {
        let op = self.ops.get(id.slot() as usize)?.as_ref()?;
        (op.id() == id).then_some(op)
    }

    fn op_mut(&mut self, id: OpId) -> Option<&mut Operation> {
        let op = self.ops.get_mut(id.slot() as usize)?.as_mut()?;
        (op.id() == id).then_some(op)
    }

    /// Put a context on an action index, once.
    fn defer(&mut self, id: CtxId, action: DeferredAction) {
        let Some(ctx) = self.contexts.get_mut(id.as_usize()).and_then(Option::as_mut) else {
            return;
        };
        if ctx.deferred.insert(action) {
            match action {
                DeferredAction::Submit => self.submit_idx.push(id),
                DeferredAction::Notify => self.notify_idx.push(id),
                DeferredAction::Remove => self.remove_idx.push(id),
            }
        }
    }

    fn spool(
        &mut self,
        ctx_id: CtxId,
        params: OperationParams,
        daemonized: bool,
    ) -> RivetResult<OpHandle> {
        if self.contexts.get(ctx_id.as_usize()).and_then(Option::as_ref).is_none() {
            return Err(RivetError::StaleHandle);
        }
        let slot = self.free_ops.pop().ok_or(RivetError::QueueFull)?;
        let generation = self.generations[slot as usize].wrapping_add(1);
        self.generations[slot as usize] = generation;
        let id = OpId::new(slot, generation);

        rtrace!("op {:?}: spool {} on context {}", id, params.kind(), ctx_id);
        let (mut op, handle) = Operation::new(id, ctx_id, params);
        if daemonized {
            op.daemonize();
        }
        self.ops[slot as usize] = Some(op);
        if let Some(ctx) = self.context_mut(ctx_id) {
            ctx.add_op(id);
        }
        self.defer(ctx_id, DeferredAction::Submit);
        Ok(handle)
    }

    fn cancel_op(&mut self, id: OpId) -> RivetResult<()> {
        let op = self.op_mut(id).ok_or(RivetError::StaleHandle)?;
        match op.state() {
            OpState::Spooled => {
                // Never reached the backend; complete as cancelled locally.
                let ctx = op.ctx();
                op.request_cancel();
                rdebug!("op {:?}: cancelled before submission", id);
                self.defer(ctx, DeferredAction::Notify);
            }
            OpState::Working => {
                let ctx = op.ctx();
                op.request_cancel();
                rdebug!("op {:?}: cancel spooled", id);
                self.defer(ctx, DeferredAction::Submit);
            }
            // Already cancelling or already done; nothing to do.
            OpState::CancelSpooled
            | OpState::CancelWorking
            | OpState::Complete
            | OpState::Terminal => {}
            OpState::Invalid => unreachable!(),
        }
        Ok(())
    }

    /// Cancel every non-daemonized operation a context still owns.
    fn cancel_context_ops(&mut self, id: CtxId) {
        let victims: Vec<OpId> = match self.contexts.get(id.as_usize()).and_then(Option::as_ref) {
            Some(ctx) => ctx
                .ops()
                .iter()
                .copied()
                .filter(|oid| self.op_ref(*oid).map_or(false, |op| !op.is_daemonized()))
                .collect(),
            None => return,
        };
        for oid in victims {
            let _ = self.cancel_op(oid);
        }
    }

    fn cancel_all(&mut self) {
        let live: Vec<OpId> = self.ops.iter().flatten().map(|op| op.id()).collect();
        for id in live {
            // Only a recycled id can fail here, and we just enumerated.
            let _ = self.cancel_op(id);
        }
    }

    // ── Step 1: SUBMIT drain ──────────────────────────────────────────

    fn drain_submit(&mut self) -> RivetResult<()> {
        let mut cur = self.submit_idx.cursor();
        'contexts: while let Some(cid) = self.submit_idx.next(&mut cur) {
            let op_ids = match self.contexts.get_mut(cid.as_usize()).and_then(Option::as_mut) {
                Some(ctx) => {
                    ctx.deferred.remove(DeferredAction::Submit);
                    ctx.ops().to_vec()
                }
                None => continue,
            };
            for oid in op_ids {
                let Some(op) = self.ops[oid.slot() as usize].as_mut() else { continue };
                if op.id() != oid {
                    continue;
                }
                let outcome = match op.state() {
                    OpState::Spooled => {
                        self.backend.submit(SubmitEntry { key: oid, params: op.params() })
                    }
                    OpState::CancelSpooled => self.backend.cancel(oid),
                    _ => continue,
                };
                match outcome {
                    Ok(()) => {
                        op.mark_submitted();
                        rtrace!("op {:?}: handed to backend", oid);
                    }
                    Err(RivetError::RingFull) => {
                        // Backpressure: re-queue the context and stop the
                        // drain; the rest waits for the next step.
                        rdebug!("ring full, re-queueing context {}", cid);
                        if let Some(ctx) =
                            self.contexts.get_mut(cid.as_usize()).and_then(Option::as_mut)
                        {
                            ctx.deferred.insert(DeferredAction::Submit);
                        }
                        break 'contexts;
                    }
                    Err(e) => {
                        drop(cur);
                        return Err(e);
                    }
                }
            }
        }
        drop(cur);

        let contexts = &self.contexts;
        self.submit_idx.vacuum(|id| {
            contexts
                .get(id.as_usize())
                .and_then(Option::as_ref)
                .map_or(false, |c| c.deferred.contains(DeferredAction::Submit))
        });
        Ok(())
    }

    // ── Step 3: completion poll ───────────────────────────────────────

    fn poll_completions(&mut self) -> usize {
        let empty = Completion { key: OpId::NONE, result: 0, more: false };
        let mut buf = vec![empty; self.config.completion_batch];
        let mut total = 0;
        loop {
            let n = self.backend.poll_completions(&mut buf);
            for c in &buf[..n] {
                self.handle_completion(*c);
            }
            total += n;
            if n < buf.len() {
                return total;
            }
        }
    }

    fn handle_completion(&mut self, c: Completion) {
        let Some(op) = self.op_mut(c.key) else {
            // Slot recycled since the key was minted; the result belongs
            // to an operation that no longer exists.
            rdebug!("stale completion for {:?} dropped (result {})", c.key, c.result);
            return;
        };
        if c.more {
            rtrace!("op {:?}: progress {}", c.key, c.result);
            op.record_progress(c.result);
            return;
        }
        let ctx = op.ctx();
        let state = op.complete(c.result);
        rtrace!("op {:?}: completed with {} -> {}", c.key, c.result, state);
        self.defer(ctx, DeferredAction::Notify);
    }

    // ── Step 4: NOTIFY drain ──────────────────────────────────────────

    fn drain_notify(&mut self) {
        let mut cur = self.notify_idx.cursor();
        while let Some(cid) = self.notify_idx.next(&mut cur) {
            let op_ids = match self.contexts.get_mut(cid.as_usize()).and_then(Option::as_mut) {
                Some(ctx) => {
                    ctx.deferred.remove(DeferredAction::Notify);
                    ctx.ops().to_vec()
                }
                None => continue,
            };
            let mut any_terminal = false;
            for oid in op_ids {
                let Some(op) = self.ops[oid.slot() as usize].as_mut() else { continue };
                if op.id() != oid || op.state() != OpState::Complete {
                    continue;
                }
                op.notify();
                rtrace!("op {:?}: notified", oid);
                any_terminal = true;
            }
            if any_terminal {
                self.defer(cid, DeferredAction::Remove);
            }
        }
        drop(cur);

        let contexts = &self.contexts;
        self.notify_idx.vacuum(|id| {
            contexts
                .get(id.as_usize())
                .and_then(Option::as_ref)
                .map_or(false, |c| c.deferred.contains(DeferredAction::Notify))
        });
    }

    // ── Step 5: REMOVE drain ──────────────────────────────────────────

    fn drain_remove(&mut self) {
        let mut cur = self.remove_idx.cursor();
        while let Some(cid) = self.remove_idx.next(&mut cur) {
            let op_ids = match self.contexts.get_mut(cid.as_usize()).and_then(Option::as_mut) {
                Some(ctx) => {
                    ctx.deferred.remove(DeferredAction::Remove);
                    ctx.ops().to_vec()
                }
                None => continue,
            };
            for oid in op_ids {
                let terminal = self.ops[oid.slot() as usize]
                    .as_ref()
                    .map_or(false, |op| op.id() == oid && op.state() == OpState::Terminal);
                if !terminal {
                    continue;
                }
                // Dropping the Operation here is safe: TERMINAL means the
                // backend is done touching its parameters.
                self.ops[oid.slot() as usize] = None;
                self.free_ops.push(oid.slot());
                if let Some(ctx) = self.context_mut(cid) {
                    ctx.remove_op(oid);
                }
                rtrace!("op {:?}: reaped", oid);
            }
            self.reap_context_if_dead(cid);
        }
        drop(cur);

        let contexts = &self.contexts;
        self.remove_idx.vacuum(|id| {
            contexts
                .get(id.as_usize())
                .and_then(Option::as_ref)
                .map_or(false, |c| c.deferred.contains(DeferredAction::Remove))
        });
    }

    fn reap_context_if_dead(&mut self, id: CtxId) {
        let dead = self
            .contexts
            .get(id.as_usize())
            .and_then(Option::as_ref)
            .map_or(false, |c| !c.is_referenced());
        if dead {
            self.contexts[id.as_usize()] = None;
            self.free_contexts.push(id.as_u32());
            rtrace!("context {} reaped", id);
        }
    }
}
