//! Loopback backend: deterministic in-process completion source
//!
//! Completes every submission locally, after a configurable number of
//! poll passes, or only on explicit instruction in manual mode. Used by
//! the engine's own tests and as the default backend on platforms without
//! io_uring. Deliberately boring: no threads, no time, no syscalls.
//!
//! `LoopbackControl` is a second handle onto the same state, letting a
//! test keep poking the backend after the reactor has boxed it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rivet_core::id::OpId;
use rivet_core::{RivetError, RivetResult};

use crate::backend::{Completion, CompletionBackend, SubmitEntry};
use crate::params::OperationParams;

struct Pending {
    key: OpId,
    result: i64,
    /// Poll passes left before completing; None = complete only manually.
    delay: Option<u32>,
}

struct LoopbackState {
    staged: Vec<Pending>,
    pending: Vec<Pending>,
    ready: VecDeque<Completion>,
    capacity: usize,
    latency: u32,
    manual: bool,
    submitted: Vec<OpId>,
    canceled: Vec<OpId>,
}

/// The backend half. Box this into a reactor.
pub struct LoopbackBackend {
    state: Rc<RefCell<LoopbackState>>,
}

/// The test half. Shares state with the boxed backend.
#[derive(Clone)]
pub struct LoopbackControl {
    state: Rc<RefCell<LoopbackState>>,
}

impl LoopbackBackend {
    pub fn new(capacity: usize) -> (LoopbackBackend, LoopbackControl) {
        let state = Rc::new(RefCell::new(LoopbackState {
            staged: Vec::new(),
            pending: Vec::new(),
            ready: VecDeque::new(),
            capacity,
            latency: 0,
            manual: false,
            submitted: Vec::new(),
            canceled: Vec::new(),
        }));
        (
            LoopbackBackend { state: state.clone() },
            LoopbackControl { state },
        )
    }

    /// What a submission would complete with, absent interference.
    fn default_result(params: &OperationParams) -> i64 {
        match params {
            OperationParams::Nop => 0,
            OperationParams::Assign { fd } => *fd as i64,
            OperationParams::Close { .. } => 0,
            OperationParams::Bind { .. } => 0,
            OperationParams::Listen { .. } => 0,
            OperationParams::Connect { .. } => 0,
            OperationParams::Accept { .. } => 0,
            OperationParams::Send { len, .. } => *len as i64,
            OperationParams::Receive { len, .. } => *len as i64,
            OperationParams::Timer { .. } => 0,
        }
    }
}

impl CompletionBackend for LoopbackBackend {
    fn submit(&mut self, entry: SubmitEntry<'_>) -> RivetResult<()> {
        let mut st = self.state.borrow_mut();
        if st.staged.len() + st.pending.len() >= st.capacity {
            return Err(RivetError::RingFull);
        }
        let result = Self::default_result(entry.params);
        let delay = if st.manual { None } else { Some(st.latency) };
        st.staged.push(Pending { key: entry.key, result, delay });
        st.submitted.push(entry.key);
        Ok(())
    }

    fn flush(&mut self) -> RivetResult<usize> {
        let mut st = self.state.borrow_mut();
        let n = st.staged.len();
        let staged = std::mem::take(&mut st.staged);
        st.pending.extend(staged);
        Ok(n)
    }

    fn poll_completions(&mut self, buf: &mut [Completion]) -> usize {
        let mut st = self.state.borrow_mut();

        // Age pending entries; due ones become ready in submission order.
        let mut still = Vec::with_capacity(st.pending.len());
        for mut p in st.pending.drain(..).collect::<Vec<_>>() {
            match p.delay {
                None => still.push(p), // manual
                Some(0) => st.ready.push_back(Completion {
                    key: p.key,
                    result: p.result,
                    more: false,
                }),
                Some(d) => {
                    p.delay = Some(d - 1);
                    still.push(p);
                }
            }
        }
        st.pending = still;

        let mut count = 0;
        while count < buf.len() {
            match st.ready.pop_front() {
                Some(c) => {
                    buf[count] = c;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn cancel(&mut self, key: OpId) -> RivetResult<()> {
        let mut st = self.state.borrow_mut();
        st.canceled.push(key);
        // If the operation is still pending the cancel wins; if it already
        // made it to the ready queue the cancel lost the race and its
        // normal completion stands.
        if let Some(pos) = st.pending.iter().position(|p| p.key == key) {
            let p = st.pending.remove(pos);
            st.ready.push_back(Completion {
                key: p.key,
                result: -(libc::ECANCELED as i64),
                more: false,
            });
        }
        Ok(())
    }

    fn inflight(&self) -> usize {
        let st = self.state.borrow();
        st.staged.len() + st.pending.len() + st.ready.len()
    }

    fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    fn shutdown(&mut self) {
        let mut st = self.state.borrow_mut();
        st.staged.clear();
        st.pending.clear();
        st.ready.clear();
    }
}

impl LoopbackControl {
    /// Complete every submission only on an explicit `complete()` call.
    pub fn set_manual(&self, manual: bool) {
        self.state.borrow_mut().manual = manual;
    }

    /// Poll passes a submission waits before completing (non-manual mode).
    pub fn set_latency(&self, polls: u32) {
        self.state.borrow_mut().latency = polls;
    }

    /// Complete a held operation with the given result.
    /// Returns false when the key is not pending.
    pub fn complete(&self, key: OpId, result: i64) -> bool {
        let mut st = self.state.borrow_mut();
        match st.pending.iter().position(|p| p.key == key) {
            Some(pos) => {
                let p = st.pending.remove(pos);
                st.ready.push_back(Completion { key: p.key, result, more: false });
                true
            }
            None => false,
        }
    }

    /// Push an extra completion for a key (multi-shot simulation).
    pub fn push_completion(&self, key: OpId, result: i64, more: bool) {
        self.state
            .borrow_mut()
            .ready
            .push_back(Completion { key, result, more });
    }

    /// Every key that ever reached `submit()`.
    pub fn submitted(&self) -> Vec<OpId> {
        self.state.borrow().submitted.clone()
    }

    /// Every key a cancel-by-key was requested for.
    pub fn canceled(&self) -> Vec<OpId> {
        self.state.borrow().canceled.clone()
    }
}
