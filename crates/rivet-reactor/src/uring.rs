//! io_uring completion backend
//!
//! Maps `OperationParams` onto ring opcodes; the operation key travels in
//! user_data and comes back on the CQE unchanged. Three kinds never touch
//! the ring: ASSIGN, BIND and LISTEN are nonblocking syscalls, executed
//! inline at submit time with their completions queued locally and merged
//! into `poll_completions()` after the next flush, so every operation
//! kind observes the same submit/flush/poll lifecycle.
//!
//! Timer timespecs are boxed and held until the timeout's final CQE: the
//! kernel reads through the pointer for the whole flight. A timeout that
//! expires normally reports -ETIME; that is the timer firing, so it is
//! rewritten to 0 here.
//!
//! Cancel SQEs carry a sentinel user_data. Their acknowledgment CQEs are
//! backend bookkeeping, not operation completions, and are dropped during
//! the poll; the cancelled operation's own CQE (-ECANCELED or its real
//! result) is what the reactor sees.

use std::collections::{HashMap, VecDeque};

use io_uring::{cqueue, opcode, types, IoUring};

use rivet_core::env::env_get;
use rivet_core::error::Errno;
use rivet_core::id::OpId;
use rivet_core::{rdebug, rtrace, RivetError, RivetResult};

use crate::backend::{Completion, CompletionBackend, SubmitEntry};
use crate::params::OperationParams;

/// user_data of cancel SQEs; no operation key ever takes this value.
const CANCEL_TAG: u64 = u64::MAX;

pub struct UringBackend {
    ring: IoUring,
    /// Entries pushed since the last flush (ring and inline both).
    staged: usize,
    /// Flushed, final completion not yet delivered.
    outstanding: usize,
    /// Inline completions awaiting the flush that publishes them.
    staged_inline: Vec<Completion>,
    inline: VecDeque<Completion>,
    /// Timespec storage for in-flight timeouts, keyed by user_data.
    timers: HashMap<u64, Box<types::Timespec>>,
}

impl UringBackend {
    pub fn new(entries: u32) -> RivetResult<UringBackend> {
        let ring = IoUring::new(entries)
            .map_err(|e| RivetError::BackendSetup(e.raw_os_error().unwrap_or(0)))?;
        rdebug!("io_uring ready: {} sq entries", ring.params().sq_entries());
        Ok(UringBackend {
            ring,
            staged: 0,
            outstanding: 0,
            staged_inline: Vec::new(),
            inline: VecDeque::new(),
            timers: HashMap::new(),
        })
    }

    /// Ring sized from RVT_SQ_ENTRIES (default 256).
    pub fn from_env() -> RivetResult<UringBackend> {
        Self::new(env_get("RVT_SQ_ENTRIES", 256u32))
    }

    /// Run a nonblocking syscall now and stage its completion.
    fn inline_op(&mut self, key: OpId, ret: i64) {
        let result = if ret < 0 {
            -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
        } else {
            ret
        };
        self.staged_inline.push(Completion { key, result, more: false });
        self.staged += 1;
    }

    fn push(&mut self, sqe: io_uring::squeue::Entry) -> RivetResult<()> {
        unsafe {
            self.ring
                .submission()
                .push(&sqe)
                .map_err(|_| RivetError::RingFull)?;
        }
        self.staged += 1;
        Ok(())
    }
}

impl CompletionBackend for UringBackend {
    fn submit(&mut self, entry: SubmitEntry<'_>) -> RivetResult<()> {
        let ud = entry.key.as_raw();
        rtrace!("uring: submit {} as {:?}", entry.params.kind(), entry.key);
        match entry.params {
            OperationParams::Nop => {
                self.push(opcode::Nop::new().build().user_data(ud))?;
            }
            OperationParams::Assign { fd } => {
                // Adoption is pure bookkeeping; completes with the fd.
                self.inline_op(entry.key, *fd as i64);
            }
            OperationParams::Close { fd } => {
                self.push(opcode::Close::new(types::Fd(*fd)).build().user_data(ud))?;
            }
            OperationParams::Bind { fd, addr } => {
                let ret = unsafe { libc::bind(*fd, addr.as_ptr(), addr.len()) };
                self.inline_op(entry.key, ret as i64);
            }
            OperationParams::Listen { fd, backlog } => {
                let ret = unsafe { libc::listen(*fd, *backlog) };
                self.inline_op(entry.key, ret as i64);
            }
            OperationParams::Connect { fd, addr } => {
                // addr lives in the operation pool, unmoved until TERMINAL.
                self.push(
                    opcode::Connect::new(types::Fd(*fd), addr.as_ptr(), addr.len())
                        .build()
                        .user_data(ud),
                )?;
            }
            OperationParams::Accept { fd } => {
                self.push(
                    opcode::Accept::new(types::Fd(*fd), std::ptr::null_mut(), std::ptr::null_mut())
                        .build()
                        .user_data(ud),
                )?;
            }
            OperationParams::Send { fd, buf, len } => {
                self.push(
                    opcode::Send::new(types::Fd(*fd), buf.as_ptr(), *len as u32)
                        .build()
                        .user_data(ud),
                )?;
            }
            OperationParams::Receive { fd, buf, len } => {
                self.push(
                    opcode::Recv::new(types::Fd(*fd), buf.as_mut_ptr(), *len as u32)
                        .build()
                        .user_data(ud),
                )?;
            }
            OperationParams::Timer { duration } => {
                let ts = Box::new(
                    types::Timespec::new()
                        .sec(duration.as_secs())
                        .nsec(duration.subsec_nanos()),
                );
                let sqe = opcode::Timeout::new(&*ts as *const types::Timespec)
                    .build()
                    .user_data(ud);
                // Insert before push so a push failure cleans up via remove.
                self.timers.insert(ud, ts);
                if let Err(e) = self.push(sqe) {
                    self.timers.remove(&ud);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> RivetResult<usize> {
        let n = self.staged;
        if !self.staged_inline.is_empty() {
            self.inline.extend(self.staged_inline.drain(..));
        }
        match self.ring.submit() {
            Ok(_) => {}
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                if errno == libc::EBUSY || errno == libc::EAGAIN {
                    return Err(RivetError::RingFull);
                }
                return Err(RivetError::Sys(Errno(errno)));
            }
        }
        self.outstanding += n;
        self.staged = 0;
        Ok(n)
    }

    fn poll_completions(&mut self, buf: &mut [Completion]) -> usize {
        let mut count = 0;

        while count < buf.len() {
            match self.inline.pop_front() {
                Some(c) => {
                    buf[count] = c;
                    count += 1;
                    self.outstanding -= 1;
                }
                None => break,
            }
        }

        while count < buf.len() {
            let cqe = match self.ring.completion().next() {
                Some(c) => c,
                None => break,
            };
            let ud = cqe.user_data();
            if ud == CANCEL_TAG {
                // Ack of a cancel SQE; the target op reports separately.
                continue;
            }
            let more = cqueue::more(cqe.flags());
            let mut result = cqe.result() as i64;
            if !more {
                if self.timers.remove(&ud).is_some() && result == -(libc::ETIME as i64) {
                    result = 0; // timer fired
                }
                self.outstanding -= 1;
            }
            buf[count] = Completion { key: OpId::from_raw(ud), result, more };
            count += 1;
        }
        count
    }

    fn cancel(&mut self, key: OpId) -> RivetResult<()> {
        rtrace!("uring: cancel {:?}", key);
        self.push(
            opcode::AsyncCancel::new(key.as_raw())
                .build()
                .user_data(CANCEL_TAG),
        )?;
        // The cancel SQE is not an operation; its CQE is swallowed in the
        // poll, so it must not enter the outstanding count at flush.
        self.staged -= 1;
        Ok(())
    }

    fn inflight(&self) -> usize {
        self.outstanding + self.staged_inline.len()
    }

    fn capacity(&self) -> usize {
        self.ring.params().sq_entries() as usize
    }

    fn shutdown(&mut self) {
        self.timers.clear();
        self.inline.clear();
        self.staged_inline.clear();
        // Dropping the ring closes it; nothing else to release.
    }
}
