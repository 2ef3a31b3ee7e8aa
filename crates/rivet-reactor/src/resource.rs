//! User-side resource handle
//!
//! A `Resource` is what application code holds: a thin handle that lazily
//! allocates its `ResourceContext` on first use and detaches it on drop.
//! Detaching is not destroying; the reactor keeps the context alive until
//! every operation it owns has drained, and closes any adopted descriptor
//! through a daemonized close operation. Dropping a resource mid-I/O is
//! therefore always safe.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::time::Duration;

use rivet_core::id::CtxId;
use rivet_core::RivetResult;

use crate::operation::OpHandle;
use crate::params::OperationParams;
use crate::reactor::Reactor;

pub struct Resource {
    reactor: Reactor,
    ctx: Cell<CtxId>,
}

impl Resource {
    /// A handle with no context yet. The context is allocated on the
    /// first operation, so an unused resource costs nothing.
    pub fn new(reactor: &Reactor) -> Resource {
        Resource { reactor: reactor.clone(), ctx: Cell::new(CtxId::NONE) }
    }

    /// Context id, allocating on first call.
    pub fn context(&self) -> RivetResult<CtxId> {
        let id = self.ctx.get();
        if id.is_some() {
            return Ok(id);
        }
        let id = self.reactor.create_context()?;
        self.ctx.set(id);
        Ok(id)
    }

    /// Hand a descriptor to the context. It is closed when the resource
    /// winds down, whether or not operations are still in flight.
    pub fn adopt_fd(&self, fd: RawFd) -> RivetResult<()> {
        let ctx = self.context()?;
        self.reactor.set_context_fd(ctx, fd);
        Ok(())
    }

    /// Spool an operation owned by this resource. Dropping the resource
    /// while it is in flight cancels it.
    pub fn submit(&self, params: OperationParams) -> RivetResult<OpHandle> {
        let ctx = self.context()?;
        self.reactor.start_operation(ctx, params)
    }

    /// Spool an operation that survives this resource: dropping the
    /// resource lets it run to completion instead of cancelling it.
    pub fn submit_daemonized(&self, params: OperationParams) -> RivetResult<OpHandle> {
        let ctx = self.context()?;
        self.reactor.start_daemonized(ctx, params)
    }

    pub fn nop(&self) -> RivetResult<OpHandle> {
        self.submit(OperationParams::Nop)
    }

    pub fn timer(&self, duration: Duration) -> RivetResult<OpHandle> {
        self.submit(OperationParams::Timer { duration })
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        let ctx = self.ctx.get();
        if ctx.is_some() {
            self.reactor.detach_context(ctx);
        }
    }
}
