//! Nonblocking sockets on top of `Resource`
//!
//! Descriptor creation and socket options are plain syscalls (they never
//! block); everything that can block goes through the reactor as an
//! operation. A `Socket` owns a `Resource`, so dropping it detaches the
//! context and the descriptor is closed by a daemonized close operation
//! once in-flight I/O drains.

use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockProtocol, SockType};

use rivet_core::error::Errno;
use rivet_core::{RivetError, RivetResult};

use crate::operation::OpHandle;
use crate::params::{Address, BufferHandle, OperationParams};
use crate::reactor::Reactor;
use crate::resource::Resource;

fn sys(e: nix::errno::Errno) -> RivetError {
    RivetError::Sys(Errno(e as i32))
}

pub struct Socket {
    res: Resource,
    fd: RawFd,
}

impl Socket {
    /// Nonblocking close-on-exec TCP socket.
    pub fn tcp(reactor: &Reactor) -> RivetResult<Socket> {
        Self::open(reactor, SockType::Stream, SockProtocol::Tcp)
    }

    /// Nonblocking close-on-exec UDP socket.
    pub fn udp(reactor: &Reactor) -> RivetResult<Socket> {
        Self::open(reactor, SockType::Datagram, SockProtocol::Udp)
    }

    fn open(reactor: &Reactor, ty: SockType, proto: SockProtocol) -> RivetResult<Socket> {
        let owned = socket::socket(
            AddressFamily::Inet,
            ty,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            proto,
        )
        .map_err(sys)?;
        let fd = owned.into_raw_fd();

        let res = Resource::new(reactor);
        if let Err(e) = res.adopt_fd(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(Socket { res, fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_reuseaddr(&self, on: bool) -> RivetResult<()> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        socket::setsockopt(&fd, sockopt::ReuseAddr, &on).map_err(sys)
    }

    pub fn bind(&self, addr: Address) -> RivetResult<OpHandle> {
        self.res.submit(OperationParams::Bind { fd: self.fd, addr })
    }

    pub fn listen(&self, backlog: i32) -> RivetResult<OpHandle> {
        self.res.submit(OperationParams::Listen { fd: self.fd, backlog })
    }

    pub fn connect(&self, addr: Address) -> RivetResult<OpHandle> {
        self.res.submit(OperationParams::Connect { fd: self.fd, addr })
    }

    /// Completes with the accepted descriptor.
    pub fn accept(&self) -> RivetResult<OpHandle> {
        self.res.submit(OperationParams::Accept { fd: self.fd })
    }

    /// Completes with bytes sent. The buffer stays pinned until then.
    pub fn send(&self, buf: &BufferHandle, len: usize) -> RivetResult<OpHandle> {
        self.res.submit(OperationParams::Send { fd: self.fd, buf: buf.share(), len })
    }

    /// Completes with bytes received.
    pub fn receive(&self, buf: &BufferHandle, len: usize) -> RivetResult<OpHandle> {
        self.res.submit(OperationParams::Receive { fd: self.fd, buf: buf.share(), len })
    }

    pub fn resource(&self) -> &Resource {
        &self.res
    }
}
