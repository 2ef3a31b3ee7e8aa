//! Operation parameters, addresses and I/O buffers
//!
//! `OperationParams` is the closed set of operation kinds the engine
//! understands. It is a plain sum type: the one place a backend turns
//! parameters into a submission entry is an exhaustive match, so adding a
//! kind is a compile-time checklist, not a virtual-dispatch hunt.
//!
//! Buffers for SEND/RECEIVE are opaque shared handles. The engine never
//! allocates raw I/O memory itself; it pins whatever handle it was given
//! until the operation reaches TERMINAL, because the kernel side of an
//! in-flight request may still read or write through the pointer.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// A socket address as the OS lays it out.
///
/// Plain value type passed into CONNECT/BIND/ACCEPT parameters. The engine
/// treats it as an opaque byte-sized structure; only the backend hands its
/// pointer to the kernel.
#[derive(Clone, Copy)]
pub struct Address {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl Address {
    /// Build an IPv4 TCP/UDP address.
    pub fn ipv4(octets: [u8; 4], port: u16) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
        unsafe {
            (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
            (*sin).sin_port = port.to_be();
            (*sin).sin_addr.s_addr = u32::from_be_bytes(octets).to_be();
        }
        Self {
            storage,
            len: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        }
    }

    /// INADDR_ANY on the given port.
    pub fn any(port: u16) -> Self {
        Self::ipv4([0, 0, 0, 0], port)
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    #[inline]
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(family={}, len={})", self.storage.ss_family, self.len)
    }
}

/// Shared, reference-counted I/O buffer.
///
/// `share()` duplicates the handle without copying the bytes; the storage
/// is freed when the last handle drops. The raw pointer accessors exist
/// for the backend only: while an operation using this buffer is in
/// flight, the kernel may write through `as_mut_ptr`, which is why an
/// abandoned operation must be reaped only after TERMINAL.
#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    /// Data pointer of the boxed slice, taken before the box is stored.
    /// Moving the box does not move the allocation, so it stays valid;
    /// all access goes through it. No accessor ever forms a `&[u8]` into
    /// the storage, because the kernel may be writing through this
    /// pointer while an operation is in flight.
    ptr: *mut u8,
    len: usize,
    /// Owning allocation, kept alive for `ptr`. Never read directly.
    _data: std::cell::UnsafeCell<Box<[u8]>>,
}

// Safety: the engine is single-threaded per region; a buffer crossing a
// region boundary is handed over whole (the sender stops touching it), and
// concurrent kernel writes only ever happen through one in-flight op.
unsafe impl Send for BufferInner {}
unsafe impl Sync for BufferInner {}

impl BufferHandle {
    fn from_boxed(mut data: Box<[u8]>) -> Self {
        let ptr = data.as_mut_ptr();
        let len = data.len();
        Self {
            inner: Arc::new(BufferInner {
                ptr,
                len,
                _data: std::cell::UnsafeCell::new(data),
            }),
        }
    }

    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_boxed(vec![0u8; len].into_boxed_slice())
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_boxed(bytes.to_vec().into_boxed_slice())
    }

    /// Duplicate the handle (reference-counted, no copy).
    pub fn share(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend-only: raw read pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.ptr
    }

    /// Backend-only: raw write pointer.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.ptr
    }

    /// Snapshot the first `n` bytes. Call only when no operation using
    /// this buffer is in flight.
    pub fn to_vec(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.len());
        let mut out = vec![0u8; n];
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr(), out.as_mut_ptr(), n);
        }
        out
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferHandle(len={}, refs={})", self.len(), Arc::strong_count(&self.inner))
    }
}

/// Parameters of one operation, keyed by kind.
#[derive(Debug)]
pub enum OperationParams {
    /// No-op; completes with 0. Useful for wakeups and plumbing tests.
    Nop,

    /// Adopt an externally created descriptor; completes with the fd.
    Assign { fd: RawFd },

    /// Close a descriptor.
    Close { fd: RawFd },

    /// Bind a socket to an address.
    Bind { fd: RawFd, addr: Address },

    /// Mark a socket passive.
    Listen { fd: RawFd, backlog: i32 },

    /// Connect a socket.
    Connect { fd: RawFd, addr: Address },

    /// Accept one connection; completes with the new fd.
    Accept { fd: RawFd },

    /// Send from a shared buffer; completes with bytes sent.
    Send { fd: RawFd, buf: BufferHandle, len: usize },

    /// Receive into a shared buffer; completes with bytes received.
    Receive { fd: RawFd, buf: BufferHandle, len: usize },

    /// Fire after a duration. Timeouts are ordinary operations racing
    /// whatever they guard; there is no separate timer mechanism.
    Timer { duration: Duration },
}

impl OperationParams {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OperationParams::Nop => "nop",
            OperationParams::Assign { .. } => "assign",
            OperationParams::Close { .. } => "close",
            OperationParams::Bind { .. } => "bind",
            OperationParams::Listen { .. } => "listen",
            OperationParams::Connect { .. } => "connect",
            OperationParams::Accept { .. } => "accept",
            OperationParams::Send { .. } => "send",
            OperationParams::Receive { .. } => "receive",
            OperationParams::Timer { .. } => "timer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_share_is_refcounted() {
        let a = BufferHandle::from_slice(b"hello");
        let b = a.share();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(b.to_vec(5), b"hello");
    }

    #[test]
    fn test_raw_writes_visible_through_shared_handle() {
        // Models the kernel filling a receive buffer: bytes arrive through
        // the raw pointer, every handle sees them, len is untouched.
        let a = BufferHandle::zeroed(4);
        let b = a.share();
        unsafe {
            std::ptr::copy_nonoverlapping(b"ping".as_ptr(), a.as_mut_ptr(), 4);
        }
        assert_eq!(a.len(), 4);
        assert_eq!(b.to_vec(4), b"ping");
    }

    #[test]
    fn test_ipv4_address_layout() {
        let addr = Address::ipv4([127, 0, 0, 1], 8080);
        assert_eq!(addr.len() as usize, std::mem::size_of::<libc::sockaddr_in>());
        let sin = unsafe { &*(addr.as_ptr() as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
    }

    #[test]
    fn test_params_kind_tags() {
        assert_eq!(OperationParams::Nop.kind(), "nop");
        assert_eq!(
            OperationParams::Timer { duration: Duration::from_millis(1) }.kind(),
            "timer"
        );
    }
}
