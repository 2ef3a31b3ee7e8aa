//! Error types for the rivet engine
//!
//! Three families, per the engine's taxonomy:
//! - protocol violations (illegal state-machine events, cursor misuse)
//!   are bugs and panic at the point of detection; they never appear here,
//! - system errors arrive from the backend as negative results and are
//!   surfaced as `RivetError::Sys(Errno)`;
//! - exhaustion (`RingFull`, `QueueFull`) is backpressure the caller
//!   retries, not a failure.

use core::fmt;

/// Result type for engine operations
pub type RivetResult<T> = Result<T, RivetError>;

/// Errors that can occur in reactor/executor operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RivetError {
    /// Backend submission queue is full; retry on the next step
    RingFull,

    /// Operation pool or task queue is full; retry later
    QueueFull,

    /// Operation was cancelled before producing a result
    Canceled,

    /// Reactor asked to shut down while resources still reference it
    ShutdownBusy,

    /// Reactor/executor used before initialization
    NotInitialized,

    /// Reactor/executor initialized twice
    AlreadyInitialized,

    /// Stale id: the slot was recycled since this handle was minted
    StaleHandle,

    /// A task body panicked; caught at the executor boundary
    Panicked,

    /// Backend setup failed (errno)
    BackendSetup(i32),

    /// System error from the backend or a raw syscall
    Sys(Errno),
}

impl fmt::Display for RivetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RivetError::RingFull => write!(f, "submission ring full"),
            RivetError::QueueFull => write!(f, "queue full"),
            RivetError::Canceled => write!(f, "operation cancelled"),
            RivetError::ShutdownBusy => {
                write!(f, "shutdown refused: resources still attached")
            }
            RivetError::NotInitialized => write!(f, "not initialized"),
            RivetError::AlreadyInitialized => write!(f, "already initialized"),
            RivetError::StaleHandle => write!(f, "stale operation handle"),
            RivetError::Panicked => write!(f, "task panicked"),
            RivetError::BackendSetup(e) => write!(f, "backend setup: errno {}", e),
            RivetError::Sys(e) => write!(f, "system error: {}", e),
        }
    }
}

impl std::error::Error for RivetError {}

/// A raw OS error number, as carried in negative backend results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Errno(pub i32);

impl Errno {
    /// Interpret a signed backend result: negative values encode `-errno`,
    /// anything else is the success payload (byte count, fd, ...).
    #[inline]
    pub fn check(result: i64) -> Result<i64, Errno> {
        if result < 0 {
            Err(Errno((-result) as i32))
        } else {
            Ok(result)
        }
    }

    /// Encode back into the backend's signed-result convention.
    #[inline]
    pub const fn as_result(self) -> i64 {
        -(self.0 as i64)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl From<Errno> for RivetError {
    fn from(e: Errno) -> Self {
        RivetError::Sys(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_check() {
        assert_eq!(Errno::check(12), Ok(12));
        assert_eq!(Errno::check(0), Ok(0));
        assert_eq!(Errno::check(-11), Err(Errno(11)));
    }

    #[test]
    fn test_errno_round_trip() {
        let e = Errno(125);
        assert_eq!(Errno::check(e.as_result()), Err(e));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", RivetError::RingFull), "submission ring full");
        assert_eq!(
            format!("{}", RivetError::Sys(Errno(9))),
            "system error: errno 9"
        );
    }
}
