//! Error types for the buffer pool.
//!
//! Allocation and cleanup failures are returned to the immediate caller, which
//! translates them into its own protocol-level status. Accounting faults found
//! by the debug validator are reported separately through [`Imbalance`].

use thiserror::Error;

use crate::socket::SocketId;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No free descriptors, or the free count is at the reserved threshold.
    #[error("no buffers available")]
    NoBuffers,

    /// The socket was closed or left the established state while the caller
    /// was suspended waiting for buffers.
    #[error("socket closed while waiting for buffers")]
    SocketClosed,

    /// The socket was not open when the request was made.
    #[error("invalid socket: {0}")]
    InvalidSocket(SocketId),

    /// The requested allocation size cannot be satisfied by any chain.
    #[error("invalid size: {0}")]
    InvalidSize(usize),

    /// The pool configuration was rejected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backing storage for the pool could not be obtained.
    #[error("failed to allocate pool storage")]
    OutOfMemory,
}

impl Error {
    /// Returns `true` for errors that clear once buffers are released.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::NoBuffers)
    }
}

/// Accounting fault reported by the debug validator.
///
/// Never corrected automatically: either variant means a descriptor was
/// double-freed or leaked somewhere in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Imbalance {
    /// More descriptors were counted than the pool was built with.
    #[error("too many buffers: found {found}, expected {expected}")]
    TooMany {
        /// Free-list length plus the in-use counter.
        found: usize,
        /// Fixed pool capacity.
        expected: usize,
    },

    /// Fewer descriptors were counted than the pool was built with.
    #[error("too few buffers: found {found}, expected {expected}")]
    TooFew {
        /// Free-list length plus the in-use counter.
        found: usize,
        /// Fixed pool capacity.
        expected: usize,
    },
}
