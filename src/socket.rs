//! Interface to the socket layer.
//!
//! The pool never owns sockets. The zero-copy allocation path only needs to
//! know how large one protocol unit may be and, after a suspension, whether
//! the socket it was serving is still the same open instance.

use std::fmt;

/// Socket descriptor as handed out by the socket layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport a socket sends through, which decides how an allocation is cut
/// into protocol units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Connection-oriented stream; each unit carries at most `mss` bytes.
    Stream {
        /// Peer's maximum segment size.
        mss: usize,
    },
    /// Connectionless datagrams; the whole request is one unit.
    Datagram,
    /// Raw IP; the whole request is one unit.
    Raw,
}

impl Transport {
    /// Largest payload a single unit may carry, or `None` when uncapped.
    #[must_use]
    pub const fn unit_cap(self) -> Option<usize> {
        match self {
            Self::Stream { mss } => Some(mss),
            Self::Datagram | Self::Raw => None,
        }
    }

    /// Returns `true` for connection-oriented transports.
    #[must_use]
    pub const fn is_connection_oriented(self) -> bool {
        matches!(self, Self::Stream { .. })
    }
}

/// Point-in-time view of an open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSnapshot {
    /// Instance identifier; changes whenever the descriptor is reused.
    pub generation: u64,
    /// Transport the socket sends through.
    pub transport: Transport,
    /// Whether a connection-oriented socket is in the established state.
    /// Ignored for connectionless transports.
    pub established: bool,
}

impl SocketSnapshot {
    /// Returns `true` if the socket is in a state that allows sending:
    /// always for connectionless transports, only once established for
    /// connection-oriented ones.
    #[must_use]
    pub const fn can_send(&self) -> bool {
        !self.transport.is_connection_oriented() || self.established
    }

    /// Returns `true` if `self` still describes the instance captured in
    /// `before` and that instance can keep sending.
    #[must_use]
    pub const fn still_valid(&self, before: &Self) -> bool {
        self.generation == before.generation && self.can_send()
    }
}

/// Lookup from descriptor to the socket currently occupying it.
///
/// Implemented by the socket layer. Calls happen from task context only.
pub trait SocketRegistry: Send + Sync {
    /// Returns the current view of `socket`, or `None` if it is closed.
    fn snapshot(&self, socket: SocketId) -> Option<SocketSnapshot>;
}
