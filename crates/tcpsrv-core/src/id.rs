//! Identifier types

use core::fmt;

/// Identifier of a listening socket.
///
/// Allocated from a monotonically increasing counter and never reused,
/// even after the socket is closed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SocketId(u32);

impl SocketId {
    /// Create a new SocketId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        SocketId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Readiness token used when registering with the poller.
    #[inline]
    pub const fn as_token(self) -> u64 {
        self.0 as u64
    }

    /// Inverse of [`SocketId::as_token`]. Tokens outside the id range
    /// (such as the wake token) map to `None`.
    #[inline]
    pub fn from_token(token: u64) -> Option<Self> {
        u32::try_from(token).ok().map(SocketId)
    }
}

impl From<u32> for SocketId {
    #[inline]
    fn from(id: u32) -> Self {
        SocketId(id)
    }
}

impl From<SocketId> for u32 {
    #[inline]
    fn from(id: SocketId) -> Self {
        id.0
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketId({})", self.0)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier handed out by a [`ConnectionRegistry`](crate::ConnectionRegistry)
/// for an accepted connection. Opaque to the server-socket core.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
