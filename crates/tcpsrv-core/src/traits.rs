//! Collaborator seams.
//!
//! The event loop depends on these traits, never on concrete types.

use std::io;
use std::net::TcpStream;

use crate::id::ConnectionId;

/// Interrupts a blocked readiness wait.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the loop wakes are coalesced into one wakeup.
/// - Called by every producer right after it enqueues a control message.
pub trait Notifier: Send + Sync {
    /// Signal the event loop to return from its readiness wait.
    fn notify(&self) -> io::Result<()>;
}

/// Takes ownership of accepted connections.
///
/// Invoked only on the event loop thread, once per accepted connection.
/// The returned id is forwarded to accept subscribers.
pub trait ConnectionRegistry: Send + Sync {
    fn register_accepted(&self, stream: TcpStream) -> ConnectionId;
}
