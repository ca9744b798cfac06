//! Socket properties and snapshots

use crate::id::SocketId;

/// Descriptive properties accepted by `create` and `update`.
///
/// Fields left as `None` are not touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketProperties {
    /// Keep the socket open across application lifecycle resets
    pub persistent: Option<bool>,
    /// Application-defined label
    pub name: Option<String>,
}

impl SocketProperties {
    pub fn new() -> Self {
        Self::default()
    }

    // Builder methods

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// True when applying these properties would change nothing.
    pub fn is_empty(&self) -> bool {
        self.persistent.is_none() && self.name.is_none()
    }
}

/// Read-only snapshot of a listening socket, as returned by `get_info`
/// and `get_sockets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub socket_id: SocketId,
    pub persistent: bool,
    pub name: String,
    pub paused: bool,
    /// Present only while the socket holds a bound channel
    pub local_address: Option<String>,
    /// Present only while the socket holds a bound channel
    pub local_port: Option<u16>,
}

impl SocketInfo {
    /// Whether the socket currently holds a bound channel.
    pub fn is_listening(&self) -> bool {
        self.local_port.is_some()
    }
}
