//! Accept notifications

use crate::error::ErrorInfo;
use crate::id::{ConnectionId, SocketId};

/// One delivery on the persistent accept stream.
///
/// Successes and failures travel through the same stream, so a consumer
/// must not assume one readiness event maps to one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptEvent {
    /// A pending connection was accepted and handed to the connection registry.
    Accepted {
        socket_id: SocketId,
        client_socket_id: ConnectionId,
    },
    /// Accepting failed, or the event loop could not be started.
    ///
    /// `socket_id` is `None` only for event-loop initialization failures.
    Failed {
        socket_id: Option<SocketId>,
        error: ErrorInfo,
    },
}

impl AcceptEvent {
    /// The listening socket this event concerns, if any.
    pub fn socket_id(&self) -> Option<SocketId> {
        match self {
            AcceptEvent::Accepted { socket_id, .. } => Some(*socket_id),
            AcceptEvent::Failed { socket_id, .. } => *socket_id,
        }
    }

    /// The error carried by a failure event.
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            AcceptEvent::Accepted { .. } => None,
            AcceptEvent::Failed { error, .. } => Some(error),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptEvent::Accepted { .. })
    }
}
