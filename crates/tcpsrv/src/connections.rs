//! Default connection registry: parks accepted streams under fresh ids.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tcpsrv_core::{ConnectionId, ConnectionRegistry};

/// Accepted connections waiting to be claimed by the connection layer.
///
/// Streams stay here until [`ConnectionTable::take`] claims them; nothing
/// evicts them, so a consumer that never takes its connections makes the
/// table (and the open descriptors) grow without bound.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    streams: Mutex<HashMap<ConnectionId, TcpStream>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an accepted stream; each id can be taken once.
    pub fn take(&self, id: ConnectionId) -> Option<TcpStream> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, TcpStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionRegistry for ConnectionTable {
    fn register_accepted(&self, stream: TcpStream) -> ConnectionId {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, stream);
        id
    }
}
