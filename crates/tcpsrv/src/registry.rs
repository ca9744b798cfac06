//! Socket registry: concurrent id → socket map with monotonic id allocation.
//!
//! Any thread may create, update, look up and list sockets. Removal is
//! reserved to the event loop, which performs it only after cancelling the
//! socket's registration and closing its channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::error;
use tcpsrv_core::{Result, ServerSocketError, SocketId, SocketInfo, SocketProperties};

use crate::socket::ListeningSocket;

#[derive(Debug, Default)]
pub struct SocketRegistry {
    sockets: DashMap<SocketId, Arc<ListeningSocket>>,
    next_id: AtomicU32,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and insert an unbound socket with `properties`
    /// applied over the defaults.
    pub fn create(&self, properties: &SocketProperties) -> SocketId {
        let id = SocketId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let socket = Arc::new(ListeningSocket::new(id, properties));
        self.sockets.insert(id, socket);
        id
    }

    /// Update descriptive metadata only.
    pub fn update(&self, id: SocketId, properties: &SocketProperties) -> Result<()> {
        self.get(id)?.set_properties(properties);
        Ok(())
    }

    /// Look up a socket, logging when the id is unknown.
    pub fn get(&self, id: SocketId) -> Result<Arc<ListeningSocket>> {
        self.lookup(id).ok_or_else(|| {
            error!("No socket with socketId {}", id);
            ServerSocketError::NotFound(id)
        })
    }

    /// Silent lookup, for the event loop's readiness dispatch.
    pub(crate) fn lookup(&self, id: SocketId) -> Option<Arc<ListeningSocket>> {
        self.sockets.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, id: SocketId) -> Option<Arc<ListeningSocket>> {
        self.sockets.remove(&id).map(|(_, socket)| socket)
    }

    /// Remove and return every socket. Used at teardown when no event loop
    /// is running (so no registrations exist).
    pub(crate) fn drain(&self) -> Vec<Arc<ListeningSocket>> {
        let ids: Vec<SocketId> = self.sockets.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Every socket currently registered, ordered by id.
    pub fn sockets(&self) -> Vec<Arc<ListeningSocket>> {
        let mut sockets: Vec<_> = self.sockets.iter().map(|entry| entry.value().clone()).collect();
        sockets.sort_by_key(|socket| socket.id());
        sockets
    }

    /// Snapshots of every socket, ordered by id.
    pub fn list(&self) -> Vec<SocketInfo> {
        self.sockets().iter().map(|socket| socket.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_create_applies_properties() {
        let registry = SocketRegistry::new();
        let id = registry.create(&SocketProperties::new().name("a").persistent(true));
        let info = registry.get(id).unwrap().info();
        assert_eq!(info.name, "a");
        assert!(info.persistent);
        assert!(!info.paused);
    }

    #[test]
    fn test_ids_increase_and_are_not_reused() {
        let registry = SocketRegistry::new();
        let a = registry.create(&SocketProperties::default());
        let b = registry.create(&SocketProperties::default());
        assert!(b > a);

        registry.remove(b);
        let c = registry.create(&SocketProperties::default());
        assert!(c > b);
    }

    #[test]
    fn test_concurrent_create_unique_ids() {
        let registry = Arc::new(SocketRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| registry.create(&SocketProperties::default()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {:?}", id);
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(registry.len(), 800);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let registry = SocketRegistry::new();
        let err = registry
            .update(SocketId::new(42), &SocketProperties::new().name("x"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_update_keeps_unset_fields() {
        let registry = SocketRegistry::new();
        let id = registry.create(&SocketProperties::new().name("keep"));
        registry.update(id, &SocketProperties::new().persistent(true)).unwrap();
        let info = registry.get(id).unwrap().info();
        assert_eq!(info.name, "keep");
        assert!(info.persistent);
    }

    #[test]
    fn test_list_sorted_and_excludes_removed() {
        let registry = SocketRegistry::new();
        let ids: Vec<_> = (0..5).map(|_| registry.create(&SocketProperties::default())).collect();
        registry.remove(ids[2]);

        let listed: Vec<_> = registry.list().into_iter().map(|info| info.socket_id).collect();
        assert_eq!(listed, vec![ids[0], ids[1], ids[3], ids[4]]);
        assert!(registry.get(ids[2]).is_err());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = SocketRegistry::new();
        registry.create(&SocketProperties::default());
        registry.create(&SocketProperties::default());
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
