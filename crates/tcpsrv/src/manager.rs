//! `ServerSocketManager`: the public facade.
//!
//! One manager owns the socket registry, the control queue, the accept
//! sink and (once someone subscribes) the event loop thread. Metadata
//! operations run on the caller's thread; anything that touches a
//! readiness registration is enqueued for the loop and answered through a
//! [`Completion`].
//!
//! ```rust,ignore
//! use tcpsrv::{ManagerConfig, ServerSocketManager, SocketProperties};
//!
//! let manager = ServerSocketManager::new(ManagerConfig::from_env())?;
//! let accepts = manager.subscribe_accept_notifications();
//! let id = manager.create(&SocketProperties::default().name("api"));
//! manager.listen(id, "127.0.0.1", 9000, Some(128))?;
//! for event in accepts.iter() {
//!     log::info!("{:?}", event);
//! }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tcpsrv_core::{
    AcceptEvent, ConnectionRegistry, Result, ServerSocketError, SocketId, SocketInfo, SocketProperties,
};

use crate::config::ManagerConfig;
use crate::connections::ConnectionTable;
use crate::event_loop::{EventLoop, LoopHandle, LoopShared};
use crate::queue::{Command, Completion, ControlQueue};
use crate::registry::SocketRegistry;
use crate::sink::{AcceptSink, AcceptStream};

pub struct ServerSocketManager {
    config: ManagerConfig,
    shared: LoopShared,
    event_loop: Mutex<Option<LoopHandle>>,
}

impl ServerSocketManager {
    /// Create a manager that parks accepted connections in a
    /// [`ConnectionTable`].
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_connection_registry(config, Arc::new(ConnectionTable::new()))
    }

    /// Create a manager configured from the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(ManagerConfig::from_env())
    }

    /// Create a manager that hands accepted connections to `connections`.
    pub fn with_connection_registry(
        config: ManagerConfig,
        connections: Arc<dyn ConnectionRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        debug!("server socket manager created: {:?}", config);
        Ok(Self {
            config,
            shared: LoopShared {
                registry: Arc::new(SocketRegistry::new()),
                queue: Arc::new(ControlQueue::new()),
                sink: Arc::new(AcceptSink::new()),
                connections,
            },
            event_loop: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ── Metadata (caller thread) ─────────────────────────────────────

    /// Allocate a new listening socket. It has no channel until [`listen`].
    ///
    /// [`listen`]: Self::listen
    pub fn create(&self, properties: &SocketProperties) -> SocketId {
        self.shared.registry.create(properties)
    }

    /// Overwrite the fields present in `properties`.
    pub fn update(&self, id: SocketId, properties: &SocketProperties) -> Result<()> {
        self.shared.registry.update(id, properties)
    }

    /// Pause or resume accepting.
    ///
    /// Pausing takes effect immediately; the loop drops the socket's accept
    /// interest the next time it reports ready. Resuming restores the
    /// interest on the loop, and the returned completion resolves once it
    /// has. A connection that raced with the pause may still be accepted.
    pub fn set_paused(&self, id: SocketId, paused: bool) -> Result<Completion> {
        let socket = self.shared.registry.get(id)?;
        socket.set_paused(paused);
        if paused {
            return Ok(Completion::ready(Ok(())));
        }
        Ok(self.shared.queue.submit(Command::AddAcceptInterest(socket)))
    }

    /// Bind and listen, then hand the channel to the loop.
    ///
    /// The result is that of the bind; registration happens asynchronously
    /// and failures there are only logged. `backlog` of `None` or `<= 0`
    /// falls back to the configured default.
    pub fn listen(&self, id: SocketId, address: &str, port: u16, backlog: Option<i32>) -> Result<()> {
        let socket = self.shared.registry.get(id)?;
        let ip: IpAddr = address
            .parse()
            .map_err(|_| ServerSocketError::InvalidArgument(format!("{:?} is not an IP address", address)))?;
        let backlog = self.config.effective_backlog(backlog);

        let local = socket.listen(SocketAddr::new(ip, port), backlog, self.config.reuse_address)?;
        info!("socket {} listening on {} (backlog {})", id, local, backlog);

        self.shared.queue.post(Command::Listen(socket));
        Ok(())
    }

    /// Cancel the registration and close the channel. The id stays valid
    /// and the socket can listen again.
    pub fn disconnect(&self, id: SocketId) -> Result<Completion> {
        let socket = self.shared.registry.get(id)?;
        Ok(self.shared.queue.submit(Command::Disconnect(socket)))
    }

    /// Disconnect and forget the socket.
    pub fn close(&self, id: SocketId) -> Result<Completion> {
        let socket = self.shared.registry.get(id)?;
        Ok(self.shared.queue.submit(Command::Close(socket)))
    }

    pub fn get_info(&self, id: SocketId) -> Result<SocketInfo> {
        Ok(self.shared.registry.get(id)?.info())
    }

    /// Snapshots of every socket, ordered by id.
    pub fn get_sockets(&self) -> Vec<SocketInfo> {
        self.shared.registry.list()
    }

    // ── Accept notifications / loop lifecycle ────────────────────────

    /// Subscribe to accept notifications, starting the event loop if it is
    /// not running.
    ///
    /// A previous subscription is replaced and its stream ends. If the loop
    /// cannot be started the stream receives a single
    /// [`AcceptEvent::Failed`] with code -9 and no socket id.
    pub fn subscribe_accept_notifications(&self) -> AcceptStream {
        self.subscribe_with(Self::ensure_loop)
    }

    fn subscribe_with(&self, start: impl FnOnce(&Self) -> Result<()>) -> AcceptStream {
        let stream = self.shared.sink.subscribe();
        if let Err(e) = start(self) {
            error!("failed to start event loop: {}", e);
            self.shared.sink.emit(AcceptEvent::Failed {
                socket_id: None,
                error: e.error_info(),
            });
        }
        stream
    }

    /// End the current subscription. Later accept events are dropped.
    pub fn unsubscribe(&self) {
        self.shared.sink.unsubscribe();
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.sink.is_subscribed()
    }

    pub fn is_running(&self) -> bool {
        self.lock_loop().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the loop thread and wait for it. Sockets stay bound; the next
    /// subscription restarts the loop and re-registers them.
    pub fn stop_event_loop(&self) {
        let mut event_loop = self.lock_loop();
        if let Some(handle) = event_loop.take() {
            self.stop_and_join(handle);
        }
    }

    /// Close every socket, stop the loop and end the subscription.
    ///
    /// Commands still queued afterwards are discarded and their completions
    /// resolve to [`ServerSocketError::LoopStopped`]. Safe to call twice.
    pub fn shutdown(&self) {
        let mut event_loop = self.lock_loop();
        if let Some(handle) = event_loop.take() {
            if !handle.is_finished() {
                for socket in self.shared.registry.sockets() {
                    self.shared.queue.post(Command::Close(socket));
                }
            }
            self.stop_and_join(handle);
        }

        // Whatever the loop did not get to: no registrations remain, so the
        // channels can be closed from here.
        for socket in self.shared.registry.drain() {
            if let Err(e) = socket.close_channel() {
                warn!("closing socket {} failed: {}", socket.id(), e);
            }
        }
        let discarded = self.shared.queue.discard_pending();
        if discarded > 0 {
            debug!("discarded {} pending control messages", discarded);
        }
        self.shared.sink.unsubscribe();
    }

    fn ensure_loop(&self) -> Result<()> {
        let mut event_loop = self.lock_loop();
        match event_loop.take() {
            Some(handle) if !handle.is_finished() => {
                *event_loop = Some(handle);
                return Ok(());
            }
            Some(handle) => handle.join(),
            None => {}
        }

        let handle = EventLoop::new(self.shared.clone(), self.config.events_capacity)?
            .spawn(&self.config.loop_thread_name)?;
        // A fresh loop starts with an empty epoll set. Registering twice is
        // a no-op, so sockets whose Listen is already queued are unaffected.
        for socket in self.shared.registry.sockets() {
            if socket.local_addr().is_some() {
                self.shared.queue.post(Command::Listen(socket));
            }
        }
        *event_loop = Some(handle);
        Ok(())
    }

    fn stop_and_join(&self, handle: LoopHandle) {
        if !handle.is_finished() {
            self.shared.queue.post(Command::Stop);
        }
        handle.join();
    }

    fn lock_loop(&self) -> MutexGuard<'_, Option<LoopHandle>> {
        self.event_loop.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ServerSocketManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Shutdown, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(200);

    fn manager() -> (ServerSocketManager, Arc<ConnectionTable>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let table = Arc::new(ConnectionTable::new());
        let manager = ServerSocketManager::with_connection_registry(ManagerConfig::new(), table.clone()).unwrap();
        (manager, table)
    }

    fn port_of(manager: &ServerSocketManager, id: SocketId) -> u16 {
        manager.get_info(id).unwrap().local_port.unwrap()
    }

    fn expect_accept(stream: &AcceptStream, listening: SocketId) -> tcpsrv_core::ConnectionId {
        match stream.recv_timeout(WAIT) {
            Some(AcceptEvent::Accepted { socket_id, client_socket_id }) => {
                assert_eq!(socket_id, listening);
                client_socket_id
            }
            other => panic!("expected accept on {}, got {:?}", listening, other),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = ServerSocketManager::new(ManagerConfig::new().events_capacity(0)).err().unwrap();
        assert_eq!(err.result_code(), tcpsrv_core::codes::INVALID_ARGUMENT);
    }

    #[test]
    fn test_accept_then_close_scenario() {
        let (manager, table) = manager();
        let accepts = manager.subscribe_accept_notifications();
        assert!(manager.is_running());

        let id = manager.create(&SocketProperties::default());
        manager.listen(id, "127.0.0.1", 0, Some(5)).unwrap();
        let port = port_of(&manager, id);

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let connection = expect_accept(&accepts, id);
        assert!(table.take(connection).is_some());
        assert!(accepts.recv_timeout(QUIET).is_none());

        manager.close(id).unwrap().wait().unwrap();
        assert!(manager.get_info(id).unwrap_err().is_not_found());
        assert!(manager.get_sockets().is_empty());
    }

    #[test]
    fn test_pause_scenario() {
        let (manager, _table) = manager();
        let accepts = manager.subscribe_accept_notifications();

        let id = manager.create(&SocketProperties::default());
        manager.set_paused(id, true).unwrap().wait().unwrap();
        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        assert!(manager.get_info(id).unwrap().paused);

        let _client = TcpStream::connect(("127.0.0.1", port_of(&manager, id))).unwrap();
        assert!(accepts.recv_timeout(QUIET).is_none());

        manager.set_paused(id, false).unwrap().wait().unwrap();
        expect_accept(&accepts, id);
        assert!(accepts.recv_timeout(QUIET).is_none());
    }

    #[test]
    fn test_connections_notified_in_order() {
        let (manager, table) = manager();
        let accepts = manager.subscribe_accept_notifications();
        let id = manager.create(&SocketProperties::default());
        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        let port = port_of(&manager, id);

        let first = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let a = expect_accept(&accepts, id);
        let second = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let b = expect_accept(&accepts, id);
        assert!(a < b);

        // The accepted streams are the peers of the clients, in order.
        assert_eq!(table.take(a).unwrap().peer_addr().unwrap(), first.local_addr().unwrap());
        assert_eq!(table.take(b).unwrap().peer_addr().unwrap(), second.local_addr().unwrap());
    }

    #[test]
    fn test_relisten_after_disconnect_keeps_id() {
        let (manager, _table) = manager();
        let accepts = manager.subscribe_accept_notifications();
        let id = manager.create(&SocketProperties::default().name("reopen"));
        manager.listen(id, "127.0.0.1", 0, None).unwrap();

        manager.disconnect(id).unwrap().wait().unwrap();
        let info = manager.get_info(id).unwrap();
        assert!(!info.is_listening());
        assert_eq!(info.name, "reopen");

        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port_of(&manager, id))).unwrap();
        expect_accept(&accepts, id);
    }

    #[test]
    fn test_listen_errors() {
        let (manager, _table) = manager();
        let missing = SocketId::new(4242);
        assert!(manager.listen(missing, "127.0.0.1", 0, None).unwrap_err().is_not_found());

        let id = manager.create(&SocketProperties::default());
        let err = manager.listen(id, "localhost", 0, None).unwrap_err();
        assert_eq!(err.result_code(), tcpsrv_core::codes::INVALID_ARGUMENT);

        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        let err = manager.listen(id, "127.0.0.1", 0, None).unwrap_err();
        assert_eq!(err.result_code(), tcpsrv_core::codes::IO_FAILURE);

        let other = manager.create(&SocketProperties::default());
        let taken = port_of(&manager, id);
        let err = manager.listen(other, "127.0.0.1", taken, None).unwrap_err();
        assert_eq!(err.result_code(), tcpsrv_core::codes::IO_FAILURE);
    }

    #[test]
    fn test_unknown_socket_operations() {
        let (manager, _table) = manager();
        let missing = SocketId::new(99);
        assert!(manager.update(missing, &SocketProperties::default()).unwrap_err().is_not_found());
        assert!(manager.set_paused(missing, true).unwrap_err().is_not_found());
        assert!(manager.disconnect(missing).unwrap_err().is_not_found());
        assert!(manager.close(missing).unwrap_err().is_not_found());
        assert!(manager.get_info(missing).unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_sockets_sorted() {
        let (manager, _table) = manager();
        let ids: Vec<_> = (0..4).map(|_| manager.create(&SocketProperties::default())).collect();
        manager.update(ids[2], &SocketProperties::default().persistent(true)).unwrap();

        let infos = manager.get_sockets();
        assert_eq!(infos.iter().map(|i| i.socket_id).collect::<Vec<_>>(), ids);
        assert!(infos[2].persistent);
    }

    #[test]
    fn test_concurrent_create_unique_ids() {
        let (manager, _table) = manager();
        let manager = Arc::new(manager);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    (0..50).map(|_| manager.create(&SocketProperties::default())).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }

    #[test]
    fn test_stop_terminates_loop() {
        let (manager, _table) = manager();
        let _accepts = manager.subscribe_accept_notifications();
        assert!(manager.is_running());

        let start = Instant::now();
        manager.stop_event_loop();
        assert!(start.elapsed() < WAIT);
        assert!(!manager.is_running());
    }

    #[test]
    fn test_restart_reregisters_bound_sockets() {
        let (manager, _table) = manager();
        let _first = manager.subscribe_accept_notifications();
        let id = manager.create(&SocketProperties::default());
        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        // Make sure the first loop registered the socket before it stops.
        manager.set_paused(id, false).unwrap().wait().unwrap();
        manager.stop_event_loop();
        assert!(!manager.is_running());

        let accepts = manager.subscribe_accept_notifications();
        let _client = TcpStream::connect(("127.0.0.1", port_of(&manager, id))).unwrap();
        expect_accept(&accepts, id);
    }

    #[test]
    fn test_loop_start_failure_reported_once() {
        let (manager, _table) = manager();
        let accepts = manager.subscribe_with(|_| {
            Err(ServerSocketError::Initialization(std::io::Error::from_raw_os_error(libc::EMFILE)))
        });

        match accepts.recv_timeout(WAIT) {
            Some(AcceptEvent::Failed { socket_id, error }) => {
                assert_eq!(socket_id, None);
                assert_eq!(error.result_code, tcpsrv_core::codes::INIT_FAILURE);
            }
            other => panic!("expected init failure, got {:?}", other),
        }
        assert!(accepts.recv_timeout(QUIET).is_none());
        assert!(!manager.is_running());

        // Sockets are unaffected by the failed start.
        let id = manager.create(&SocketProperties::default());
        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        assert!(manager.get_info(id).unwrap().is_listening());
    }

    #[test]
    fn test_listen_before_subscribe() {
        let (manager, _table) = manager();
        let id = manager.create(&SocketProperties::default());
        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        let client = TcpStream::connect(("127.0.0.1", port_of(&manager, id))).unwrap();

        let accepts = manager.subscribe_accept_notifications();
        expect_accept(&accepts, id);
        client.shutdown(Shutdown::Both).unwrap();
    }

    #[test]
    fn test_unsubscribe_ends_stream() {
        let (manager, _table) = manager();
        let accepts = manager.subscribe_accept_notifications();
        manager.unsubscribe();
        assert!(accepts.recv_timeout(WAIT).is_none());
        assert!(accepts.is_closed());
        assert!(!manager.is_subscribed());
        assert!(manager.is_running());
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let (manager, _table) = manager();
        let accepts = manager.subscribe_accept_notifications();
        let id = manager.create(&SocketProperties::default());
        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        let port = port_of(&manager, id);

        manager.shutdown();
        assert!(!manager.is_running());
        assert!(manager.get_sockets().is_empty());
        assert!(accepts.recv_timeout(WAIT).is_none());
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());

        manager.shutdown();
    }

    #[test]
    fn test_shutdown_without_loop() {
        let (manager, _table) = manager();
        let id = manager.create(&SocketProperties::default());
        manager.listen(id, "127.0.0.1", 0, None).unwrap();
        let pending = manager.disconnect(id).unwrap();

        manager.shutdown();
        assert!(manager.get_sockets().is_empty());
        assert!(matches!(pending.wait(), Err(ServerSocketError::LoopStopped)));
    }
}
