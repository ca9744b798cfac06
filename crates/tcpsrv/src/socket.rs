//! Listening socket state machine.
//!
//! A `ListeningSocket` owns its (optional) non-blocking server channel,
//! the pause flag, and descriptive metadata. It never touches readiness
//! registration: the event loop owns that and consults the socket only
//! through [`ListeningSocket::accept`] and the channel accessors.
//!
//! ```text
//!   create ──► Unbound ──listen──► Bound ──disconnect──► Unbound
//!                                    │                       │
//!                                    └───────close───────────┴──► removed
//! ```

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use tcpsrv_core::{Result, ServerSocketError, SocketId, SocketInfo, SocketProperties};

/// Result of one accept attempt, interpreted by the event loop.
#[derive(Debug)]
pub(crate) enum AcceptOutcome {
    /// Paused: the loop must drop the accept-interest bit.
    Paused,
    /// One pending connection was taken off the backlog.
    Accepted(TcpStream),
    /// Readiness was stale; nothing to accept.
    Empty,
    /// No channel (disconnected in the meantime).
    Closed,
    Failed(io::Error),
}

#[derive(Debug)]
struct Metadata {
    persistent: bool,
    name: String,
}

/// One server socket, shared between the registry, caller threads, and
/// the event loop.
#[derive(Debug)]
pub struct ListeningSocket {
    id: SocketId,
    /// Advisory; rechecked by the loop only when accept readiness fires
    paused: AtomicBool,
    metadata: Mutex<Metadata>,
    /// `None` until the first listen, and again after disconnect
    channel: Mutex<Option<TcpListener>>,
}

impl ListeningSocket {
    pub(crate) fn new(id: SocketId, properties: &SocketProperties) -> Self {
        let socket = Self {
            id,
            paused: AtomicBool::new(false),
            metadata: Mutex::new(Metadata {
                persistent: false,
                name: String::new(),
            }),
            channel: Mutex::new(None),
        };
        socket.set_properties(properties);
        socket
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Apply descriptive metadata. Never touches readiness state.
    pub fn set_properties(&self, properties: &SocketProperties) {
        let mut meta = lock(&self.metadata);
        if let Some(persistent) = properties.persistent {
            meta.persistent = persistent;
        }
        if let Some(name) = &properties.name {
            meta.name = name.clone();
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Open a fresh channel if needed, bind it and start listening.
    ///
    /// Returns the bound address. The caller enqueues the readiness
    /// registration afterwards; this call never touches the poller.
    pub(crate) fn listen(&self, addr: SocketAddr, backlog: i32, reuse_address: bool) -> Result<SocketAddr> {
        let mut channel = lock(&self.channel);
        if channel.is_some() {
            return Err(ServerSocketError::AlreadyListening(self.id));
        }

        let listener = open_listener(addr, backlog, reuse_address)?;
        let bound = listener.local_addr()?;
        debug!("socket {} bound to {} (backlog {})", self.id, bound, backlog);
        *channel = Some(listener);
        Ok(bound)
    }

    /// Bound address, if the socket currently holds a channel.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.channel)
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn info(&self) -> SocketInfo {
        let local = self.local_addr();
        let meta = lock(&self.metadata);
        SocketInfo {
            socket_id: self.id,
            persistent: meta.persistent,
            name: meta.name.clone(),
            paused: self.is_paused(),
            local_address: local.map(|addr| addr.ip().to_string()),
            local_port: local.map(|addr| addr.port()),
        }
    }

    // ── Event loop thread only ───────────────────────────────────────

    /// Run `f` against the bound channel, if any.
    pub(crate) fn with_channel<R>(&self, f: impl FnOnce(&TcpListener) -> R) -> Option<R> {
        lock(&self.channel).as_ref().map(f)
    }

    /// Close the channel. Returns whether a channel was open.
    pub(crate) fn close_channel(&self) -> io::Result<bool> {
        let listener = match lock(&self.channel).take() {
            Some(listener) => listener,
            None => return Ok(false),
        };
        let fd = listener.into_raw_fd();
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(true)
    }

    /// Accept at most one pending connection.
    pub(crate) fn accept(&self) -> AcceptOutcome {
        if self.is_paused() {
            return AcceptOutcome::Paused;
        }

        let channel = lock(&self.channel);
        let listener = match channel.as_ref() {
            Some(listener) => listener,
            None => return AcceptOutcome::Closed,
        };

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("socket {} accepted {}", self.id, peer);
                AcceptOutcome::Accepted(stream)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => AcceptOutcome::Empty,
            Err(e) => AcceptOutcome::Failed(e),
        }
    }
}

/// Metadata and the channel slot are advisory; a panic elsewhere must
/// not wedge them.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Common socket setup: create, setsockopt, bind, listen.
fn open_listener(addr: SocketAddr, backlog: i32, reuse_address: bool) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socket() just returned this descriptor; OwnedFd closes it
    // on every early return below.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let raw = fd.as_raw_fd();

    if reuse_address {
        let opt: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let (storage, len) = socket_addr_to_raw(&addr);
    let ret = unsafe {
        libc::bind(
            raw,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::listen(raw, backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from(fd))
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            // SAFETY: sockaddr_storage is large and aligned enough for any sockaddr.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            // SAFETY: as above.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_defaults_and_properties() {
        let socket = ListeningSocket::new(SocketId::new(0), &SocketProperties::new().name("api"));
        let info = socket.info();
        assert_eq!(info.socket_id, SocketId::new(0));
        assert_eq!(info.name, "api");
        assert!(!info.persistent);
        assert!(!info.paused);
        assert!(info.local_address.is_none());
        assert!(info.local_port.is_none());

        socket.set_properties(&SocketProperties::new().persistent(true));
        let info = socket.info();
        assert!(info.persistent);
        assert_eq!(info.name, "api");
    }

    #[test]
    fn test_listen_reports_address() {
        let socket = ListeningSocket::new(SocketId::new(1), &SocketProperties::default());
        let bound = socket.listen(loopback(), 5, true).unwrap();
        assert_ne!(bound.port(), 0);

        let info = socket.info();
        assert_eq!(info.local_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(info.local_port, Some(bound.port()));
    }

    #[test]
    fn test_listen_twice_fails() {
        let socket = ListeningSocket::new(SocketId::new(2), &SocketProperties::default());
        socket.listen(loopback(), 5, true).unwrap();
        let err = socket.listen(loopback(), 5, true).unwrap_err();
        assert!(matches!(err, ServerSocketError::AlreadyListening(_)));
        assert!(socket.local_addr().is_some());
    }

    #[test]
    fn test_close_then_relisten() {
        let socket = ListeningSocket::new(SocketId::new(3), &SocketProperties::default());
        socket.listen(loopback(), 5, true).unwrap();
        assert!(socket.close_channel().unwrap());
        assert!(socket.info().local_port.is_none());
        assert!(!socket.close_channel().unwrap());

        socket.listen(loopback(), 5, true).unwrap();
        assert!(socket.info().is_listening());
    }

    #[test]
    fn test_bind_conflict_is_io_error() {
        let first = ListeningSocket::new(SocketId::new(4), &SocketProperties::default());
        let bound = first.listen(loopback(), 5, false).unwrap();

        let second = ListeningSocket::new(SocketId::new(5), &SocketProperties::default());
        let err = second.listen(bound, 5, false).unwrap_err();
        assert!(matches!(err, ServerSocketError::Io(_)));
        assert_eq!(err.result_code(), -2);
        assert!(second.local_addr().is_none());
    }

    #[test]
    fn test_accept_states() {
        let socket = ListeningSocket::new(SocketId::new(6), &SocketProperties::default());
        assert!(matches!(socket.accept(), AcceptOutcome::Closed));

        let bound = socket.listen(loopback(), 5, true).unwrap();
        assert!(matches!(socket.accept(), AcceptOutcome::Empty));

        socket.set_paused(true);
        let _client = TcpStream::connect(bound).unwrap();
        assert!(matches!(socket.accept(), AcceptOutcome::Paused));

        socket.set_paused(false);
        let mut accepted = false;
        for _ in 0..100 {
            match socket.accept() {
                AcceptOutcome::Accepted(_) => {
                    accepted = true;
                    break;
                }
                AcceptOutcome::Empty => std::thread::sleep(std::time::Duration::from_millis(5)),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert!(accepted);
    }

    #[test]
    fn test_ipv6_listen() {
        let socket = ListeningSocket::new(SocketId::new(7), &SocketProperties::default());
        // Hosts without IPv6 loopback cannot bind ::1; nothing to check there.
        if let Ok(bound) = socket.listen(SocketAddr::from((Ipv6Addr::LOCALHOST, 0)), 5, true) {
            assert!(bound.is_ipv6());
            assert_eq!(socket.info().local_address.as_deref(), Some("::1"));
        }
    }
}
