//! # Event loop: epoll readiness wait + control message drain
//!
//! The loop runs on a dedicated OS thread and is the sole owner of every
//! readiness registration. Each iteration:
//!
//! ```text
//! loop {
//!     1. epoll_wait across all registered listening sockets + the wake eventfd
//!     2. for every accept-ready socket → ListeningSocket::accept()
//!          paused   → drop the EPOLLIN interest bit
//!          accepted → ConnectionRegistry → AcceptEvent::Accepted
//!          failed   → AcceptEvent::Failed (socket stays registered)
//!     3. drain the control queue until observed empty
//!          Listen / Disconnect / Close / AddAcceptInterest / Stop
//!     4. resolve each message's completion
//! }
//! ```
//!
//! Caller threads never touch the epoll set; they enqueue a
//! [`Command`] and, when they need the outcome, wait on its completion.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tcpsrv_core::{AcceptEvent, ConnectionRegistry, Notifier, Result, ServerSocketError, SocketId};

use crate::notifier::EventFdNotifier;
use crate::queue::{Command, ControlMessage, ControlQueue};
use crate::registry::SocketRegistry;
use crate::sink::AcceptSink;
use crate::socket::{AcceptOutcome, ListeningSocket};

/// epoll token of the wake eventfd; socket tokens are always below it.
const WAKE_TOKEN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    Running,
    Stopped,
}

/// Loop-owned registration of one listening socket.
#[derive(Debug, Clone, Copy)]
struct Registration {
    interest: EpollFlags,
}

/// State the loop shares with the manager.
#[derive(Clone)]
pub(crate) struct LoopShared {
    pub(crate) registry: Arc<SocketRegistry>,
    pub(crate) queue: Arc<ControlQueue>,
    pub(crate) sink: Arc<AcceptSink>,
    pub(crate) connections: Arc<dyn ConnectionRegistry>,
}

pub(crate) struct EventLoop {
    epoll: Epoll,
    notifier: Arc<EventFdNotifier>,
    shared: LoopShared,
    registrations: HashMap<SocketId, Registration>,
    events: Vec<EpollEvent>,
    state: LoopState,
}

impl EventLoop {
    /// Create the epoll set and wake eventfd.
    ///
    /// Fails with [`ServerSocketError::Initialization`]; nothing else is
    /// touched in that case, so existing sockets are unaffected.
    pub(crate) fn new(shared: LoopShared, events_capacity: usize) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(init_error)?;
        let notifier = EventFdNotifier::create().map_err(ServerSocketError::Initialization)?;
        epoll
            .add(notifier.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(init_error)?;

        Ok(Self {
            epoll,
            notifier: Arc::new(notifier),
            shared,
            registrations: HashMap::new(),
            events: vec![EpollEvent::empty(); events_capacity.max(1)],
            state: LoopState::Running,
        })
    }

    /// Start the loop on its own thread.
    pub(crate) fn spawn(self, thread_name: &str) -> Result<LoopHandle> {
        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || self.run())
            .map_err(ServerSocketError::Initialization)?;
        Ok(LoopHandle { thread })
    }

    fn run(mut self) {
        info!("event loop started");
        self.shared.queue.install_waker(self.notifier.clone());
        // Messages enqueued before the waker was installed did not wake anyone.
        if let Err(e) = self.notifier.notify() {
            warn!("initial wake failed: {}", e);
        }

        while self.state == LoopState::Running {
            self.iterate();
        }

        self.shared.queue.clear_waker();
        info!(
            "event loop stopped ({} registrations released, {} commands left queued)",
            self.registrations.len(),
            self.shared.queue.len()
        );
    }

    fn iterate(&mut self) {
        match self.epoll.wait(&mut self.events, EpollTimeout::NONE) {
            Ok(n) => {
                let ready: Vec<(u64, EpollFlags)> = self.events[..n]
                    .iter()
                    .map(|event| (event.data(), event.events()))
                    .collect();
                self.dispatch(&ready);
            }
            Err(Errno::EINTR) => debug!("readiness wait interrupted"),
            // Skip this wait's results but still honor queued commands.
            Err(e) => warn!("readiness wait failed: {}", e),
        }

        self.drain_control_queue();
    }

    // ── Readiness dispatch ───────────────────────────────────────────

    fn dispatch(&mut self, ready: &[(u64, EpollFlags)]) {
        for &(token, flags) in ready {
            if token == WAKE_TOKEN {
                if let Err(e) = self.notifier.drain() {
                    warn!("failed to reset wake eventfd: {}", e);
                }
                continue;
            }

            let id = match SocketId::from_token(token) {
                Some(id) => id,
                None => continue,
            };
            if !self.registrations.contains_key(&id) {
                trace!("stale readiness for socket {}", id);
                continue;
            }
            if !flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                continue;
            }
            let socket = match self.shared.registry.lookup(id) {
                Some(socket) => socket,
                None => continue,
            };

            self.accept(&socket);
        }
    }

    fn accept(&mut self, socket: &ListeningSocket) {
        let outcome = socket.accept();
        self.handle_outcome(socket, outcome);
    }

    /// Act on one accept attempt. Failures are reported on the stream and
    /// leave the registration in place.
    fn handle_outcome(&mut self, socket: &ListeningSocket, outcome: AcceptOutcome) {
        let id = socket.id();
        match outcome {
            AcceptOutcome::Paused => {
                // Level-triggered: keep the bit and we would spin on a
                // connection nobody takes. Resume re-adds it.
                if let Err(e) = self.update_interest(socket, |interest| interest.difference(EpollFlags::EPOLLIN)) {
                    warn!("failed to suspend accept interest on socket {}: {}", id, e);
                } else {
                    debug!("socket {} paused, accept interest dropped", id);
                }
            }
            AcceptOutcome::Accepted(stream) => {
                let client_socket_id = self.shared.connections.register_accepted(stream);
                debug!("socket {} → connection {}", id, client_socket_id);
                self.shared.sink.emit(AcceptEvent::Accepted {
                    socket_id: id,
                    client_socket_id,
                });
            }
            AcceptOutcome::Empty => trace!("socket {}: no pending connection", id),
            AcceptOutcome::Closed => trace!("socket {}: readiness after close", id),
            AcceptOutcome::Failed(e) => {
                warn!("accept on socket {} failed: {}", id, e);
                let error = ServerSocketError::Io(e).error_info();
                self.shared.sink.emit(AcceptEvent::Failed {
                    socket_id: Some(id),
                    error,
                });
            }
        }
    }

    // ── Control messages ─────────────────────────────────────────────

    /// Apply messages until the queue is observed empty, including ones
    /// that arrive during the drain.
    fn drain_control_queue(&mut self) {
        while let Some(ControlMessage { command, completion }) = self.shared.queue.pop() {
            let label = format!("{:?}", command);
            let result = self.apply(command);
            match &result {
                Ok(()) => debug!("applied {}", label),
                Err(e) => warn!("{} failed: {}", label, e),
            }
            if let Some(completer) = completion {
                completer.complete(result);
            }
        }
    }

    fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Listen(socket) => self.register(&socket),
            Command::Disconnect(socket) => self.disconnect(&socket),
            Command::Close(socket) => {
                self.disconnect(&socket)?;
                self.shared.registry.remove(socket.id());
                Ok(())
            }
            Command::AddAcceptInterest(socket) => {
                self.update_interest(&socket, |interest| interest | EpollFlags::EPOLLIN)
            }
            Command::Stop => {
                self.state = LoopState::Stopped;
                Ok(())
            }
        }
    }

    fn register(&mut self, socket: &ListeningSocket) -> Result<()> {
        let id = socket.id();
        if self.registrations.contains_key(&id) {
            return Ok(());
        }
        let interest = EpollFlags::EPOLLIN;
        let epoll = &self.epoll;
        socket
            .with_channel(|listener| epoll.add(listener, EpollEvent::new(interest, id.as_token())))
            .ok_or(ServerSocketError::NotListening(id))?
            .map_err(io_error)?;
        self.registrations.insert(id, Registration { interest });
        Ok(())
    }

    /// Cancel the registration (if any), then close the channel.
    fn disconnect(&mut self, socket: &ListeningSocket) -> Result<()> {
        let id = socket.id();
        if self.registrations.remove(&id).is_some() {
            let epoll = &self.epoll;
            if let Some(Err(e)) = socket.with_channel(|listener| epoll.delete(listener)) {
                // Closing the descriptor below drops it from the set regardless.
                debug!("epoll delete for socket {} failed: {}", id, e);
            }
        }
        socket.close_channel()?;
        Ok(())
    }

    /// Rewrite the interest set of a registered socket. A socket without a
    /// registration is left alone.
    fn update_interest(
        &mut self,
        socket: &ListeningSocket,
        f: impl FnOnce(EpollFlags) -> EpollFlags,
    ) -> Result<()> {
        let id = socket.id();
        let registration = match self.registrations.get_mut(&id) {
            Some(registration) => registration,
            None => return Ok(()),
        };
        let interest = f(registration.interest);
        if interest == registration.interest {
            return Ok(());
        }

        let epoll = &self.epoll;
        let mut event = EpollEvent::new(interest, id.as_token());
        socket
            .with_channel(|listener| epoll.modify(listener, &mut event))
            .ok_or(ServerSocketError::NotListening(id))?
            .map_err(io_error)?;
        registration.interest = interest;
        Ok(())
    }
}

/// Join handle of a running event loop.
#[derive(Debug)]
pub(crate) struct LoopHandle {
    thread: JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            error!("event loop thread panicked");
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

fn io_error(errno: Errno) -> ServerSocketError {
    ServerSocketError::Io(io::Error::from(errno))
}

fn init_error(errno: Errno) -> ServerSocketError {
    ServerSocketError::Initialization(io::Error::from(errno))
}
