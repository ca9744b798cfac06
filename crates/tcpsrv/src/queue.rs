//! Control queue: the only path by which caller threads reach the event loop.
//!
//! Producers always (1) enqueue, then (2) wake. The loop drains the queue
//! after every wakeup until it observes it empty, so a command is never
//! starved behind a readiness wait with nothing registered.
//!
//! Messages are consumed exactly once, in FIFO order.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use crossbeam_queue::SegQueue;
use log::{trace, warn};
use tcpsrv_core::{Notifier, Result, ServerSocketError, SocketId};

use crate::socket::ListeningSocket;

/// What the loop should do with its registration state.
pub(crate) enum Command {
    /// Register the target's channel for accept readiness.
    Listen(Arc<ListeningSocket>),
    /// Cancel the registration (if any) and close the channel.
    Disconnect(Arc<ListeningSocket>),
    /// Disconnect, then remove the target from the registry.
    Close(Arc<ListeningSocket>),
    /// Re-enable accept interest on the target's registration.
    AddAcceptInterest(Arc<ListeningSocket>),
    /// Poison pill: the loop exits after the current drain.
    Stop,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Listen(_) => "Listen",
            Command::Disconnect(_) => "Disconnect",
            Command::Close(_) => "Close",
            Command::AddAcceptInterest(_) => "AddAcceptInterest",
            Command::Stop => "Stop",
        }
    }

    pub(crate) fn target(&self) -> Option<SocketId> {
        match self {
            Command::Listen(s) | Command::Disconnect(s) | Command::Close(s) | Command::AddAcceptInterest(s) => {
                Some(s.id())
            }
            Command::Stop => None,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(id) => write!(f, "{}({})", self.name(), id),
            None => write!(f, "{}", self.name()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ControlMessage {
    pub(crate) command: Command,
    pub(crate) completion: Option<Completer>,
}

/// Loop-side half of a [`Completion`].
#[derive(Debug)]
pub(crate) struct Completer {
    tx: Sender<Result<()>>,
}

impl Completer {
    pub(crate) fn complete(self, result: Result<()>) {
        // The caller may have dropped its handle; nobody to tell then.
        let _ = self.tx.send(result);
    }
}

/// One-shot result of a loop-applied operation.
///
/// Resolves once the event loop applies the corresponding control
/// message. If the message is discarded unapplied (loop stopped, manager
/// shut down) it resolves to [`ServerSocketError::LoopStopped`].
#[derive(Debug)]
#[must_use = "a Completion does nothing unless waited on"]
pub struct Completion {
    rx: Receiver<Result<()>>,
}

impl Completion {
    pub(crate) fn pair() -> (Completer, Completion) {
        let (tx, rx) = bounded(1);
        (Completer { tx }, Completion { rx })
    }

    /// An already-resolved completion.
    pub fn ready(result: Result<()>) -> Self {
        let (completer, completion) = Self::pair();
        completer.complete(result);
        completion
    }

    /// Block until the loop has applied the operation.
    pub fn wait(self) -> Result<()> {
        self.rx.recv().unwrap_or(Err(ServerSocketError::LoopStopped))
    }

    /// Like [`Completion::wait`], giving up after `timeout`.
    ///
    /// Returns `None` if the operation is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(ServerSocketError::LoopStopped)),
        }
    }
}

/// MPSC queue of control messages plus the loop's wake signal.
#[derive(Default)]
pub(crate) struct ControlQueue {
    messages: SegQueue<ControlMessage>,
    /// Installed by a running loop; `None` while no loop is running.
    waker: RwLock<Option<Arc<dyn Notifier>>>,
}

impl ControlQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueue without a completion.
    pub(crate) fn post(&self, command: Command) {
        self.enqueue(ControlMessage {
            command,
            completion: None,
        });
    }

    /// Enqueue and hand back the caller's completion handle.
    pub(crate) fn submit(&self, command: Command) -> Completion {
        let (completer, completion) = Completion::pair();
        self.enqueue(ControlMessage {
            command,
            completion: Some(completer),
        });
        completion
    }

    fn enqueue(&self, message: ControlMessage) {
        trace!("enqueue {:?}", message.command);
        self.messages.push(message);
        self.wake();
    }

    fn wake(&self) {
        let waker = self.waker.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(notifier) = waker.as_ref() {
            if let Err(e) = notifier.notify() {
                warn!("failed to wake event loop: {}", e);
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<ControlMessage> {
        self.messages.pop()
    }

    pub(crate) fn install_waker(&self, notifier: Arc<dyn Notifier>) {
        *self.waker.write().unwrap_or_else(PoisonError::into_inner) = Some(notifier);
    }

    pub(crate) fn clear_waker(&self) {
        *self.waker.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Drop every pending message; their completions resolve to
    /// `LoopStopped`. Returns how many were dropped.
    pub(crate) fn discard_pending(&self) -> usize {
        let mut dropped = 0;
        while self.messages.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}
