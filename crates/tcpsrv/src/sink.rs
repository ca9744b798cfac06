//! Accept notification sink and the subscriber-side stream.
//!
//! One subscription is active at a time. The event loop pushes every
//! accept success or failure into the current sink; the subscriber reads
//! them from an [`AcceptStream`] until it unsubscribes or the manager
//! shuts down, at which point the stream ends.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::debug;
use tcpsrv_core::AcceptEvent;

#[derive(Debug, Default)]
pub(crate) struct AcceptSink {
    tx: Mutex<Option<Sender<AcceptEvent>>>,
}

impl AcceptSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open a new subscription, replacing any previous one (whose stream
    /// then ends).
    pub(crate) fn subscribe(&self) -> AcceptStream {
        let (tx, rx) = unbounded();
        *self.lock() = Some(tx);
        AcceptStream::new(rx)
    }

    pub(crate) fn unsubscribe(&self) {
        self.lock().take();
    }

    /// Deliver one event. Returns false when nobody is listening.
    pub(crate) fn emit(&self, event: AcceptEvent) -> bool {
        let mut tx = self.lock();
        let event = match tx.as_ref() {
            Some(sender) => match sender.send(event) {
                Ok(()) => return true,
                Err(returned) => returned.into_inner(),
            },
            None => event,
        };
        // Receiver gone: the subscription is over.
        tx.take();
        debug!("no accept subscriber, dropping {:?}", event);
        false
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Sender<AcceptEvent>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Persistent, multi-delivery stream of accept events.
#[derive(Debug)]
pub struct AcceptStream {
    rx: Receiver<AcceptEvent>,
    /// Event pulled off the channel by [`AcceptStream::is_closed`]; handed
    /// out before anything else.
    peeked: Mutex<Option<AcceptEvent>>,
}

impl AcceptStream {
    fn new(rx: Receiver<AcceptEvent>) -> Self {
        Self {
            rx,
            peeked: Mutex::new(None),
        }
    }

    /// Block for the next event. `None` once the subscription has ended
    /// and every buffered event was read.
    pub fn recv(&self) -> Option<AcceptEvent> {
        if let Some(event) = self.take_peeked() {
            return Some(event);
        }
        self.rx.recv().ok()
    }

    /// Block for the next event for at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<AcceptEvent> {
        if let Some(event) = self.take_peeked() {
            return Some(event);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<AcceptEvent> {
        if let Some(event) = self.take_peeked() {
            return Some(event);
        }
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// True once the sender side is gone and nothing is buffered.
    pub fn is_closed(&self) -> bool {
        let mut peeked = self.lock_peeked();
        if peeked.is_some() {
            return false;
        }
        match self.rx.try_recv() {
            Ok(event) => {
                *peeked = Some(event);
                false
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => true,
        }
    }

    /// Blocking iterator over events until the subscription ends.
    pub fn iter(&self) -> impl Iterator<Item = AcceptEvent> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    fn take_peeked(&self) -> Option<AcceptEvent> {
        self.lock_peeked().take()
    }

    fn lock_peeked(&self) -> MutexGuard<'_, Option<AcceptEvent>> {
        self.peeked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
