//! `EventFdNotifier`: default `Notifier` implementation.
//!
//! Writes to an eventfd registered with the event loop's epoll set.
//! Coalescing: multiple calls to `notify()` before the loop reads the
//! eventfd result in a single wakeup (eventfd counter semantics).

use tcpsrv_core::Notifier;

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

pub struct EventFdNotifier {
    fd: OwnedFd,
}

impl EventFdNotifier {
    /// Create a new non-blocking, close-on-exec eventfd.
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: eventfd just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Reset the counter after a wakeup so level-triggered epoll stops
    /// reporting it. Returns the number of coalesced notifications.
    pub fn drain(&self) -> io::Result<u64> {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Nothing pending: a previous drain already consumed it.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(val)
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // EAGAIN means the counter would overflow, so a wakeup is
            // already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl AsFd for EventFdNotifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
