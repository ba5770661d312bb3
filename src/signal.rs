//! Cross-thread wake signal backed by an `eventfd`.
//!
//! Raising the signal is cheap and may be done redundantly: the counter
//! coalesces repeated raises into a single wake-up, and a raise is never lost
//! while the counter is non-zero.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::{Result, errno};

/// Level-triggered wake signal.
#[derive(Debug)]
pub struct Signal {
    fd: OwnedFd,
    raised: AtomicU64,
}

impl Signal {
    /// Creates a new, unset signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the `eventfd` could not be created.
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(errno!("failed to create event_fd"));
        }

        Ok(Self {
            // SAFETY: `fd` was just returned by `eventfd` and is owned by no
            // one else.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            raised: AtomicU64::new(0),
        })
    }

    /// Raises the signal, waking any thread waiting on it.
    pub fn set(&self) {
        self.raised.fetch_add(1, Ordering::Relaxed);

        let x: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &raw const x as *const libc::c_void,
                8,
            )
        };

        if ret == -1 {
            let err = io::Error::last_os_error();
            // A saturated counter is still set.
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("failed to raise signal: {err}");
            }
        }
    }

    /// Clears the signal. Returns `true` if it was set.
    pub fn reset(&self) -> bool {
        let mut buf = [0u8; 8];
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &raw mut buf as *mut libc::c_void,
                buf.len(),
            )
        };

        ret == 8
    }

    /// Returns `true` if the signal is currently set, without clearing it.
    pub fn is_set(&self) -> bool {
        matches!(self.wait(Some(Duration::ZERO)), Ok(true))
    }

    /// Blocks until the signal is set or `timeout` elapses. `None` blocks
    /// indefinitely. The signal is not cleared.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as i32);

        let rdfs = unsafe { libc::poll(&raw mut pfd, 1, timeout_ms) };
        if rdfs == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(errno!("failed to wait on signal"));
        }

        Ok(rdfs > 0 && pfd.revents & libc::POLLIN != 0)
    }

    /// Total number of times the signal has been raised.
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }

    /// Returns the raw file descriptor, for registration with `poll(2)`.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsRawFd for Signal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_set_and_reset() {
        let signal = Signal::new().unwrap();
        assert!(!signal.is_set());

        signal.set();
        assert!(signal.is_set());
        assert_eq!(signal.raised(), 1);

        assert!(signal.reset());
        assert!(!signal.is_set());
        assert!(!signal.reset());
    }

    #[test]
    fn signal_raises_coalesce() {
        let signal = Signal::new().unwrap();
        for _ in 0..5 {
            signal.set();
        }

        assert_eq!(signal.raised(), 5);
        assert!(signal.reset());
        assert!(!signal.is_set());
    }

    #[test]
    fn signal_wakes_waiting_thread() {
        let signal = Arc::new(Signal::new().unwrap());
        let waiter = Arc::clone(&signal);

        let handle = thread::spawn(move || waiter.wait(Some(Duration::from_secs(5))).unwrap());

        signal.set();
        assert!(handle.join().unwrap());
    }
}
