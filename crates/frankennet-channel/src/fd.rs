//! Socket descriptor with idempotent, use-counted close.
//!
//! Syscalls run under an [`FdUse`] taken from [`SocketFd::acquire`]. A close
//! that finds uses in flight shuts the socket down so blocked syscalls return,
//! and the last use releases the descriptor number. A number is therefore never
//! handed back to the kernel while another thread may still pass it to a
//! syscall.
//!
//! The raw descriptor number stays readable after close (selectors may still
//! hold it for bookkeeping).

use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::socket_closed;

/// Set once `close` has been called.
const CLOSED: usize = 1;
/// One in-flight use; counted above the `CLOSED` bit.
const USER: usize = 2;

#[derive(Debug)]
pub struct SocketFd {
    raw: RawFd,
    state: AtomicUsize,
}

/// A borrowed, still-open descriptor. The number cannot be released while
/// this is alive.
#[derive(Debug)]
pub struct FdUse<'a> {
    fd: &'a SocketFd,
}

impl SocketFd {
    /// Take ownership of an open descriptor.
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            raw: fd.into_raw_fd(),
            state: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn raw(&self) -> RawFd {
        self.raw
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) & CLOSED != 0
    }

    /// Borrow the descriptor for a syscall, or fail if it has been closed.
    pub fn acquire(&self) -> io::Result<FdUse<'_>> {
        let mut cur = self.state.load(Ordering::SeqCst);
        loop {
            if cur & CLOSED != 0 {
                return Err(socket_closed());
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + USER,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(FdUse { fd: self }),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Close the descriptor. Later calls return `Ok(())` without a syscall.
    ///
    /// With uses in flight the socket is only shut down here; the number is
    /// released when the last [`FdUse`] drops.
    pub fn close(&self) -> io::Result<()> {
        let prev = self.state.fetch_or(CLOSED, Ordering::SeqCst);
        if prev & CLOSED != 0 {
            return Ok(());
        }
        if prev == 0 {
            return self.release();
        }
        // SAFETY: raw is still open; the in-flight uses keep it from release.
        // Failure (ENOTCONN, ENOTSOCK) leaves nothing to undo.
        unsafe { libc::shutdown(self.raw, libc::SHUT_RDWR) };
        Ok(())
    }

    fn release(&self) -> io::Result<()> {
        // SAFETY: raw was owned by us; CLOSED plus a zero use count is reached
        // exactly once, so this is the only close.
        let rc = unsafe { libc::close(self.raw) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // The descriptor is gone even when close reports EINTR.
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl FdUse<'_> {
    #[must_use]
    pub fn raw(&self) -> RawFd {
        self.fd.raw
    }
}

impl Drop for FdUse<'_> {
    fn drop(&mut self) {
        if self.fd.state.fetch_sub(USER, Ordering::SeqCst) == CLOSED | USER {
            let _ = self.fd.release();
        }
    }
}

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.raw
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
