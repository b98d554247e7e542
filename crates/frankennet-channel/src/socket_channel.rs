//! Connected stream channel produced by `ServerSocketChannel::accept`.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ChannelError;
use crate::event_log::{ChannelEvent, EventKind};
use crate::fd::{FdUse, SocketFd};
use crate::net;
use crate::provider::{SelectorProvider, next_channel_id};

pub struct SocketChannel {
    id: u64,
    provider: Arc<SelectorProvider>,
    fd: SocketFd,
    remote: SocketAddr,
    blocking: AtomicBool,
}

impl SocketChannel {
    /// Wrap an accepted, blocking descriptor.
    pub(crate) fn new(provider: Arc<SelectorProvider>, fd: OwnedFd, remote: SocketAddr) -> Self {
        Self {
            id: next_channel_id(),
            provider,
            fd: SocketFd::new(fd),
            remote,
            blocking: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.fd.is_closed()
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    fn live_fd(&self) -> io::Result<FdUse<'_>> {
        self.fd.acquire()
    }

    pub fn configure_blocking(&self, block: bool) -> Result<(), ChannelError> {
        let fd = self.live_fd().map_err(|_| ChannelError::Closed)?;
        net::configure_blocking(fd.raw(), block)?;
        self.blocking.store(block, Ordering::Release);
        Ok(())
    }

    pub fn local_address(&self) -> Result<SocketAddr, ChannelError> {
        let fd = self.live_fd().map_err(|_| ChannelError::Closed)?;
        Ok(net::local_address(fd.raw())?)
    }

    /// Peer address captured at accept time.
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Half-close: the peer reads end-of-stream, this side may still read.
    pub fn shutdown_output(&self) -> Result<(), ChannelError> {
        let fd = self.live_fd().map_err(|_| ChannelError::Closed)?;
        net::shutdown(fd.raw(), libc::SHUT_WR)?;
        Ok(())
    }

    /// Close the connection. Repeated calls do nothing.
    pub fn close(&self) -> Result<(), ChannelError> {
        if self.fd.is_closed() {
            return Ok(());
        }
        let released = self.fd.close();
        self.provider.emit(
            ChannelEvent::new(EventKind::Close, self.id)
                .with_fd(self.fd.raw())
                .with_remote(self.remote)
                .with_errno(released.as_ref().err().and_then(io::Error::raw_os_error)),
        );
        Ok(released?)
    }

    fn read_raw(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.live_fd()?;
        loop {
            // SAFETY: buf is a valid writable region of buf.len() bytes.
            let n = unsafe { libc::read(fd.raw(), buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    fn write_raw(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.live_fd()?;
        loop {
            // SAFETY: buf is a valid readable region of buf.len() bytes.
            let n = unsafe { libc::write(fd.raw(), buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

impl Read for &SocketChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_raw(buf)
    }
}

impl Write for &SocketChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_raw(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SocketChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_raw(buf)
    }
}

impl Write for SocketChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_raw(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for SocketChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

impl fmt::Display for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_open() {
            return f.write_str("SocketChannel[closed]");
        }
        f.write_str("SocketChannel[connected")?;
        if let Ok(local) = self.local_address() {
            write!(f, " local={local}")?;
        }
        write!(f, " remote={}]", self.remote)
    }
}

impl fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketChannel")
            .field("id", &self.id)
            .field("fd", &self.fd.raw())
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
