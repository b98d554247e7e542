//! Blocking, socket-style view of a [`ServerSocketChannel`].
//!
//! The adaptor does not keep its channel alive; once the channel is dropped
//! every operation reports the channel as closed.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::ChannelError;
use crate::server_socket_channel::ServerSocketChannel;
use crate::socket_channel::SocketChannel;

pub struct ServerSocketAdaptor {
    channel: Weak<ServerSocketChannel>,
    /// Accept timeout in milliseconds; 0 waits forever.
    timeout_ms: AtomicU32,
}

impl ServerSocketAdaptor {
    pub(crate) fn new(channel: Weak<ServerSocketChannel>) -> Self {
        Self {
            channel,
            timeout_ms: AtomicU32::new(0),
        }
    }

    fn channel(&self) -> Result<Arc<ServerSocketChannel>, ChannelError> {
        self.channel.upgrade().ok_or(ChannelError::Closed)
    }

    pub fn bind(&self, local: Option<SocketAddr>, backlog: i32) -> Result<(), ChannelError> {
        self.channel()?.bind(local, backlog)
    }

    /// Wait for a connection. The channel must be in blocking mode.
    ///
    /// With a non-zero [`so_timeout`](Self::so_timeout) the wait gives up
    /// with `TimedOut` once it elapses.
    pub fn accept(&self) -> Result<SocketChannel, ChannelError> {
        let channel = self.channel()?;
        if !channel.is_bound() {
            return Err(ChannelError::NotYetBound);
        }
        if !channel.is_blocking() {
            return Err(ChannelError::IllegalBlockingMode);
        }
        let timeout = self.timeout_ms.load(Ordering::Acquire);
        if timeout == 0 {
            return channel.accept()?.ok_or(ChannelError::IllegalBlockingMode);
        }

        channel.configure_blocking(false)?;
        let result = Self::accept_within(&channel, Duration::from_millis(u64::from(timeout)));
        if channel.is_open() {
            channel.configure_blocking(true)?;
        }
        result
    }

    fn accept_within(
        channel: &ServerSocketChannel,
        timeout: Duration,
    ) -> Result<SocketChannel, ChannelError> {
        if let Some(sc) = channel.accept()? {
            return Ok(sc);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if !channel.is_open() {
                return Err(ChannelError::Closed);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Accept timed out").into());
            }
            let wait = i32::try_from(left.as_millis().max(1)).unwrap_or(i32::MAX);
            if channel.poll_acceptable(wait)? {
                if let Some(sc) = channel.accept()? {
                    return Ok(sc);
                }
            }
        }
    }

    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.channel().ok().and_then(|c| c.local_address())
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.channel().is_ok_and(|c| c.is_bound())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.channel().is_ok_and(|c| c.is_open())
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        match self.channel.upgrade() {
            Some(channel) => channel.close(),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn so_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms.load(Ordering::Acquire)))
    }

    /// Set the accept timeout; zero disables it.
    pub fn set_so_timeout(&self, timeout: Duration) {
        let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.timeout_ms.store(ms, Ordering::Release);
    }

    pub fn reuse_address(&self) -> Result<bool, ChannelError> {
        Ok(self.channel()?.options().reuse_address()?)
    }

    pub fn set_reuse_address(&self, on: bool) -> Result<(), ChannelError> {
        Ok(self.channel()?.options().set_reuse_address(on)?)
    }

    pub fn receive_buffer_size(&self) -> Result<i32, ChannelError> {
        Ok(self.channel()?.options().receive_buffer_size()?)
    }

    pub fn set_receive_buffer_size(&self, size: i32) -> Result<(), ChannelError> {
        Ok(self.channel()?.options().set_receive_buffer_size(size)?)
    }
}

impl fmt::Display for ServerSocketAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_address() {
            Some(addr) => write!(f, "ServerSocket[addr={addr}]"),
            None => f.write_str("ServerSocket[unbound]"),
        }
    }
}

impl fmt::Debug for ServerSocketAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocketAdaptor")
            .field("timeout", &self.so_timeout())
            .finish_non_exhaustive()
    }
}
