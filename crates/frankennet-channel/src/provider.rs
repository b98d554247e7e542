//! Channel and selector factory.
//!
//! A provider carries the settings every channel it creates consults: the
//! security policy, the event sink and the `POLLNVAL` policy. The
//! process-wide [`SelectorProvider::system`] instance is configured from the
//! environment; tests build their own with [`SelectorProvider::new`].

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use frankennet_core::config::{self, PollNvalPolicy};
use parking_lot::RwLock;

use crate::error::ChannelError;
use crate::event_log::{ChannelEvent, EventSink, JsonlSink};
use crate::poll_selector::PollSelector;
use crate::security::{SecurityDenial, SecurityPolicy};
use crate::server_socket_channel::ServerSocketChannel;

static SYSTEM: OnceLock<Arc<SelectorProvider>> = OnceLock::new();
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a new channel.
pub(crate) fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct SelectorProvider {
    security: RwLock<Option<Arc<dyn SecurityPolicy>>>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    pollnval: RwLock<PollNvalPolicy>,
}

impl SelectorProvider {
    /// A provider with no policy, no sink and lenient `POLLNVAL` handling.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            security: RwLock::new(None),
            sink: RwLock::new(None),
            pollnval: RwLock::new(PollNvalPolicy::Lenient),
        })
    }

    /// The shared provider, configured from `FRANKENNET_LOG` and
    /// `FRANKENNET_POLLNVAL` on first use.
    #[must_use]
    pub fn system() -> Arc<Self> {
        Arc::clone(SYSTEM.get_or_init(|| {
            let provider = Self::new();
            if config::log_mode().enabled() {
                provider.set_event_sink(Some(Arc::new(JsonlSink::stderr())));
            }
            provider.set_pollnval_policy(config::pollnval_policy());
            provider
        }))
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn set_security_policy(&self, policy: Option<Arc<dyn SecurityPolicy>>) {
        *self.security.write() = policy;
    }

    pub fn set_event_sink(&self, sink: Option<Arc<dyn EventSink>>) {
        *self.sink.write() = sink;
    }

    pub fn set_pollnval_policy(&self, policy: PollNvalPolicy) {
        *self.pollnval.write() = policy;
    }

    #[must_use]
    pub fn pollnval_policy(&self) -> PollNvalPolicy {
        *self.pollnval.read()
    }

    // -----------------------------------------------------------------------
    // Factories
    // -----------------------------------------------------------------------

    /// A new unbound listening channel.
    pub fn open_server_socket_channel(
        self: &Arc<Self>,
    ) -> Result<Arc<ServerSocketChannel>, ChannelError> {
        ServerSocketChannel::open(Arc::clone(self))
    }

    /// Wrap an existing socket. Its current local address, if bound, is
    /// recorded.
    pub fn server_socket_channel_from_fd(
        self: &Arc<Self>,
        fd: OwnedFd,
    ) -> Result<Arc<ServerSocketChannel>, ChannelError> {
        ServerSocketChannel::from_fd(Arc::clone(self), fd)
    }

    /// A new `poll(2)` selector.
    pub fn open_selector(self: &Arc<Self>) -> Result<Arc<PollSelector>, ChannelError> {
        Ok(PollSelector::new(Arc::clone(self))?)
    }

    // -----------------------------------------------------------------------
    // Hooks used by channels
    // -----------------------------------------------------------------------

    pub(crate) fn emit(&self, event: ChannelEvent) {
        if let Some(sink) = self.sink.read().as_ref() {
            sink.emit(&event);
        }
    }

    pub(crate) fn check_listen(&self, port: u16) -> Result<(), SecurityDenial> {
        match self.security.read().as_ref() {
            Some(policy) => policy.check_listen(port),
            None => Ok(()),
        }
    }

    pub(crate) fn check_accept(&self, remote: SocketAddr) -> Result<(), SecurityDenial> {
        match self.security.read().as_ref() {
            Some(policy) => policy.check_accept(&remote.ip().to_string(), remote.port()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SelectorProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorProvider")
            .field("security", &self.security.read().is_some())
            .field("sink", &self.sink.read().is_some())
            .field("pollnval", &self.pollnval_policy())
            .finish()
    }
}
