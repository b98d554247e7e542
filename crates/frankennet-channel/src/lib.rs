//! # frankennet-channel
//!
//! Readiness-based server-socket channels over raw POSIX sockets.
//!
//! The centre of the crate is [`ServerSocketChannel`]: a listening TCP
//! endpoint with a blocking or non-blocking `accept`, selector integration
//! through pure readiness-translation callbacks, and a close protocol that
//! signals a thread parked in `accept` out of its syscall.
//!
//! Around it:
//! - [`SelectorProvider`] builds channels and selectors and carries the
//!   security policy and event sink they consult.
//! - [`PollSelector`] multiplexes registered channels with `poll(2)`.
//! - [`SocketChannel`] is the connected side handed out by `accept`.
//! - [`interrupt`] lets one thread close the channel another is blocked on.

#![cfg(unix)]

pub mod adaptor;
pub mod error;
pub mod event_log;
pub mod fd;
pub mod interrupt;
pub mod native_thread;
pub mod net;
pub mod options;
pub mod poll_selector;
pub mod provider;
pub mod security;
pub mod selectable;
pub mod selector;
pub mod server_socket_channel;
pub mod socket_channel;

pub use adaptor::ServerSocketAdaptor;
pub use error::{ChannelError, ErrorKind};
pub use event_log::{ChannelEvent, EventKind, EventLevel, EventSink, JsonlSink, MemorySink};
pub use native_thread::{NativeThread, NativeToken};
pub use options::{SocketOption, TcpOptions};
pub use poll_selector::PollSelector;
pub use provider::SelectorProvider;
pub use security::{AllowListPolicy, DenyAll, SecurityAction, SecurityDenial, SecurityPolicy};
pub use selectable::SelectableCore;
pub use selector::{SelectableChannel, SelectionKey, Selector};
pub use server_socket_channel::ServerSocketChannel;
pub use socket_channel::SocketChannel;
