//! Channel error type.

use std::io;

use thiserror::Error;

use crate::security::SecurityDenial;

/// Coarse classification of a [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation on a closed channel, or closed while the operation ran.
    ClosedChannel,
    AlreadyBound,
    NotYetBound,
    /// A security policy refused listen or accept.
    SecurityDenial,
    /// Underlying OS or helper failure.
    IoFailure,
    UnsupportedAddress,
    IllegalBlockingMode,
    IllegalArgument,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("channel was closed by another thread during a blocking operation")]
    AsynchronousClose,
    #[error("channel was closed because the blocked thread was interrupted")]
    ClosedByInterrupt,
    #[error("channel is already bound")]
    AlreadyBound,
    #[error("channel is not yet bound")]
    NotYetBound,
    #[error("unsupported address type")]
    UnsupportedAddressType,
    #[error("operation not permitted in the current blocking mode")]
    IllegalBlockingMode,
    #[error("invalid interest set {0:#x}")]
    InvalidInterestOps(i32),
    #[error("selector is closed or does not own this key")]
    IllegalSelector,
    #[error(transparent)]
    Security(#[from] SecurityDenial),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Closed | Self::AsynchronousClose | Self::ClosedByInterrupt => {
                ErrorKind::ClosedChannel
            }
            Self::AlreadyBound => ErrorKind::AlreadyBound,
            Self::NotYetBound => ErrorKind::NotYetBound,
            Self::UnsupportedAddressType => ErrorKind::UnsupportedAddress,
            Self::IllegalBlockingMode => ErrorKind::IllegalBlockingMode,
            Self::InvalidInterestOps(_) | Self::IllegalSelector => ErrorKind::IllegalArgument,
            Self::Security(_) => ErrorKind::SecurityDenial,
            Self::Io(_) => ErrorKind::IoFailure,
        }
    }

    /// Returns true for every closed-channel flavour.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::ClosedChannel
    }

    /// Raw OS error number, if this wraps one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(e) => e,
            ChannelError::Closed
            | ChannelError::AsynchronousClose
            | ChannelError::ClosedByInterrupt => io::Error::new(io::ErrorKind::NotConnected, err),
            ChannelError::Security(_) => io::Error::new(io::ErrorKind::PermissionDenied, err),
            ChannelError::UnsupportedAddressType
            | ChannelError::InvalidInterestOps(_)
            | ChannelError::IllegalSelector => io::Error::new(io::ErrorKind::InvalidInput, err),
            other => io::Error::other(other),
        }
    }
}

/// The error the net helpers report for an operation on a released descriptor.
#[must_use]
pub fn socket_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Socket is closed")
}
