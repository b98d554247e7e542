//! IO status sentinels.
//!
//! Channel primitives return a plain `i32`: a non-negative value is normal
//! progress (for accept, `1` means one connection was taken), negative values
//! are sentinels. Callers decode them with [`IoStatus::from_raw`] or test them
//! with [`check`].

// ---------------------------------------------------------------------------
// Sentinels
// ---------------------------------------------------------------------------

/// Normal progress for primitives that move a single item (accept).
pub const OK: i32 = 1;
/// End of stream.
pub const EOF: i32 = -1;
/// Nothing available; the call would block in non-blocking mode.
pub const UNAVAILABLE: i32 = -2;
/// The system call was interrupted by a signal.
pub const INTERRUPTED: i32 = -3;
/// Operation not supported by the underlying socket.
pub const UNSUPPORTED: i32 = -4;
/// An error was raised inside the primitive and already reported.
pub const THROWN: i32 = -5;
/// This particular case is not supported.
pub const UNSUPPORTED_CASE: i32 = -6;

/// Decoded form of a raw status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoStatus {
    /// `n >= 0` units of progress.
    Progress(u32),
    Eof,
    Unavailable,
    Interrupted,
    Unsupported,
    Thrown,
    UnsupportedCase,
}

impl IoStatus {
    /// Decode a raw status. Unknown negative values yield `None`.
    #[must_use]
    pub const fn from_raw(n: i32) -> Option<Self> {
        match n {
            EOF => Some(Self::Eof),
            UNAVAILABLE => Some(Self::Unavailable),
            INTERRUPTED => Some(Self::Interrupted),
            UNSUPPORTED => Some(Self::Unsupported),
            THROWN => Some(Self::Thrown),
            UNSUPPORTED_CASE => Some(Self::UnsupportedCase),
            n if n >= 0 => Some(Self::Progress(n as u32)),
            _ => None,
        }
    }

    /// Encode back into the raw sentinel space.
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        match self {
            Self::Progress(n) => n as i32,
            Self::Eof => EOF,
            Self::Unavailable => UNAVAILABLE,
            Self::Interrupted => INTERRUPTED,
            Self::Unsupported => UNSUPPORTED,
            Self::Thrown => THROWN,
            Self::UnsupportedCase => UNSUPPORTED_CASE,
        }
    }

    /// Returns true if the value reports at least one unit of progress.
    #[must_use]
    pub const fn progressed(self) -> bool {
        matches!(self, Self::Progress(n) if n > 0)
    }
}

/// Returns true if `n` is a status an accept-style primitive may leave behind:
/// progress (including the initial `0`), `UNAVAILABLE`, or `INTERRUPTED`.
#[inline]
#[must_use]
pub const fn check(n: i32) -> bool {
    n >= 0 || n == UNAVAILABLE || n == INTERRUPTED
}

/// Normalize a byte-count style status: sentinels other than `EOF` collapse
/// to `0` so callers only see a count or end-of-stream.
#[inline]
#[must_use]
pub const fn normalize(n: i32) -> i32 {
    if n == UNAVAILABLE || n == INTERRUPTED { 0 } else { n }
}
