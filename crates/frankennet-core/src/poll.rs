//! Poll and readiness vocabulary.
//!
//! Two bit spaces meet here. Native `poll(2)` event bits (`POLL*`) are what the
//! kernel reports for a descriptor; readiness bits (`OP_*`) are what a
//! selection key exposes to applications. The translation functions in this
//! module are pure: they see only integers and never touch a descriptor.

// ---------------------------------------------------------------------------
// Native poll event bits (Linux values)
// ---------------------------------------------------------------------------

/// There is data to read (for a listener: a connection is pending).
pub const POLLIN: i32 = 0x0001;
/// There is urgent data to read.
pub const POLLPRI: i32 = 0x0002;
/// Writing now will not block.
pub const POLLOUT: i32 = 0x0004;
/// Error condition (output only).
pub const POLLERR: i32 = 0x0008;
/// Hang up (output only).
pub const POLLHUP: i32 = 0x0010;
/// Invalid request: descriptor not open (output only).
pub const POLLNVAL: i32 = 0x0020;

// ---------------------------------------------------------------------------
// Readiness (interest/ready set) bits
// ---------------------------------------------------------------------------

/// Channel is ready for reading.
pub const OP_READ: i32 = 1 << 0;
/// Channel is ready for writing.
pub const OP_WRITE: i32 = 1 << 2;
/// Channel has finished, or failed, its connect sequence.
pub const OP_CONNECT: i32 = 1 << 3;
/// Listening channel has a connection ready to accept.
pub const OP_ACCEPT: i32 = 1 << 4;

/// Every readiness bit a server-socket channel supports.
pub const SERVER_VALID_OPS: i32 = OP_ACCEPT;

/// Readiness bits a connected socket channel supports.
pub const SOCKET_VALID_OPS: i32 = OP_READ | OP_WRITE | OP_CONNECT;

/// Returns true if `ops` only uses bits present in `valid`.
#[inline]
#[must_use]
pub const fn ops_within(ops: i32, valid: i32) -> bool {
    ops & !valid == 0
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Translate a listener interest set into a native poll mask.
///
/// `OP_ACCEPT` becomes `POLLIN`; every other bit is dropped.
#[inline]
#[must_use]
pub const fn accept_interest_to_events(interest: i32) -> i32 {
    if interest & OP_ACCEPT != 0 { POLLIN } else { 0 }
}

/// Result of translating native poll events into a ready set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyTranslation {
    /// `POLLNVAL` was reported: the descriptor was closed underneath the
    /// selector. The key must be left untouched.
    Invalid,
    /// A new ready set to store on the key.
    Ready {
        /// Ready set to store.
        ops: i32,
        /// True iff a bit that was clear in the previous ready set is now set.
        changed: bool,
    },
}

impl ReadyTranslation {
    /// The change indicator the selector sees.
    #[must_use]
    pub const fn changed(self) -> bool {
        match self {
            Self::Invalid => false,
            Self::Ready { changed, .. } => changed,
        }
    }
}

/// Translate native poll `events` into a listener ready set.
///
/// - `initial_ops`: the ready set to start from (`0` for a fresh set, the
///   key's current ready set for a merge).
/// - `interest_ops`: the key's interest set.
/// - `old_ops`: the key's ready set before this update, used for the change
///   indicator.
#[must_use]
pub const fn translate_accept_ready_ops(
    events: i32,
    initial_ops: i32,
    interest_ops: i32,
    old_ops: i32,
) -> ReadyTranslation {
    if events & POLLNVAL != 0 {
        return ReadyTranslation::Invalid;
    }

    // Errors and hang-ups make everything the key cares about ready so the
    // next operation observes the failure.
    if events & (POLLERR | POLLHUP) != 0 {
        let ops = interest_ops;
        return ReadyTranslation::Ready {
            ops,
            changed: ops & !old_ops != 0,
        };
    }

    let mut ops = initial_ops;
    if events & POLLIN != 0 && interest_ops & OP_ACCEPT != 0 {
        ops |= OP_ACCEPT;
    }
    ReadyTranslation::Ready {
        ops,
        changed: ops & !old_ops != 0,
    }
}

/// Human-readable names for the set bits of a native poll mask.
#[must_use]
pub fn describe_events(events: i32) -> Vec<&'static str> {
    const NAMES: [(i32, &str); 6] = [
        (POLLIN, "POLLIN"),
        (POLLPRI, "POLLPRI"),
        (POLLOUT, "POLLOUT"),
        (POLLERR, "POLLERR"),
        (POLLHUP, "POLLHUP"),
        (POLLNVAL, "POLLNVAL"),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| events & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
