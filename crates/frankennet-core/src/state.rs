//! Channel lifecycle state machine.
//!
//! A channel moves `Uninitialized -> InUse -> Killed` and never back. The raw
//! encoding (`-1`, `0`, `1`) only shows up in diagnostics, but it is kept
//! stable so ordering on the raw value matches ordering on the enum.

// ---------------------------------------------------------------------------
// State encoding
// ---------------------------------------------------------------------------

/// Raw encoding of [`ChannelState::Uninitialized`].
pub const ST_UNINITIALIZED: i32 = -1;
/// Raw encoding of [`ChannelState::InUse`].
pub const ST_INUSE: i32 = 0;
/// Raw encoding of [`ChannelState::Killed`].
pub const ST_KILLED: i32 = 1;

/// Lifecycle state of a channel. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ChannelState {
    /// The descriptor is not yet a usable socket.
    #[default]
    Uninitialized,
    /// Open, or closed but still registered with a selector.
    InUse,
    /// Descriptor released and no selector holds the channel. Terminal.
    Killed,
}

impl ChannelState {
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Uninitialized => ST_UNINITIALIZED,
            Self::InUse => ST_INUSE,
            Self::Killed => ST_KILLED,
        }
    }

    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            ST_UNINITIALIZED => Some(Self::Uninitialized),
            ST_INUSE => Some(Self::InUse),
            ST_KILLED => Some(Self::Killed),
            _ => None,
        }
    }

    /// Returns true if moving to `next` keeps the state non-decreasing.
    #[must_use]
    pub fn may_advance_to(self, next: Self) -> bool {
        next >= self
    }
}

// ---------------------------------------------------------------------------
// Kill contract
// ---------------------------------------------------------------------------

/// What `kill()` must do for a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillAction {
    /// Already killed: nothing to do.
    AlreadyKilled,
    /// Never initialized: promote without touching the descriptor.
    PromoteOnly,
    /// Release the descriptor, then promote.
    ReleaseAndPromote,
}

/// Decide the kill action for `state`.
#[must_use]
pub const fn kill_action(state: ChannelState) -> KillAction {
    match state {
        ChannelState::Killed => KillAction::AlreadyKilled,
        ChannelState::Uninitialized => KillAction::PromoteOnly,
        ChannelState::InUse => KillAction::ReleaseAndPromote,
    }
}

/// Returns true if a channel in `state` may be killed given its open and
/// registration flags. An in-use channel must be both closed and unregistered.
#[must_use]
pub const fn kill_permitted(state: ChannelState, open: bool, registered: bool) -> bool {
    match state {
        ChannelState::InUse => !open && !registered,
        ChannelState::Uninitialized | ChannelState::Killed => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoding_is_stable() {
        assert_eq!(ChannelState::Uninitialized.as_raw(), -1);
        assert_eq!(ChannelState::InUse.as_raw(), 0);
        assert_eq!(ChannelState::Killed.as_raw(), 1);
        for state in [
            ChannelState::Uninitialized,
            ChannelState::InUse,
            ChannelState::Killed,
        ] {
            assert_eq!(ChannelState::from_raw(state.as_raw()), Some(state));
        }
        assert_eq!(ChannelState::from_raw(7), None);
    }

    #[test]
    fn ordering_matches_raw_ordering() {
        assert!(ChannelState::Uninitialized < ChannelState::InUse);
        assert!(ChannelState::InUse < ChannelState::Killed);
    }

    #[test]
    fn advance_is_monotonic() {
        assert!(ChannelState::Uninitialized.may_advance_to(ChannelState::InUse));
        assert!(ChannelState::InUse.may_advance_to(ChannelState::Killed));
        assert!(ChannelState::Killed.may_advance_to(ChannelState::Killed));
        assert!(!ChannelState::Killed.may_advance_to(ChannelState::InUse));
        assert!(!ChannelState::InUse.may_advance_to(ChannelState::Uninitialized));
    }

    #[test]
    fn kill_actions_per_state() {
        assert_eq!(
            kill_action(ChannelState::Killed),
            KillAction::AlreadyKilled
        );
        assert_eq!(
            kill_action(ChannelState::Uninitialized),
            KillAction::PromoteOnly
        );
        assert_eq!(
            kill_action(ChannelState::InUse),
            KillAction::ReleaseAndPromote
        );
    }

    #[test]
    fn in_use_kill_requires_closed_and_unregistered() {
        assert!(kill_permitted(ChannelState::InUse, false, false));
        assert!(!kill_permitted(ChannelState::InUse, true, false));
        assert!(!kill_permitted(ChannelState::InUse, false, true));
        assert!(kill_permitted(ChannelState::Uninitialized, true, true));
    }
}
