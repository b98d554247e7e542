//! Selector contract: selection keys, the selectable-channel callbacks and
//! the small interface a multiplexer exposes to channels.
//!
//! A [`SelectionKey`] ties one channel to one selector. The selector and the
//! channel own strong references to the key; the key holds only weak
//! references back to both.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use frankennet_core::poll::{OP_ACCEPT, OP_CONNECT, OP_READ, OP_WRITE, ops_within};

use crate::error::ChannelError;
use crate::selectable::SelectableCore;

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// What a channel needs from the multiplexer it is registered with.
pub trait Selector: Send + Sync {
    fn is_open(&self) -> bool;

    /// Record the native poll mask the selector should wait for on `key`.
    fn put_event_ops(&self, key: &SelectionKey, events: i32);

    /// Adopt a freshly created key.
    fn register_key(&self, key: Arc<SelectionKey>) -> Result<(), ChannelError>;

    /// Queue `key` for deregistration at the next selection.
    fn cancel_key(&self, key: &SelectionKey);
}

// ---------------------------------------------------------------------------
// Selectable channel
// ---------------------------------------------------------------------------

/// Callbacks a selector invokes on a registered channel.
///
/// The three `translate_*` methods must stay pure bit manipulation: the
/// selector calls them from its own thread concurrently with anything but
/// a blocking operation on the channel.
pub trait SelectableChannel: Send + Sync {
    /// Descriptor the selector polls.
    fn fd(&self) -> RawFd;

    /// Interest bits this channel understands.
    fn valid_ops(&self) -> i32;

    fn selectable(&self) -> &SelectableCore;

    fn is_open(&self) -> bool {
        self.selectable().is_open()
    }

    /// Convert `interest` into a native mask and hand it to the key's selector.
    fn translate_and_set_interest_ops(&self, interest: i32, key: &SelectionKey);

    /// Replace the key's ready set from `events`. Returns true if a new bit
    /// became ready.
    fn translate_and_set_ready_ops(&self, events: i32, key: &SelectionKey) -> bool;

    /// Merge `events` into the key's ready set. Returns true if a new bit
    /// became ready.
    fn translate_and_update_ready_ops(&self, events: i32, key: &SelectionKey) -> bool;

    /// Release the descriptor for good once closed and unregistered.
    fn kill(&self) -> Result<(), ChannelError>;

    /// Selector-facing: drop `key` from this channel's key set, killing the
    /// channel if it was the last key of a closed channel.
    fn deregister(&self, key: &SelectionKey) -> Result<(), ChannelError> {
        if self.selectable().remove_key(key) {
            self.kill()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selection key
// ---------------------------------------------------------------------------

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Association between one channel and one selector.
pub struct SelectionKey {
    id: u64,
    selector: Weak<dyn Selector>,
    channel: Weak<dyn SelectableChannel>,
    interest_ops: AtomicI32,
    ready_ops: AtomicI32,
    valid: AtomicBool,
}

impl SelectionKey {
    pub(crate) fn new(
        selector: &Arc<dyn Selector>,
        channel: Weak<dyn SelectableChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            selector: Arc::downgrade(selector),
            channel,
            interest_ops: AtomicI32::new(0),
            ready_ops: AtomicI32::new(0),
            valid: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The selector, unless it has already been dropped.
    #[must_use]
    pub fn selector(&self) -> Option<Arc<dyn Selector>> {
        self.selector.upgrade()
    }

    /// Returns true if this key was created by `selector`.
    #[must_use]
    pub fn belongs_to(&self, selector: &Arc<dyn Selector>) -> bool {
        std::ptr::addr_eq(self.selector.as_ptr(), Arc::as_ptr(selector))
    }

    /// Hand a native poll mask to the owning selector.
    pub fn put_event_ops(&self, events: i32) {
        if let Some(selector) = self.selector() {
            selector.put_event_ops(self, events);
        }
    }

    /// The channel, unless it has already been dropped.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn SelectableChannel>> {
        self.channel.upgrade()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn interest_ops(&self) -> i32 {
        self.interest_ops.load(Ordering::Acquire)
    }

    /// Change the interest set and push the matching native mask to the
    /// selector.
    pub fn set_interest_ops(&self, ops: i32) -> Result<(), ChannelError> {
        if !self.is_valid() {
            return Err(ChannelError::IllegalSelector);
        }
        let channel = self.channel().ok_or(ChannelError::Closed)?;
        if !ops_within(ops, channel.valid_ops()) {
            return Err(ChannelError::InvalidInterestOps(ops));
        }
        self.interest_ops.store(ops, Ordering::Release);
        channel.translate_and_set_interest_ops(ops, self);
        Ok(())
    }

    #[must_use]
    pub fn ready_ops(&self) -> i32 {
        self.ready_ops.load(Ordering::Acquire)
    }

    /// Store a ready set computed by a translate callback.
    pub fn set_ready_ops(&self, ops: i32) {
        self.ready_ops.store(ops, Ordering::Release);
    }

    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        self.ready_ops() & OP_ACCEPT != 0
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.ready_ops() & OP_READ != 0
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.ready_ops() & OP_WRITE != 0
    }

    #[must_use]
    pub fn is_connectable(&self) -> bool {
        self.ready_ops() & OP_CONNECT != 0
    }

    /// Invalidate the key and queue it for deregistration. Idempotent.
    pub fn cancel(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(selector) = self.selector() {
            selector.cancel_key(self);
        }
    }

    /// Invalidate without notifying the selector; used by a selector that is
    /// already tearing the key down.
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("id", &self.id)
            .field("interest_ops", &self.interest_ops())
            .field("ready_ops", &self.ready_ops())
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Selector stand-in that records what channels hand it.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(u64, i32)>>,
        cancelled: Mutex<Vec<u64>>,
    }

    impl Selector for Recorder {
        fn is_open(&self) -> bool {
            true
        }
        fn put_event_ops(&self, key: &SelectionKey, events: i32) {
            self.events.lock().push((key.id(), events));
        }
        fn register_key(&self, _key: Arc<SelectionKey>) -> Result<(), ChannelError> {
            Ok(())
        }
        fn cancel_key(&self, key: &SelectionKey) {
            self.cancelled.lock().push(key.id());
        }
    }

    struct Dummy {
        core: SelectableCore,
    }

    impl SelectableChannel for Dummy {
        fn fd(&self) -> RawFd {
            -1
        }
        fn valid_ops(&self) -> i32 {
            OP_ACCEPT
        }
        fn selectable(&self) -> &SelectableCore {
            &self.core
        }
        fn translate_and_set_interest_ops(&self, interest: i32, key: &SelectionKey) {
            key.put_event_ops(interest * 2);
        }
        fn translate_and_set_ready_ops(&self, events: i32, key: &SelectionKey) -> bool {
            key.set_ready_ops(events);
            true
        }
        fn translate_and_update_ready_ops(&self, events: i32, key: &SelectionKey) -> bool {
            key.set_ready_ops(key.ready_ops() | events);
            true
        }
        fn kill(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn key_pair() -> (Arc<Recorder>, Arc<Dummy>, Arc<SelectionKey>) {
        let recorder = Arc::new(Recorder::default());
        let channel = Arc::new(Dummy {
            core: SelectableCore::new(),
        });
        let selector: Arc<dyn Selector> = recorder.clone();
        let as_dyn: Arc<dyn SelectableChannel> = channel.clone();
        let weak = Arc::downgrade(&as_dyn);
        let key = SelectionKey::new(&selector, weak);
        (recorder, channel, key)
    }

    #[test]
    fn interest_ops_route_through_channel() {
        let (recorder, _channel, key) = key_pair();
        key.set_interest_ops(OP_ACCEPT).unwrap();
        assert_eq!(key.interest_ops(), OP_ACCEPT);
        assert_eq!(recorder.events.lock().as_slice(), &[(key.id(), OP_ACCEPT * 2)]);
    }

    #[test]
    fn interest_ops_outside_valid_set_are_rejected() {
        let (_recorder, _channel, key) = key_pair();
        let err = key.set_interest_ops(OP_READ).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidInterestOps(ops) if ops == OP_READ));
        assert_eq!(key.interest_ops(), 0);
    }

    #[test]
    fn cancel_notifies_selector_once() {
        let (recorder, _channel, key) = key_pair();
        key.cancel();
        key.cancel();
        assert!(!key.is_valid());
        assert_eq!(recorder.cancelled.lock().len(), 1);
        assert!(key.set_interest_ops(OP_ACCEPT).is_err());
    }

    #[test]
    fn dropped_channel_reports_closed() {
        let (_recorder, channel, key) = key_pair();
        drop(channel);
        assert!(key.channel().is_none());
        assert!(matches!(key.set_interest_ops(OP_ACCEPT), Err(ChannelError::Closed)));
    }

    #[test]
    fn ready_predicates_follow_bits() {
        let (_recorder, _channel, key) = key_pair();
        key.set_ready_ops(OP_ACCEPT | OP_WRITE);
        assert!(key.is_acceptable());
        assert!(key.is_writable());
        assert!(!key.is_readable());
        assert!(!key.is_connectable());
    }
}
