//! Shared machinery of every selectable channel: the open flag, blocking
//! mode, the key set and the begin/end cancellation bracket.
//!
//! Lock order: `close_lock`, then `reg_lock`, then `keys`. The key lock is
//! never held while a channel is killed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use frankennet_core::poll::ops_within;
use parking_lot::Mutex;

use crate::error::ChannelError;
use crate::interrupt::{self, BlockingRegion, Interruptible};
use crate::selector::{SelectableChannel, SelectionKey, Selector};

#[derive(Debug)]
pub struct SelectableCore {
    open: AtomicBool,
    close_lock: Mutex<()>,
    /// Guards the blocking flag and serialises registration.
    reg_lock: Mutex<bool>,
    keys: Mutex<Vec<Arc<SelectionKey>>>,
    /// Thread whose interrupt closed this channel, until it observes it.
    interrupted_by: Mutex<Option<ThreadId>>,
}

impl Default for SelectableCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectableCore {
    /// Open, blocking, unregistered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            close_lock: Mutex::new(()),
            reg_lock: Mutex::new(true),
            keys: Mutex::new(Vec::new()),
            interrupted_by: Mutex::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        *self.reg_lock.lock()
    }

    /// Returns true while any key, valid or cancelled, still names this
    /// channel.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        !self.keys.lock().is_empty()
    }

    /// The key registered with `selector`, if any.
    #[must_use]
    pub fn key_for(&self, selector: &Arc<dyn Selector>) -> Option<Arc<SelectionKey>> {
        self.keys
            .lock()
            .iter()
            .find(|k| k.belongs_to(selector))
            .cloned()
    }

    fn has_valid_key(&self) -> bool {
        self.keys.lock().iter().any(|k| k.is_valid())
    }

    // -----------------------------------------------------------------------
    // Blocking mode
    // -----------------------------------------------------------------------

    /// Switch blocking mode, calling `apply` to change the descriptor.
    pub fn configure_blocking<F>(&self, block: bool, apply: F) -> Result<(), ChannelError>
    where
        F: FnOnce(bool) -> Result<(), ChannelError>,
    {
        let mut blocking = self.reg_lock.lock();
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        if *blocking == block {
            return Ok(());
        }
        if block && self.has_valid_key() {
            return Err(ChannelError::IllegalBlockingMode);
        }
        apply(block)?;
        *blocking = block;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register `channel` with `selector` for `ops`, or update the interest
    /// set of an existing registration.
    pub fn register(
        &self,
        channel: Weak<dyn SelectableChannel>,
        valid_ops: i32,
        selector: &Arc<dyn Selector>,
        ops: i32,
    ) -> Result<Arc<SelectionKey>, ChannelError> {
        let blocking = self.reg_lock.lock();
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        if !ops_within(ops, valid_ops) {
            return Err(ChannelError::InvalidInterestOps(ops));
        }
        if *blocking {
            return Err(ChannelError::IllegalBlockingMode);
        }
        if let Some(key) = self.key_for(selector).filter(|k| k.is_valid()) {
            key.set_interest_ops(ops)?;
            return Ok(key);
        }
        if !selector.is_open() {
            return Err(ChannelError::IllegalSelector);
        }
        let key = SelectionKey::new(selector, channel);
        selector.register_key(Arc::clone(&key))?;
        self.keys.lock().push(Arc::clone(&key));
        key.set_interest_ops(ops)?;
        Ok(key)
    }

    /// Remove `key`. Returns true if the channel is now closed with no keys
    /// left, i.e. ready to be killed.
    pub fn remove_key(&self, key: &SelectionKey) -> bool {
        let mut keys = self.keys.lock();
        keys.retain(|k| k.id() != key.id());
        key.invalidate();
        keys.is_empty() && !self.is_open()
    }

    fn cancel_keys(&self) {
        let keys: Vec<_> = self.keys.lock().clone();
        for key in keys {
            key.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close once: flip the open flag, run `imp`, then cancel every key.
    /// Later calls do nothing.
    pub fn close<F>(&self, imp: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Result<(), ChannelError>,
    {
        self.close_with(None, imp)
    }

    /// Close on behalf of an interrupt aimed at `target`.
    pub fn close_on_interrupt<F>(&self, target: ThreadId, imp: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Result<(), ChannelError>,
    {
        self.close_with(Some(target), imp)
    }

    fn close_with<F>(&self, by: Option<ThreadId>, imp: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Result<(), ChannelError>,
    {
        let _guard = self.close_lock.lock();
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if by.is_some() {
            *self.interrupted_by.lock() = by;
        }
        let result = imp();
        self.cancel_keys();
        result
    }

    // -----------------------------------------------------------------------
    // begin / end
    // -----------------------------------------------------------------------

    /// Enter a blocking region with `blocker` as the thread's interrupt
    /// target.
    pub fn begin(&self, blocker: Arc<dyn Interruptible>) -> BlockingRegion {
        interrupt::begin(blocker)
    }

    /// Leave a blocking region.
    ///
    /// Fails with `ClosedByInterrupt` if this thread's interrupt closed the
    /// channel, or `AsynchronousClose` if the operation did not complete and
    /// the channel is closed.
    pub fn end(&self, region: BlockingRegion, completed: bool) -> Result<(), ChannelError> {
        drop(region);
        {
            let mut by = self.interrupted_by.lock();
            if *by == Some(thread::current().id()) {
                *by = None;
                return Err(ChannelError::ClosedByInterrupt);
            }
        }
        if !completed && !self.is_open() {
            return Err(ChannelError::AsynchronousClose);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn starts_open_and_blocking() {
        let core = SelectableCore::new();
        assert!(core.is_open());
        assert!(core.is_blocking());
        assert!(!core.is_registered());
    }

    #[test]
    fn close_runs_once() {
        let core = SelectableCore::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            core.close(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!core.is_open());
    }

    #[test]
    fn configure_blocking_skips_unchanged_and_rejects_closed() {
        let core = SelectableCore::new();
        core.configure_blocking(true, |_| panic!("unchanged mode must not reach the fd"))
            .unwrap();
        core.configure_blocking(false, |b| {
            assert!(!b);
            Ok(())
        })
        .unwrap();
        assert!(!core.is_blocking());
        core.close(|| Ok(())).unwrap();
        assert!(matches!(
            core.configure_blocking(true, |_| Ok(())),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn failed_apply_keeps_mode() {
        let core = SelectableCore::new();
        let err = core
            .configure_blocking(false, |_| Err(ChannelError::Io(std::io::Error::other("boom"))))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Io(_)));
        assert!(core.is_blocking());
    }

    #[test]
    fn end_reports_asynchronous_close() {
        struct Noop;
        impl Interruptible for Noop {
            fn interrupt(&self, _target: ThreadId) {}
        }
        let core = SelectableCore::new();
        let region = core.begin(Arc::new(Noop));
        core.close(|| Ok(())).unwrap();
        assert!(matches!(
            core.end(region, false),
            Err(ChannelError::AsynchronousClose)
        ));

        let region = core.begin(Arc::new(Noop));
        core.end(region, true).unwrap();
    }

    #[test]
    fn end_reports_close_by_interrupt_to_the_target_only() {
        struct Noop;
        impl Interruptible for Noop {
            fn interrupt(&self, _target: ThreadId) {}
        }
        let core = Arc::new(SelectableCore::new());
        let me = thread::current().id();
        core.close_on_interrupt(me, || Ok(())).unwrap();

        let other = Arc::clone(&core);
        let seen_elsewhere = thread::spawn(move || {
            let region = other.begin(Arc::new(Noop));
            other.end(region, false)
        })
        .join()
        .unwrap();
        assert!(matches!(seen_elsewhere, Err(ChannelError::AsynchronousClose)));

        let region = core.begin(Arc::new(Noop));
        assert!(matches!(
            core.end(region, false),
            Err(ChannelError::ClosedByInterrupt)
        ));
        // Reported once.
        let region = core.begin(Arc::new(Noop));
        assert!(matches!(
            core.end(region, false),
            Err(ChannelError::AsynchronousClose)
        ));
    }
}
