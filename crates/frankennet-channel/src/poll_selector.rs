//! `poll(2)` based selector.
//!
//! Registered keys are polled with the native mask their channel last handed
//! over through `put_event_ops`. Cancelled keys are deregistered before and
//! after every poll. No selector lock is held while channel callbacks run,
//! so a callback may cancel its own key.
//!
//! A pipe is polled alongside the keys. Cancelling a key, closing the selector
//! or calling [`PollSelector::wakeup`] writes to it, so a thread waiting in
//! `select(None)` returns and deregisters cancelled keys.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::ChannelError;
use crate::net;
use crate::provider::SelectorProvider;
use crate::selector::{SelectionKey, Selector};

struct Registration {
    key: Arc<SelectionKey>,
    events: i32,
}

pub struct PollSelector {
    provider: Arc<SelectorProvider>,
    open: AtomicBool,
    registered: Mutex<HashMap<u64, Registration>>,
    cancelled: Mutex<Vec<Arc<SelectionKey>>>,
    selected: Mutex<Vec<Arc<SelectionKey>>>,
    wake_rd: OwnedFd,
    wake_wr: OwnedFd,
}

impl PollSelector {
    pub(crate) fn new(provider: Arc<SelectorProvider>) -> io::Result<Arc<Self>> {
        let (wake_rd, wake_wr) = net::wakeup_pipe()?;
        Ok(Arc::new(Self {
            provider,
            open: AtomicBool::new(true),
            registered: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(Vec::new()),
            selected: Mutex::new(Vec::new()),
            wake_rd,
            wake_wr,
        }))
    }

    /// Make a blocked or the next `select` return at once. Wakeups coalesce.
    pub fn wakeup(&self) {
        let _ = net::signal_wakeup(self.wake_wr.as_raw_fd());
    }

    /// This selector as a channel-facing handle.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> Arc<dyn Selector> {
        let me: Arc<dyn Selector> = self.clone();
        me
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<SelectorProvider> {
        &self.provider
    }

    /// Every registered key, cancelled ones included until deregistered.
    #[must_use]
    pub fn keys(&self) -> Vec<Arc<SelectionKey>> {
        self.registered
            .lock()
            .values()
            .map(|r| Arc::clone(&r.key))
            .collect()
    }

    /// Keys found ready by past selections and not yet cleared.
    #[must_use]
    pub fn selected_keys(&self) -> Vec<Arc<SelectionKey>> {
        self.selected.lock().clone()
    }

    pub fn clear_selected_keys(&self) {
        self.selected.lock().clear();
    }

    /// Remove one key from the selected set. Returns true if it was there.
    pub fn remove_selected(&self, key: &SelectionKey) -> bool {
        let mut selected = self.selected.lock();
        let before = selected.len();
        selected.retain(|k| k.id() != key.id());
        selected.len() != before
    }

    /// Native mask currently recorded for `key`.
    #[must_use]
    pub fn event_ops(&self, key: &SelectionKey) -> Option<i32> {
        self.registered.lock().get(&key.id()).map(|r| r.events)
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Poll without waiting.
    pub fn select_now(&self) -> Result<usize, ChannelError> {
        self.select(Some(Duration::ZERO))
    }

    /// Wait for readiness. `None` waits indefinitely. Returns the number of
    /// keys whose ready set gained a bit.
    pub fn select(&self, timeout: Option<Duration>) -> Result<usize, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::IllegalSelector);
        }
        self.process_cancelled()?;

        let polled: Vec<(Arc<SelectionKey>, libc::pollfd)> = self
            .registered
            .lock()
            .values()
            .filter(|r| r.key.is_valid())
            .filter_map(|r| {
                let channel = r.key.channel()?;
                Some((
                    Arc::clone(&r.key),
                    libc::pollfd {
                        fd: channel.fd(),
                        events: r.events as libc::c_short,
                        revents: 0,
                    },
                ))
            })
            .collect();
        let mut fds: Vec<libc::pollfd> = polled.iter().map(|(_, p)| *p).collect();
        fds.push(libc::pollfd {
            fd: self.wake_rd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };
        match net::poll_many(&mut fds, timeout_ms) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
        if fds.last().is_some_and(|w| w.revents != 0) {
            net::drain(self.wake_rd.as_raw_fd())?;
        }

        let already: HashSet<u64> = self.selected.lock().iter().map(|k| k.id()).collect();
        let mut updated = 0;
        let mut newly_selected = Vec::new();
        for ((key, _), pfd) in polled.iter().zip(&fds) {
            let revents = i32::from(pfd.revents);
            if revents == 0 {
                continue;
            }
            let Some(channel) = key.channel() else { continue };
            if already.contains(&key.id()) {
                if channel.translate_and_update_ready_ops(revents, key) {
                    updated += 1;
                }
            } else {
                channel.translate_and_set_ready_ops(revents, key);
                if key.ready_ops() & key.interest_ops() != 0 {
                    newly_selected.push(Arc::clone(key));
                    updated += 1;
                }
            }
        }
        self.selected.lock().extend(newly_selected);

        self.process_cancelled()?;
        Ok(updated)
    }

    /// Deregister every cancelled key from its channel.
    fn process_cancelled(&self) -> Result<(), ChannelError> {
        let cancelled: Vec<_> = std::mem::take(&mut *self.cancelled.lock());
        let mut first_err = None;
        for key in cancelled {
            self.registered.lock().remove(&key.id());
            self.remove_selected(&key);
            let Some(channel) = key.channel() else { continue };
            if let Err(e) = channel.deregister(&key) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Close the selector, deregistering every key. Idempotent.
    pub fn close(&self) -> Result<(), ChannelError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut keys: Vec<_> = self
            .registered
            .lock()
            .drain()
            .map(|(_, r)| r.key)
            .collect();
        keys.append(&mut self.cancelled.lock());
        self.selected.lock().clear();
        self.wakeup();

        let mut first_err = None;
        for key in keys {
            key.invalidate();
            let Some(channel) = key.channel() else { continue };
            if let Err(e) = channel.deregister(&key) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Selector for PollSelector {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn put_event_ops(&self, key: &SelectionKey, events: i32) {
        if let Some(reg) = self.registered.lock().get_mut(&key.id()) {
            reg.events = events;
        }
    }

    fn register_key(&self, key: Arc<SelectionKey>) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::IllegalSelector);
        }
        self.registered
            .lock()
            .insert(key.id(), Registration { key, events: 0 });
        Ok(())
    }

    fn cancel_key(&self, key: &SelectionKey) {
        let found = self
            .registered
            .lock()
            .get(&key.id())
            .map(|r| Arc::clone(&r.key));
        if let Some(key) = found {
            self.cancelled.lock().push(key);
            self.wakeup();
        }
    }
}

impl Drop for PollSelector {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for PollSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSelector")
            .field("open", &self.is_open())
            .field("keys", &self.registered.lock().len())
            .finish_non_exhaustive()
    }
}
