//! Listening TCP channel.
//!
//! Two locks keep the channel honest:
//!
//! - `lock` serialises `bind` and `accept`. It is held across the accept
//!   syscall, so at most one thread is ever parked in it.
//! - `state_lock` guards `state`, the local address and the lazily built
//!   option adapter and adaptor view. It is never held across a syscall that
//!   can park.
//!
//! When both are needed `lock` is taken first. Events go to the provider's
//! sink only after `state_lock` has been released.
//!
//! A thread parked in accept records its native token in `thread`. `close`
//! samples that token under `state_lock` after releasing the descriptor and
//! signals the thread, which leaves the syscall with `EINTR`, sees the
//! channel closed and gives up.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use frankennet_core::io_status::{self, INTERRUPTED, UNAVAILABLE};
use frankennet_core::net::{AddressCheck, check_address, effective_backlog};
use frankennet_core::poll::{
    POLLIN, ReadyTranslation, SERVER_VALID_OPS, accept_interest_to_events,
    translate_accept_ready_ops,
};
use frankennet_core::state::{ChannelState, KillAction, kill_action, kill_permitted};
use parking_lot::Mutex;

use crate::adaptor::ServerSocketAdaptor;
use crate::error::{ChannelError, socket_closed};
use crate::event_log::{ChannelEvent, EventKind};
use crate::fd::{FdUse, SocketFd};
use crate::interrupt::Interruptible;
use crate::native_thread::NativeThread;
use crate::net;
use crate::options::TcpOptions;
use crate::provider::{SelectorProvider, next_channel_id};
use crate::selectable::SelectableCore;
use crate::selector::{SelectableChannel, SelectionKey, Selector};
use crate::socket_channel::SocketChannel;

/// Fields guarded by `state_lock`.
#[derive(Debug, Default)]
struct Guarded {
    state: ChannelState,
    local_address: Option<SocketAddr>,
    options: Option<Arc<TcpOptions>>,
    adaptor: Option<Arc<ServerSocketAdaptor>>,
}

/// Result of one accept attempt.
enum Accept0 {
    Accepted(OwnedFd, SocketAddr),
    /// `UNAVAILABLE` or `INTERRUPTED`.
    Status(i32),
}

pub struct ServerSocketChannel {
    me: Weak<Self>,
    id: u64,
    provider: Arc<SelectorProvider>,
    fd: SocketFd,
    core: SelectableCore,
    lock: Mutex<()>,
    state_lock: Mutex<Guarded>,
    /// Native token of the thread parked in accept, or 0.
    thread: AtomicU64,
}

impl ServerSocketChannel {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    pub(crate) fn open(provider: Arc<SelectorProvider>) -> Result<Arc<Self>, ChannelError> {
        let fd = net::server_socket(true)?;
        Ok(Self::with_fd(provider, fd, None))
    }

    pub(crate) fn from_fd(
        provider: Arc<SelectorProvider>,
        fd: OwnedFd,
    ) -> Result<Arc<Self>, ChannelError> {
        let local = net::local_address(fd.as_raw_fd())?;
        // An unbound socket reports the wildcard address with port 0.
        let local = (local.port() != 0).then_some(local);
        Ok(Self::with_fd(provider, fd, local))
    }

    fn with_fd(
        provider: Arc<SelectorProvider>,
        fd: OwnedFd,
        local_address: Option<SocketAddr>,
    ) -> Arc<Self> {
        let channel = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: next_channel_id(),
            provider,
            fd: SocketFd::new(fd),
            core: SelectableCore::new(),
            lock: Mutex::new(()),
            state_lock: Mutex::new(Guarded {
                state: ChannelState::InUse,
                local_address,
                ..Guarded::default()
            }),
            thread: AtomicU64::new(0),
        });
        let mut event = ChannelEvent::new(EventKind::Open, channel.id).with_fd(channel.fd.raw());
        if let Some(local) = local_address {
            event = event.with_local(local);
        }
        channel.provider.emit(event);
        channel
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Process-unique id, as reported in events.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<SelectorProvider> {
        &self.provider
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.core.is_blocking()
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.core.is_registered()
    }

    #[must_use]
    pub fn key_for(&self, selector: &Arc<dyn Selector>) -> Option<Arc<SelectionKey>> {
        self.core.key_for(selector)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state_lock.lock().state
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.state_lock.lock().local_address.is_some()
    }

    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.state_lock.lock().local_address
    }

    /// Legacy blocking view, created on first use.
    pub fn socket(&self) -> Arc<ServerSocketAdaptor> {
        let mut st = self.state_lock.lock();
        Arc::clone(
            st.adaptor
                .get_or_insert_with(|| Arc::new(ServerSocketAdaptor::new(self.me.clone()))),
        )
    }

    /// TCP option adapter, created on first use.
    pub fn options(&self) -> Arc<TcpOptions> {
        let mut st = self.state_lock.lock();
        let opts = st.options.get_or_insert_with(|| {
            let (get, set) = (self.me.clone(), self.me.clone());
            Arc::new(TcpOptions::new(
                move |opt| {
                    let ch = get.upgrade().ok_or_else(socket_closed)?;
                    net::get_int_option(ch.live_fd()?.raw(), opt)
                },
                move |opt, value| {
                    let ch = set.upgrade().ok_or_else(socket_closed)?;
                    net::set_int_option(ch.live_fd()?.raw(), opt, value)
                },
            ))
        });
        Arc::clone(opts)
    }

    /// Borrow the descriptor for a syscall. A concurrent close shuts the
    /// socket down but leaves the number allocated until the use drops.
    fn live_fd(&self) -> io::Result<FdUse<'_>> {
        self.fd.acquire()
    }

    // -----------------------------------------------------------------------
    // bind
    // -----------------------------------------------------------------------

    /// Bind to `local` (`None` means any interface, ephemeral port) and start
    /// listening. A `backlog` below one selects the default queue depth.
    pub fn bind(&self, local: Option<SocketAddr>, backlog: i32) -> Result<(), ChannelError> {
        let _io = self.lock.lock();
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        if self.is_bound() {
            return Err(ChannelError::AlreadyBound);
        }
        let addr = match check_address(local) {
            AddressCheck::Accepted(addr) => addr,
            AddressCheck::UnsupportedFamily => return Err(ChannelError::UnsupportedAddressType),
        };
        if let Err(denial) = self.provider.check_listen(addr.port()) {
            self.provider.emit(
                ChannelEvent::new(EventKind::ListenDenied, self.id)
                    .with_detail(denial.to_string()),
            );
            return Err(denial.into());
        }

        let held = self.live_fd()?;
        let fd = held.raw();
        let backlog = effective_backlog(backlog);
        net::bind(fd, &addr)?;
        net::listen(fd, backlog)?;
        let bound = net::local_address(fd)?;
        self.state_lock.lock().local_address = Some(bound);

        self.provider.emit(
            ChannelEvent::new(EventKind::Bind, self.id)
                .with_fd(fd)
                .with_local(bound)
                .with_detail(format!("backlog={backlog}")),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // accept
    // -----------------------------------------------------------------------

    /// Accept one connection.
    ///
    /// Returns `Ok(None)` only when the channel is non-blocking and nothing
    /// is pending. The accepted channel is always in blocking mode.
    pub fn accept(&self) -> Result<Option<SocketChannel>, ChannelError> {
        let _io = self.lock.lock();
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        if !self.is_bound() {
            return Err(ChannelError::NotYetBound);
        }
        let me = self.me.upgrade().ok_or(ChannelError::Closed)?;
        let blocker: Arc<dyn Interruptible> = me;

        let region = self.core.begin(blocker);
        let attempt = if self.is_open() {
            self.thread.store(NativeThread::current(), Ordering::SeqCst);
            self.accept_loop()
        } else {
            Ok(Accept0::Status(INTERRUPTED))
        };
        self.thread.store(0, Ordering::SeqCst);
        let completed = matches!(attempt, Ok(Accept0::Accepted(..)));
        self.core.end(region, completed)?;

        let (newfd, remote) = match attempt? {
            Accept0::Accepted(newfd, remote) => (newfd, remote),
            Accept0::Status(n) => {
                debug_assert!(io_status::check(n));
                return Ok(None);
            }
        };

        net::configure_blocking(newfd.as_raw_fd(), true)?;
        let channel = SocketChannel::new(Arc::clone(&self.provider), newfd, remote);
        if let Err(denial) = self.provider.check_accept(remote) {
            self.provider.emit(
                ChannelEvent::new(EventKind::AcceptDenied, self.id)
                    .with_remote(remote)
                    .with_detail(denial.to_string()),
            );
            let _ = channel.close();
            return Err(denial.into());
        }

        let mut event = ChannelEvent::new(EventKind::Accept, self.id)
            .with_fd(channel.fd())
            .with_remote(remote);
        if let Ok(local) = channel.local_address() {
            event = event.with_local(local);
        }
        self.provider.emit(event);
        Ok(Some(channel))
    }

    /// Retry while the syscall is interrupted and the channel stays open.
    fn accept_loop(&self) -> io::Result<Accept0> {
        loop {
            match self.accept0()? {
                Accept0::Status(INTERRUPTED) if self.is_open() => continue,
                other => return Ok(other),
            }
        }
    }

    /// One accept attempt. A non-blocking descriptor with nothing pending
    /// reports `UNAVAILABLE` without entering the accept syscall.
    fn accept0(&self) -> io::Result<Accept0> {
        let held = self.live_fd()?;
        let fd = held.raw();
        if !net::is_blocking(fd)? {
            match net::poll(fd, POLLIN, 0) {
                Ok(0) => return Ok(Accept0::Status(UNAVAILABLE)),
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    return Ok(Accept0::Status(INTERRUPTED));
                }
                Err(e) => return Err(e),
            }
        }
        match net::accept(fd) {
            Ok((newfd, remote)) => Ok(Accept0::Accepted(newfd, remote)),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINTR) => Ok(Accept0::Status(INTERRUPTED)),
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    Ok(Accept0::Status(UNAVAILABLE))
                }
                // A close while we were inside accept shuts the socket down.
                Some(libc::EINVAL | libc::EBADF) if self.fd.is_closed() => Err(socket_closed()),
                _ => Err(e),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Blocking mode and registration
    // -----------------------------------------------------------------------

    pub fn configure_blocking(&self, block: bool) -> Result<(), ChannelError> {
        self.core.configure_blocking(block, |block| {
            net::configure_blocking(self.live_fd()?.raw(), block)?;
            Ok(())
        })
    }

    /// Register with `selector` for `ops`, or update an existing
    /// registration's interest set.
    pub fn register(
        &self,
        selector: &Arc<dyn Selector>,
        ops: i32,
    ) -> Result<Arc<SelectionKey>, ChannelError> {
        let me: Weak<dyn SelectableChannel> = self.me.clone();
        self.core.register(me, SERVER_VALID_OPS, selector, ops)
    }

    // -----------------------------------------------------------------------
    // close / kill
    // -----------------------------------------------------------------------

    /// Close the channel. A thread parked in `accept` is knocked out of it
    /// and fails with `AsynchronousClose`. Repeated calls do nothing.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.core.close(|| self.impl_close())
    }

    fn impl_close(&self) -> Result<(), ChannelError> {
        let (close_event, killed, released, signalled) = {
            let mut st = self.state_lock.lock();
            let released = if st.state == ChannelState::Killed {
                Ok(())
            } else {
                self.fd.close()
            };

            let parked = self.thread.load(Ordering::SeqCst);
            let signalled = NativeThread::signal(parked);

            let mut event = ChannelEvent::new(EventKind::Close, self.id).with_fd(self.fd.raw());
            if parked != 0 {
                event = event.with_detail("signalled parked acceptor");
            }
            if let Err(e) = released.as_ref().or(signalled.as_ref()) {
                event = event.with_errno(e.raw_os_error());
            }

            let killed = if self.core.is_registered() {
                None
            } else {
                Some(self.kill_locked(&mut st))
            };
            (event, killed, released, signalled)
        };

        // Sinks run with no channel lock held.
        self.provider.emit(close_event);
        let kill_result = match killed {
            Some((kill_event, result)) => {
                if let Some(event) = kill_event {
                    self.provider.emit(event);
                }
                result
            }
            None => Ok(()),
        };
        released?;
        signalled?;
        kill_result?;
        Ok(())
    }

    /// Kill under `state_lock`. Returns the event to emit once the lock is
    /// released, and the outcome of releasing the descriptor.
    fn kill_locked(&self, st: &mut Guarded) -> (Option<ChannelEvent>, io::Result<()>) {
        match kill_action(st.state) {
            KillAction::AlreadyKilled => (None, Ok(())),
            KillAction::PromoteOnly => {
                st.state = ChannelState::Killed;
                (None, Ok(()))
            }
            KillAction::ReleaseAndPromote => {
                if !kill_permitted(st.state, self.is_open(), self.core.is_registered()) {
                    return (None, Ok(()));
                }
                let released = self.fd.close();
                st.state = ChannelState::Killed;
                let event = ChannelEvent::new(EventKind::Kill, self.id)
                    .with_fd(self.fd.raw())
                    .with_errno(released.as_ref().err().and_then(io::Error::raw_os_error));
                (Some(event), released)
            }
        }
    }

    /// Poll the descriptor for a pending connection. Used by the adaptor's
    /// timed accept.
    pub(crate) fn poll_acceptable(&self, timeout_ms: i32) -> Result<bool, ChannelError> {
        let held = self.live_fd()?;
        match net::poll(held.raw(), POLLIN, timeout_ms) {
            Ok(revents) => Ok(revents != 0),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Readiness translation
    // -----------------------------------------------------------------------

    fn translate_ready_ops(&self, events: i32, initial_ops: i32, key: &SelectionKey) -> bool {
        let old_ops = key.ready_ops();
        match translate_accept_ready_ops(events, initial_ops, key.interest_ops(), old_ops) {
            ReadyTranslation::Invalid => {
                self.pollnval(key);
                false
            }
            ReadyTranslation::Ready { ops, changed } => {
                key.set_ready_ops(ops);
                changed
            }
        }
    }

    /// `POLLNVAL` is expected once the descriptor has been closed under the
    /// selector. Seeing it on an open channel means someone else closed it.
    fn pollnval(&self, key: &SelectionKey) {
        if !self.is_open() {
            return;
        }
        let policy = self.provider.pollnval_policy();
        self.provider.emit(
            ChannelEvent::new(EventKind::PollnvalWithoutPreclose, self.id)
                .with_fd(self.fd.raw())
                .with_detail(format!("key={} policy={policy:?}", key.id())),
        );
        if policy.invalidates_key() {
            key.cancel();
        }
    }
}

impl SelectableChannel for ServerSocketChannel {
    fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    fn valid_ops(&self) -> i32 {
        SERVER_VALID_OPS
    }

    fn selectable(&self) -> &SelectableCore {
        &self.core
    }

    fn translate_and_set_interest_ops(&self, interest: i32, key: &SelectionKey) {
        key.put_event_ops(accept_interest_to_events(interest));
    }

    fn translate_and_set_ready_ops(&self, events: i32, key: &SelectionKey) -> bool {
        self.translate_ready_ops(events, 0, key)
    }

    fn translate_and_update_ready_ops(&self, events: i32, key: &SelectionKey) -> bool {
        self.translate_ready_ops(events, key.ready_ops(), key)
    }

    fn kill(&self) -> Result<(), ChannelError> {
        let (event, released) = {
            let mut st = self.state_lock.lock();
            self.kill_locked(&mut st)
        };
        if let Some(event) = event {
            self.provider.emit(event);
        }
        Ok(released?)
    }
}

impl Interruptible for ServerSocketChannel {
    fn interrupt(&self, target: ThreadId) {
        self.provider.emit(
            ChannelEvent::new(EventKind::Interrupt, self.id)
                .with_detail(format!("{target:?}")),
        );
        let _ = self.core.close_on_interrupt(target, || self.impl_close());
    }
}

impl AsRawFd for ServerSocketChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

impl fmt::Display for ServerSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerSocketChannel[")?;
        if !self.is_open() {
            f.write_str("closed")?;
        } else {
            match self.local_address() {
                Some(addr) => write!(f, "{addr}")?,
                None => f.write_str("unbound")?,
            }
        }
        f.write_str("]")
    }
}

impl fmt::Debug for ServerSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocketChannel")
            .field("id", &self.id)
            .field("fd", &self.fd.raw())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
