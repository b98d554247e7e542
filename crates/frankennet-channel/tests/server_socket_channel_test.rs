//! Integration test: server-socket channel lifecycle over loopback.
//!
//! Covers bind-once, accept round trip, non-blocking idle accept, close and
//! interrupt cancellation of a parked acceptor, lock serialisation, security
//! hooks and the emitted event stream.
//!
//! Run: cargo test -p frankennet-channel --test server_socket_channel_test

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use frankennet_channel::{
    AllowListPolicy, ChannelError, ChannelEvent, DenyAll, ErrorKind, EventKind, EventSink,
    MemorySink, SelectableChannel, SelectorProvider, ServerSocketChannel, interrupt,
};
use frankennet_core::state::ChannelState;

fn loopback() -> Option<SocketAddr> {
    Some("127.0.0.1:0".parse().unwrap())
}

fn bound_channel() -> Arc<ServerSocketChannel> {
    let ch = SelectorProvider::new().open_server_socket_channel().unwrap();
    ch.bind(loopback(), 0).unwrap();
    ch
}

/// Give a spawned acceptor time to park in the syscall.
fn settle() {
    thread::sleep(Duration::from_millis(100));
}

#[test]
fn bind_reports_ephemeral_port() {
    let ch = bound_channel();
    assert!(ch.is_bound());
    let local = ch.local_address().unwrap();
    assert_eq!(local.ip().to_string(), "127.0.0.1");
    assert_ne!(local.port(), 0);
}

#[test]
fn bind_honours_requested_port() {
    // Find a free port, release it, then ask for it explicitly.
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let ch = SelectorProvider::new().open_server_socket_channel().unwrap();
    ch.bind(Some(SocketAddr::from(([127, 0, 0, 1], port))), 8)
        .unwrap();
    assert_eq!(ch.local_address().unwrap().port(), port);
}

#[test]
fn second_bind_fails_already_bound() {
    let ch = bound_channel();
    let first = ch.local_address();
    let err = ch.bind(loopback(), 0).unwrap_err();
    assert!(matches!(err, ChannelError::AlreadyBound));
    assert_eq!(err.kind(), ErrorKind::AlreadyBound);
    assert_eq!(ch.local_address(), first);
}

#[test]
fn bind_after_close_fails_closed() {
    let ch = SelectorProvider::new().open_server_socket_channel().unwrap();
    ch.close().unwrap();
    assert!(matches!(ch.bind(loopback(), 0), Err(ChannelError::Closed)));
}

#[test]
fn wildcard_bind_when_no_address_given() {
    let ch = SelectorProvider::new().open_server_socket_channel().unwrap();
    ch.bind(None, 0).unwrap();
    let local = ch.local_address().unwrap();
    assert!(local.ip().is_unspecified());
    assert_ne!(local.port(), 0);
}

#[test]
fn accept_round_trip_reports_client_address() {
    let ch = bound_channel();
    let addr = ch.local_address().unwrap();
    let acceptor = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || ch.accept())
    };
    settle();
    let mut client = TcpStream::connect(addr).unwrap();
    let accepted = acceptor.join().unwrap().unwrap().unwrap();
    assert_eq!(accepted.remote_address(), client.local_addr().unwrap());
    assert!(accepted.is_blocking());

    client.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    (&accepted).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn accepted_channel_is_blocking_even_from_non_blocking_listener() {
    let ch = bound_channel();
    ch.configure_blocking(false).unwrap();
    let _client = TcpStream::connect(ch.local_address().unwrap()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let accepted = loop {
        if let Some(sc) = ch.accept().unwrap() {
            break sc;
        }
        assert!(Instant::now() < deadline, "pending connection never surfaced");
        thread::sleep(Duration::from_millis(5));
    };
    assert!(accepted.is_blocking());
}

#[test]
fn non_blocking_accept_returns_none_quickly() {
    let ch = bound_channel();
    ch.configure_blocking(false).unwrap();
    let started = Instant::now();
    assert!(ch.accept().unwrap().is_none());
    assert!(ch.accept().unwrap().is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(ch.is_open());
}

#[test]
fn close_unblocks_parked_accept() {
    let ch = bound_channel();
    let acceptor = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || {
            let started = Instant::now();
            (ch.accept(), started)
        })
    };
    settle();
    let closed_at = Instant::now();
    ch.close().unwrap();

    let (result, _) = acceptor.join().unwrap();
    assert!(closed_at.elapsed() < Duration::from_secs(1));
    let err = result.unwrap_err();
    assert!(err.is_closed(), "unexpected error: {err:?}");
    assert!(matches!(
        err,
        ChannelError::AsynchronousClose | ChannelError::Closed
    ));

    assert!(matches!(ch.accept(), Err(ChannelError::Closed)));
    assert_eq!(ch.state(), ChannelState::Killed);
}

#[test]
fn close_under_parked_accept_stops_listening() {
    let ch = bound_channel();
    let addr = ch.local_address().unwrap();
    let acceptor = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || ch.accept())
    };
    settle();
    ch.close().unwrap();
    assert!(!ch.is_open());
    assert!(acceptor.join().unwrap().unwrap_err().is_closed());

    // Options need a live descriptor once close has started.
    assert!(ch.options().get(frankennet_channel::SocketOption::ReuseAddress).is_err());
    assert!(TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_err());
}

#[test]
fn interrupt_closes_channel_and_reports_to_target() {
    let ch = bound_channel();
    let acceptor = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || {
            let result = ch.accept();
            (result, interrupt::interrupted())
        })
    };
    settle();
    interrupt::interrupt(acceptor.thread());

    let (result, flag_was_set) = acceptor.join().unwrap();
    assert!(matches!(result, Err(ChannelError::ClosedByInterrupt)));
    assert!(flag_was_set);
    assert!(!ch.is_open());
    assert_eq!(ch.state(), ChannelState::Killed);
}

#[test]
fn pending_interrupt_closes_channel_on_entry() {
    let ch = bound_channel();
    let result = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || {
            interrupt::interrupt(&thread::current());
            ch.accept()
        })
        .join()
        .unwrap()
    };
    assert!(matches!(result, Err(ChannelError::ClosedByInterrupt)));
    assert!(!ch.is_open());
}

#[test]
fn bind_waits_for_parked_acceptor() {
    let ch = bound_channel();
    let addr = ch.local_address().unwrap();
    let acceptor = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || ch.accept())
    };
    settle();
    let binder = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || ch.bind(loopback(), 0))
    };
    settle();
    assert!(
        !binder.is_finished(),
        "bind must wait for the acceptor to release the I/O lock"
    );
    // Reads under the state lock are not held up.
    assert!(ch.is_bound());
    assert_eq!(ch.to_string(), format!("ServerSocketChannel[{addr}]"));

    let _client = TcpStream::connect(addr).unwrap();
    assert!(acceptor.join().unwrap().unwrap().is_some());
    assert!(matches!(
        binder.join().unwrap(),
        Err(ChannelError::AlreadyBound)
    ));
}

#[test]
fn concurrent_acceptors_take_turns() {
    let ch = bound_channel();
    let addr = ch.local_address().unwrap();
    let acceptors: Vec<_> = (0..2)
        .map(|_| {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.accept())
        })
        .collect();
    settle();
    let clients: Vec<_> = (0..2).map(|_| TcpStream::connect(addr).unwrap()).collect();
    let mut remotes: Vec<_> = acceptors
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().unwrap().remote_address())
        .collect();
    let mut expected: Vec<_> = clients.iter().map(|c| c.local_addr().unwrap()).collect();
    remotes.sort();
    expected.sort();
    assert_eq!(remotes, expected);
}

#[test]
fn zero_backlog_listens_with_default_queue() {
    let ch = bound_channel();
    let addr = ch.local_address().unwrap();
    let clients: Vec<_> = (0..20).map(|_| TcpStream::connect(addr).unwrap()).collect();
    ch.configure_blocking(false).unwrap();
    let mut accepted = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while accepted < clients.len() && Instant::now() < deadline {
        match ch.accept().unwrap() {
            Some(_) => accepted += 1,
            None => thread::sleep(Duration::from_millis(5)),
        }
    }
    assert_eq!(accepted, clients.len());
}

#[test]
fn accept_denial_closes_the_new_connection() {
    let provider = SelectorProvider::new();
    let sink = Arc::new(MemorySink::new());
    provider.set_event_sink(Some(sink.clone()));
    let ch = provider.open_server_socket_channel().unwrap();
    ch.bind(loopback(), 0).unwrap();
    provider.set_security_policy(Some(Arc::new(
        AllowListPolicy::new().allow_host("192.0.2.1".parse().unwrap()),
    )));

    let mut client = TcpStream::connect(ch.local_address().unwrap()).unwrap();
    let err = ch.accept().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityDenial);
    assert!(ch.is_open());

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from a denied connection"),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
    assert!(sink.kinds().contains(&EventKind::AcceptDenied));
}

#[test]
fn listen_denial_happens_before_any_syscall() {
    let provider = SelectorProvider::new();
    provider.set_security_policy(Some(Arc::new(DenyAll)));
    let ch = provider.open_server_socket_channel().unwrap();
    let err = ch.bind(loopback(), 0).unwrap_err();
    assert!(matches!(err, ChannelError::Security(_)));
    assert!(!ch.is_bound());

    // The socket is untouched: lifting the policy lets bind go through.
    provider.set_security_policy(None);
    ch.bind(loopback(), 0).unwrap();
}

#[test]
fn state_only_moves_forward() {
    let ch = SelectorProvider::new().open_server_socket_channel().unwrap();
    let mut seen = vec![ch.state()];
    ch.bind(loopback(), 0).unwrap();
    seen.push(ch.state());
    ch.close().unwrap();
    seen.push(ch.state());
    ch.kill().unwrap();
    ch.kill().unwrap();
    seen.push(ch.state());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.first(), Some(&ChannelState::InUse));
    assert_eq!(seen.last(), Some(&ChannelState::Killed));
}

#[test]
fn lifecycle_events_are_emitted_in_order() {
    let provider = SelectorProvider::new();
    let sink = Arc::new(MemorySink::new());
    provider.set_event_sink(Some(sink.clone()));

    let ch = provider.open_server_socket_channel().unwrap();
    ch.bind(loopback(), 0).unwrap();
    let _client = TcpStream::connect(ch.local_address().unwrap()).unwrap();
    let accepted = ch.accept().unwrap().unwrap();
    ch.close().unwrap();

    let kinds: Vec<_> = sink
        .for_channel(ch.id())
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Open,
            EventKind::Bind,
            EventKind::Accept,
            EventKind::Close,
            EventKind::Kill,
        ]
    );
    let bind = sink
        .for_channel(ch.id())
        .into_iter()
        .find(|e| e.event == EventKind::Bind)
        .unwrap();
    assert_eq!(bind.detail.as_deref(), Some("backlog=50"));

    accepted.close().unwrap();
    assert_eq!(sink.for_channel(accepted.id()).len(), 1);
}

/// Reads channel state back from inside `emit`.
#[derive(Default)]
struct ReadBackSink {
    channel: OnceLock<Weak<ServerSocketChannel>>,
    seen: Mutex<Vec<(EventKind, Option<SocketAddr>)>>,
}

impl EventSink for ReadBackSink {
    fn emit(&self, event: &ChannelEvent) {
        let local = self
            .channel
            .get()
            .and_then(Weak::upgrade)
            .and_then(|ch| ch.local_address());
        self.seen.lock().unwrap().push((event.event, local));
    }
}

#[test]
fn sink_may_read_channel_state_during_close() {
    let provider = SelectorProvider::new();
    let sink = Arc::new(ReadBackSink::default());
    provider.set_event_sink(Some(sink.clone()));
    let ch = provider.open_server_socket_channel().unwrap();
    ch.bind(loopback(), 0).unwrap();
    let addr = ch.local_address();
    sink.channel.set(Arc::downgrade(&ch)).unwrap();
    sink.seen.lock().unwrap().clear();

    let (tx, rx) = mpsc::channel();
    {
        let ch = Arc::clone(&ch);
        thread::spawn(move || tx.send(ch.close()).unwrap());
    }
    let closed = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("close() stalled while the sink read channel state");
    closed.unwrap();
    assert_eq!(ch.state(), ChannelState::Killed);

    let seen = sink.seen.lock().unwrap();
    let kinds: Vec<_> = seen.iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![EventKind::Close, EventKind::Kill]);
    assert!(seen.iter().all(|(_, local)| *local == addr));
}

#[test]
fn sink_may_read_channel_state_during_deferred_kill() {
    let provider = SelectorProvider::new();
    let sink = Arc::new(ReadBackSink::default());
    provider.set_event_sink(Some(sink.clone()));
    let selector = provider.open_selector().unwrap();
    let ch = provider.open_server_socket_channel().unwrap();
    ch.bind(loopback(), 0).unwrap();
    ch.configure_blocking(false).unwrap();
    ch.register(&selector.handle(), frankennet_core::poll::OP_ACCEPT)
        .unwrap();
    sink.channel.set(Arc::downgrade(&ch)).unwrap();
    sink.seen.lock().unwrap().clear();

    let (tx, rx) = mpsc::channel();
    {
        let ch = Arc::clone(&ch);
        let selector = Arc::clone(&selector);
        thread::spawn(move || {
            let closed = ch.close();
            tx.send((closed, selector.select_now())).unwrap();
        });
    }
    let (closed, selected) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("deregistration stalled while the sink read channel state");
    closed.unwrap();
    selected.unwrap();
    assert_eq!(ch.state(), ChannelState::Killed);
    let kinds: Vec<_> = sink.seen.lock().unwrap().iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![EventKind::Close, EventKind::Kill]);
}
