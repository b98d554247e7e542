//! Stateless socket helpers over `libc`.
//!
//! Thin wrappers that translate `-1`/`errno` into `io::Error` and socket
//! addresses between `std::net` and `sockaddr_*`. Policy (address checks,
//! backlog defaults) lives in `frankennet_core::net`.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::options::SocketOption;

#[inline]
fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

// ---------------------------------------------------------------------------
// sockaddr conversion
// ---------------------------------------------------------------------------

/// Encode `addr` into a `sockaddr_storage` plus the length to pass the kernel.
pub(crate) fn encode_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: all-zero is a valid sockaddr_in.
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            // SAFETY: sockaddr_storage is large enough and suitably aligned
            // for any sockaddr_* type.
            unsafe {
                std::ptr::write(
                    (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>(),
                    sin,
                );
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: all-zero is a valid sockaddr_in6.
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            // SAFETY: as above.
            unsafe {
                std::ptr::write(
                    (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>(),
                    sin6,
                );
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Decode a kernel-filled `sockaddr_storage`.
pub(crate) fn decode_sockaddr(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: family and length say this is a sockaddr_in.
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
            };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: family and length say this is a sockaddr_in6.
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>()
            };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported address family",
        )),
    }
}

// ---------------------------------------------------------------------------
// socket / bind / listen / accept
// ---------------------------------------------------------------------------

/// Create an IPv4 listening-capable socket with `SO_REUSEADDR` set.
///
/// Only stream sockets are supported.
pub fn server_socket(stream: bool) -> io::Result<OwnedFd> {
    if !stream {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "datagram sockets are not supported",
        ));
    }
    let fd = new_socket(libc::AF_INET, libc::SOCK_STREAM)?;
    set_int_option(fd.as_raw_fd(), SocketOption::ReuseAddress, 1)?;
    Ok(fd)
}

#[cfg(target_os = "linux")]
fn new_socket(domain: libc::c_int, ty: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall with integer arguments.
    let raw = cvt(unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, 0) })?;
    // SAFETY: socket() returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

#[cfg(not(target_os = "linux"))]
fn new_socket(domain: libc::c_int, ty: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall with integer arguments.
    let raw = cvt(unsafe { libc::socket(domain, ty, 0) })?;
    // SAFETY: socket() returned a fresh descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: raw is open.
    cvt(unsafe { libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    Ok(fd)
}

/// Bind `fd` to `addr`.
pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = encode_sockaddr(addr);
    // SAFETY: storage holds a valid sockaddr of length len.
    cvt(unsafe {
        libc::bind(
            fd,
            (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(),
            len,
        )
    })?;
    Ok(())
}

/// Put `fd` into listening state with the given queue depth.
pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    // SAFETY: plain syscall with integer arguments.
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Accept one pending connection. The new descriptor is close-on-exec.
///
/// Errors are returned raw: `EINTR` and `EAGAIN` are for the caller to map.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let raw = accept_raw(fd, storage.as_mut_ptr().cast::<libc::sockaddr>(), &mut len)?;
    // SAFETY: accept() returned a fresh descriptor we now own.
    let newfd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: zero-initialized, and the kernel wrote at most `len` bytes.
    let storage = unsafe { storage.assume_init() };
    let remote = decode_sockaddr(&storage, len)?;
    Ok((newfd, remote))
}

#[cfg(target_os = "linux")]
fn accept_raw(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    len: &mut libc::socklen_t,
) -> io::Result<RawFd> {
    // SAFETY: addr points to a sockaddr_storage of *len bytes.
    cvt(unsafe { libc::accept4(fd, addr, len, libc::SOCK_CLOEXEC) })
}

#[cfg(not(target_os = "linux"))]
fn accept_raw(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    len: &mut libc::socklen_t,
) -> io::Result<RawFd> {
    // SAFETY: addr points to a sockaddr_storage of *len bytes.
    let raw = cvt(unsafe { libc::accept(fd, addr, len) })?;
    // SAFETY: raw is open.
    unsafe { libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC) };
    Ok(raw)
}

/// Address `fd` is bound to.
pub fn local_address(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage has room for len bytes.
    cvt(unsafe { libc::getsockname(fd, storage.as_mut_ptr().cast(), &mut len) })?;
    // SAFETY: zero-initialized and filled by the kernel.
    let storage = unsafe { storage.assume_init() };
    decode_sockaddr(&storage, len)
}

/// Address of the peer `fd` is connected to.
pub fn remote_address(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage has room for len bytes.
    cvt(unsafe { libc::getpeername(fd, storage.as_mut_ptr().cast(), &mut len) })?;
    // SAFETY: zero-initialized and filled by the kernel.
    let storage = unsafe { storage.assume_init() };
    decode_sockaddr(&storage, len)
}

/// Shut down one or both directions (`libc::SHUT_*`).
pub fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    // SAFETY: plain syscall with integer arguments.
    cvt(unsafe { libc::shutdown(fd, how) })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Blocking mode
// ---------------------------------------------------------------------------

/// Set or clear `O_NONBLOCK` on `fd`.
pub fn configure_blocking(fd: RawFd, block: bool) -> io::Result<()> {
    // SAFETY: F_GETFL takes no pointer argument.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let wanted = if block {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    if wanted != flags {
        // SAFETY: F_SETFL takes an integer argument.
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) })?;
    }
    Ok(())
}

/// Returns true if `O_NONBLOCK` is clear on `fd`.
pub fn is_blocking(fd: RawFd) -> io::Result<bool> {
    // SAFETY: F_GETFL takes no pointer argument.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    Ok(flags & libc::O_NONBLOCK == 0)
}

// ---------------------------------------------------------------------------
// poll
// ---------------------------------------------------------------------------

/// Poll one descriptor. Returns the reported `revents` (`0` on timeout).
///
/// `timeout_ms < 0` waits indefinitely.
pub fn poll(fd: RawFd, events: i32, timeout_ms: i32) -> io::Result<i32> {
    let mut pfd = libc::pollfd {
        fd,
        events: events as libc::c_short,
        revents: 0,
    };
    // SAFETY: pfd is a single valid pollfd.
    let n = cvt(unsafe { libc::poll(&mut pfd, 1, timeout_ms) })?;
    Ok(if n == 0 { 0 } else { i32::from(pfd.revents) })
}

/// Poll a set of descriptors in place. Returns the number with events.
pub fn poll_many(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    // SAFETY: fds is a valid slice of pollfd.
    let n = cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) })?;
    Ok(n as usize)
}

/// Non-blocking, close-on-exec pipe used to wake a thread out of `poll`.
/// Returns `(read_end, write_end)`.
pub fn wakeup_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for two descriptors.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe() just returned these descriptors to us.
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&rd, &wr] {
        configure_blocking(fd.as_raw_fd(), false)?;
        // SAFETY: fd is open.
        cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
    }
    Ok((rd, wr))
}

/// Write one byte to a wakeup pipe. A full pipe already has a wakeup pending.
pub fn signal_wakeup(fd: RawFd) -> io::Result<()> {
    loop {
        // SAFETY: one valid byte at a static address.
        let n = unsafe { libc::write(fd, [1u8].as_ptr().cast(), 1) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return Ok(()),
            _ => return Err(err),
        }
    }
}

/// Read a non-blocking descriptor until it would block. Returns bytes drained.
pub fn drain(fd: RawFd) -> io::Result<usize> {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        // SAFETY: buf is a valid writable region of buf.len() bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            total += n as usize;
            continue;
        }
        if n == 0 {
            return Ok(total);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return Ok(total),
            _ => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Read an integer socket option.
pub fn get_int_option(fd: RawFd, opt: SocketOption) -> io::Result<i32> {
    let (level, name) = opt.level_and_name();
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value/len describe a valid c_int buffer.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    })?;
    Ok(value)
}

/// Write an integer socket option.
pub fn set_int_option(fd: RawFd, opt: SocketOption, value: i32) -> io::Result<()> {
    let (level, name) = opt.level_and_name();
    let value: libc::c_int = value;
    // SAFETY: value is a valid c_int for the duration of the call.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
