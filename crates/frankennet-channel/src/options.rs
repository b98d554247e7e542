//! TCP socket option adapter.
//!
//! [`TcpOptions`] does not own a descriptor. It is built from two closures,
//! one reading and one writing an integer option, so the same adapter serves
//! any channel that can reach its descriptor.

use std::fmt;
use std::io;

/// Integer socket options reachable through [`TcpOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// `SO_REUSEADDR`
    ReuseAddress,
    /// `SO_RCVBUF`
    ReceiveBufferSize,
    /// `SO_SNDBUF`
    SendBufferSize,
    /// `SO_KEEPALIVE`
    KeepAlive,
    /// `TCP_NODELAY`
    NoDelay,
    /// `IP_TOS`
    TypeOfService,
}

impl SocketOption {
    /// All options, in display order.
    pub const ALL: [Self; 6] = [
        Self::ReuseAddress,
        Self::ReceiveBufferSize,
        Self::SendBufferSize,
        Self::KeepAlive,
        Self::NoDelay,
        Self::TypeOfService,
    ];

    /// `(level, optname)` for `getsockopt`/`setsockopt`.
    #[must_use]
    pub fn level_and_name(self) -> (libc::c_int, libc::c_int) {
        match self {
            Self::ReuseAddress => (libc::SOL_SOCKET, libc::SO_REUSEADDR),
            Self::ReceiveBufferSize => (libc::SOL_SOCKET, libc::SO_RCVBUF),
            Self::SendBufferSize => (libc::SOL_SOCKET, libc::SO_SNDBUF),
            Self::KeepAlive => (libc::SOL_SOCKET, libc::SO_KEEPALIVE),
            Self::NoDelay => (libc::IPPROTO_TCP, libc::TCP_NODELAY),
            Self::TypeOfService => (libc::IPPROTO_IP, libc::IP_TOS),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReuseAddress => "reuseAddress",
            Self::ReceiveBufferSize => "receiveBufferSize",
            Self::SendBufferSize => "sendBufferSize",
            Self::KeepAlive => "keepAlive",
            Self::NoDelay => "noDelay",
            Self::TypeOfService => "typeOfService",
        }
    }

    /// Boolean options are reported as `true`/`false` rather than integers.
    #[must_use]
    pub const fn is_flag(self) -> bool {
        matches!(self, Self::ReuseAddress | Self::KeepAlive | Self::NoDelay)
    }
}

type GetInt = Box<dyn Fn(SocketOption) -> io::Result<i32> + Send + Sync>;
type SetInt = Box<dyn Fn(SocketOption, i32) -> io::Result<()> + Send + Sync>;

/// Typed view over integer TCP/IP socket options.
pub struct TcpOptions {
    get_int: GetInt,
    set_int: SetInt,
}

impl TcpOptions {
    /// Build an adapter from a getter and a setter.
    pub fn new<G, S>(get_int: G, set_int: S) -> Self
    where
        G: Fn(SocketOption) -> io::Result<i32> + Send + Sync + 'static,
        S: Fn(SocketOption, i32) -> io::Result<()> + Send + Sync + 'static,
    {
        Self {
            get_int: Box::new(get_int),
            set_int: Box::new(set_int),
        }
    }

    pub fn get(&self, opt: SocketOption) -> io::Result<i32> {
        (self.get_int)(opt)
    }

    pub fn set(&self, opt: SocketOption, value: i32) -> io::Result<()> {
        (self.set_int)(opt, value)
    }

    fn get_flag(&self, opt: SocketOption) -> io::Result<bool> {
        Ok(self.get(opt)? != 0)
    }

    fn set_flag(&self, opt: SocketOption, on: bool) -> io::Result<()> {
        self.set(opt, i32::from(on))
    }

    fn set_size(&self, opt: SocketOption, size: i32) -> io::Result<()> {
        if size <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} must be positive, got {size}", opt.name()),
            ));
        }
        self.set(opt, size)
    }

    pub fn reuse_address(&self) -> io::Result<bool> {
        self.get_flag(SocketOption::ReuseAddress)
    }

    pub fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.set_flag(SocketOption::ReuseAddress, on)
    }

    pub fn receive_buffer_size(&self) -> io::Result<i32> {
        self.get(SocketOption::ReceiveBufferSize)
    }

    pub fn set_receive_buffer_size(&self, size: i32) -> io::Result<()> {
        self.set_size(SocketOption::ReceiveBufferSize, size)
    }

    pub fn send_buffer_size(&self) -> io::Result<i32> {
        self.get(SocketOption::SendBufferSize)
    }

    pub fn set_send_buffer_size(&self, size: i32) -> io::Result<()> {
        self.set_size(SocketOption::SendBufferSize, size)
    }

    pub fn keep_alive(&self) -> io::Result<bool> {
        self.get_flag(SocketOption::KeepAlive)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_flag(SocketOption::KeepAlive, on)
    }

    pub fn no_delay(&self) -> io::Result<bool> {
        self.get_flag(SocketOption::NoDelay)
    }

    pub fn set_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_flag(SocketOption::NoDelay, on)
    }

    /// The IP type-of-service byte.
    pub fn type_of_service(&self) -> io::Result<i32> {
        self.get(SocketOption::TypeOfService)
    }

    pub fn set_type_of_service(&self, tos: i32) -> io::Result<()> {
        if !(0..=255).contains(&tos) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("typeOfService out of range: {tos}"),
            ));
        }
        self.set(SocketOption::TypeOfService, tos)
    }
}

impl fmt::Debug for TcpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpOptions").finish_non_exhaustive()
    }
}

/// Lists every option that can currently be read, e.g.
/// `TcpOptions[reuseAddress=true receiveBufferSize=131072 ...]`.
impl fmt::Display for TcpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TcpOptions[")?;
        let mut first = true;
        for opt in SocketOption::ALL {
            let Ok(value) = self.get(opt) else { continue };
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if opt.is_flag() {
                write!(f, "{}={}", opt.name(), value != 0)?;
            } else {
                write!(f, "{}={value}", opt.name())?;
            }
        }
        f.write_str("]")
    }
}
