//! Address and listen-queue policy.
//!
//! Validation only; the actual `bind`/`listen` syscalls live in the channel
//! crate.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Listen backlog used when the caller asks for less than one slot.
pub const DEFAULT_BACKLOG: i32 = 50;

/// Effective listen backlog for a requested value.
#[inline]
#[must_use]
pub const fn effective_backlog(backlog: i32) -> i32 {
    if backlog < 1 { DEFAULT_BACKLOG } else { backlog }
}

/// Outcome of checking a bind address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressCheck {
    /// The address can be bound by an IPv4 listener.
    Accepted(SocketAddr),
    /// Address family the listener does not speak.
    UnsupportedFamily,
}

/// The address bound when the caller does not name one: any interface,
/// ephemeral port.
#[must_use]
pub const fn wildcard() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Validate a bind address for an IPv4 listening socket.
///
/// `None` means "any interface, ephemeral port". IPv4-mapped IPv6 addresses
/// are unwrapped; any other IPv6 address is rejected.
#[must_use]
pub fn check_address(local: Option<SocketAddr>) -> AddressCheck {
    match local {
        None => AddressCheck::Accepted(wildcard()),
        Some(SocketAddr::V4(v4)) => AddressCheck::Accepted(SocketAddr::V4(v4)),
        Some(SocketAddr::V6(v6)) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => AddressCheck::Accepted(SocketAddr::V4(SocketAddrV4::new(ip, v6.port()))),
            None => AddressCheck::UnsupportedFamily,
        },
    }
}

/// Returns true if `port` was assigned by the kernel rather than requested.
#[inline]
#[must_use]
pub const fn is_ephemeral_request(port: u16) -> bool {
    port == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn backlog_defaults_below_one() {
        assert_eq!(effective_backlog(0), DEFAULT_BACKLOG);
        assert_eq!(effective_backlog(-5), DEFAULT_BACKLOG);
        assert_eq!(effective_backlog(i32::MIN), DEFAULT_BACKLOG);
        assert_eq!(effective_backlog(1), 1);
        assert_eq!(effective_backlog(128), 128);
    }

    #[test]
    fn none_binds_wildcard() {
        assert_eq!(check_address(None), AddressCheck::Accepted(wildcard()));
        assert_eq!(wildcard().port(), 0);
    }

    #[test]
    fn ipv4_passes_through() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(check_address(Some(addr)), AddressCheck::Accepted(addr));
    }

    #[test]
    fn mapped_ipv6_is_unwrapped() {
        let mapped = SocketAddr::new(Ipv4Addr::LOCALHOST.to_ipv6_mapped().into(), 9000);
        let expected: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(check_address(Some(mapped)), AddressCheck::Accepted(expected));
    }

    #[test]
    fn native_ipv6_is_rejected() {
        let addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 80);
        assert_eq!(check_address(Some(addr)), AddressCheck::UnsupportedFamily);
    }

    #[test]
    fn zero_port_is_ephemeral() {
        assert!(is_ephemeral_request(0));
        assert!(!is_ephemeral_request(443));
    }
}
