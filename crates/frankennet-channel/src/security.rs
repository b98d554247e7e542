//! Security hooks consulted before listening and after accepting.
//!
//! A [`SecurityPolicy`] is installed on a
//! [`SelectorProvider`](crate::provider::SelectorProvider). With no policy
//! installed every request is allowed.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// Which hook refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityAction {
    Listen,
    Accept,
}

impl fmt::Display for SecurityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listen => "listen",
            Self::Accept => "accept",
        })
    }
}

/// A refusal from a [`SecurityPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("security policy denied {action} for {target}")]
pub struct SecurityDenial {
    pub action: SecurityAction,
    /// `host:port` or `port`, depending on the hook.
    pub target: String,
}

impl SecurityDenial {
    #[must_use]
    pub fn listen(port: u16) -> Self {
        Self {
            action: SecurityAction::Listen,
            target: port.to_string(),
        }
    }

    #[must_use]
    pub fn accept(host: &str, port: u16) -> Self {
        Self {
            action: SecurityAction::Accept,
            target: format!("{host}:{port}"),
        }
    }
}

/// Injectable permission checks. Both default to allow.
pub trait SecurityPolicy: Send + Sync {
    /// Called by `bind` before any syscall.
    fn check_listen(&self, port: u16) -> Result<(), SecurityDenial> {
        let _ = port;
        Ok(())
    }

    /// Called by `accept` once the connection exists. A refusal closes it.
    fn check_accept(&self, host: &str, port: u16) -> Result<(), SecurityDenial> {
        let _ = (host, port);
        Ok(())
    }
}

/// Policy that only admits peers from a fixed set of hosts and listens on a
/// fixed set of ports. Empty sets admit everything.
#[derive(Debug, Clone, Default)]
pub struct AllowListPolicy {
    hosts: Vec<IpAddr>,
    ports: Vec<u16>,
}

impl AllowListPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow_host(mut self, host: IpAddr) -> Self {
        self.hosts.push(host);
        self
    }

    #[must_use]
    pub fn allow_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }
}

impl SecurityPolicy for AllowListPolicy {
    fn check_listen(&self, port: u16) -> Result<(), SecurityDenial> {
        if self.ports.is_empty() || self.ports.contains(&port) {
            Ok(())
        } else {
            Err(SecurityDenial::listen(port))
        }
    }

    fn check_accept(&self, host: &str, port: u16) -> Result<(), SecurityDenial> {
        if self.hosts.is_empty() {
            return Ok(());
        }
        match host.parse::<IpAddr>() {
            Ok(ip) if self.hosts.contains(&ip) => Ok(()),
            _ => Err(SecurityDenial::accept(host, port)),
        }
    }
}

/// Policy that refuses everything; useful for exercising denial paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl SecurityPolicy for DenyAll {
    fn check_listen(&self, port: u16) -> Result<(), SecurityDenial> {
        Err(SecurityDenial::listen(port))
    }

    fn check_accept(&self, host: &str, port: u16) -> Result<(), SecurityDenial> {
        Err(SecurityDenial::accept(host, port))
    }
}
