// Tunnel configuration snapshot for Tun Proxy

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::types::FilterMode;

pub const DEFAULT_LOCAL_IPV4: Ipv4Addr = Ipv4Addr::new(10, 1, 10, 1);
pub const DEFAULT_LOCAL_IPV6: Ipv6Addr = Ipv6Addr::new(0xfd00, 1, 0xfd00, 1, 0xfd00, 1, 0xfd00, 1);
pub const FALLBACK_DNS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
];

/// Session label handed to the host when the interface is established
pub const SESSION_NAME: &str = "Tun Proxy";

/// Address with prefix length, e.g. `10.1.10.1/32` or `::/0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    pub address: IpAddr,
    pub prefix: u8,
}

impl IpPrefix {
    pub fn new(address: IpAddr, prefix: u8) -> Result<Self> {
        let max = if address.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(Error::Config(format!(
                "prefix /{} out of range for {}",
                prefix, address
            )));
        }
        Ok(Self { address, prefix })
    }

    /// Single-host prefix (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        let prefix = if address.is_ipv4() { 32 } else { 128 };
        Self { address, prefix }
    }

    pub fn is_default_route(&self) -> bool {
        self.prefix == 0
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let address: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid address '{}'", addr)))?;
        match prefix {
            Some(p) => {
                let prefix = p
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| Error::Config(format!("invalid prefix '{}'", p)))?;
                IpPrefix::new(address, prefix)
            }
            None => Ok(IpPrefix::host(address)),
        }
    }
}

/// Full-default routes for both address families
pub fn default_routes() -> Vec<IpPrefix> {
    vec![
        IpPrefix {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        },
        IpPrefix {
            address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix: 0,
        },
    ]
}

/// Proxy credentials, wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Upstream proxy the forwarding engine relays to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// Username and password as the engine expects them (empty when unset)
    pub fn user_pass(&self) -> (&str, &str) {
        match &self.credentials {
            Some(c) => (c.username.as_str(), c.password.as_str()),
            None => ("", ""),
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::format_host_port(&self.host, self.port))
    }
}

/// Forwarding engine log priority (Android-style: 2 verbose .. 7 assert)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevel(pub i32);

impl LogLevel {
    pub const VERBOSE: LogLevel = LogLevel(2);
    pub const DEBUG: LogLevel = LogLevel(3);
    pub const INFO: LogLevel = LogLevel(4);
    pub const WARN: LogLevel = LogLevel(5);
    pub const ERROR: LogLevel = LogLevel(6);

    /// Level name understood by tun2socks-style forwarders
    pub fn engine_name(&self) -> &'static str {
        match self.0 {
            i32::MIN..=3 => "debug",
            4 => "info",
            5 => "warning",
            6 => "error",
            _ => "silent",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::WARN
    }
}

/// Per-application allow/deny list, already resolved against installed applications
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppFilter {
    pub mode: FilterMode,
    pub apps: BTreeSet<String>,
}

/// Immutable snapshot applied on every (re)start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub session: String,
    pub mtu: u32,
    pub ipv4: IpPrefix,
    pub ipv6: IpPrefix,
    pub routes: Vec<IpPrefix>,
    /// Preferred resolver first
    pub dns: Vec<IpAddr>,
    /// `None` leaves the tunnel idle (no forwarding worker)
    pub proxy: Option<ProxyEndpoint>,
    pub log_level: LogLevel,
    pub filter: AppFilter,
}
