// Tun Proxy - Host network probes
// Default routes from /proc/net/route, resolvers from resolv.conf

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use tracing::debug;

use super::{DnsProvider, NetworkProbe};
use crate::network_watcher::{NetworkId, NetworkSnapshot};

const RTF_UP: u32 = 0x0001;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteEntry {
    iface: String,
    destination: Ipv4Addr,
    gateway: Ipv4Addr,
    flags: u32,
    metric: u32,
    mask: Ipv4Addr,
}

impl RouteEntry {
    fn is_default(&self) -> bool {
        self.flags & RTF_UP != 0
            && self.destination.is_unspecified()
            && self.mask.is_unspecified()
    }
}

/// Kernel prints addresses as the native-endian value of network-order bytes
fn parse_hex_addr(field: &str) -> Option<Ipv4Addr> {
    u32::from_str_radix(field, 16)
        .ok()
        .map(|v| Ipv4Addr::from(v.to_ne_bytes()))
}

fn parse_route_table(contents: &str) -> Vec<RouteEntry> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            Some(RouteEntry {
                iface: fields[0].to_string(),
                destination: parse_hex_addr(fields[1])?,
                gateway: parse_hex_addr(fields[2])?,
                flags: u32::from_str_radix(fields[3], 16).ok()?,
                metric: fields[6].parse().ok()?,
                mask: parse_hex_addr(fields[7])?,
            })
        })
        .collect()
}

/// Network view built from the IPv4 routing table
pub struct ProcNetworkProbe {
    route_table: PathBuf,
    sys_class_net: PathBuf,
}

impl ProcNetworkProbe {
    pub fn new() -> Self {
        Self {
            route_table: PathBuf::from("/proc/net/route"),
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }

    fn default_routes(&self, exclude: Option<&str>) -> Vec<RouteEntry> {
        let contents = match fs::read_to_string(&self.route_table) {
            Ok(c) => c,
            Err(e) => {
                debug!("Cannot read {}: {}", self.route_table.display(), e);
                return Vec::new();
            }
        };
        let mut routes: Vec<RouteEntry> = parse_route_table(&contents)
            .into_iter()
            .filter(|r| r.is_default() && Some(r.iface.as_str()) != exclude)
            .collect();
        routes.sort_by_key(|r| r.metric);
        routes
    }
}

impl Default for ProcNetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProbe for ProcNetworkProbe {
    fn snapshot(&self, exclude: Option<&str>) -> NetworkSnapshot {
        let routes = self.default_routes(exclude);
        NetworkSnapshot {
            default: routes.first().map(|r| NetworkId(r.iface.clone())),
            available: routes.into_iter().map(|r| NetworkId(r.iface)).collect(),
        }
    }

    fn default_gateway(&self, exclude: Option<&str>) -> Option<(Ipv4Addr, NetworkId)> {
        self.default_routes(exclude)
            .into_iter()
            .find(|r| !r.gateway.is_unspecified())
            .map(|r| (r.gateway, NetworkId(r.iface)))
    }

    fn interface_exists(&self, name: &str) -> bool {
        self.sys_class_net.join(name).exists()
    }
}

/// Resolvers listed in resolv.conf, skipping local stub resolvers
pub struct ResolvConfDns {
    path: PathBuf,
}

impl ResolvConfDns {
    pub fn new() -> Self {
        Self::with_path("/etc/resolv.conf")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ResolvConfDns {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsProvider for ResolvConfDns {
    fn system_dns(&self) -> Vec<IpAddr> {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match parts.next() {
                    Some("nameserver") => parts.next()?.parse::<IpAddr>().ok(),
                    _ => None,
                }
            })
            .filter(|addr| !addr.is_loopback())
            .collect()
    }
}
