// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Network utility functions

use std::net::{IpAddr, Ipv6Addr};

use crate::error::{Error, Result};

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Fail-safe: if we can't parse it, assume non-loopback
    false
}

/// Join host and port, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Validate `a.b.c.d` or `a.b.c.d:port`
///
/// Octets must be decimal 0..=255, the port (when present) 1..=65535.
pub fn is_valid_ipv4_endpoint(address: &str) -> bool {
    if address.is_empty() {
        return false;
    }

    let mut parts = address.split(':');
    let ip = parts.next().unwrap_or_default();
    if let Some(port) = parts.next() {
        match port.parse::<u32>() {
            Ok(p) if p > 0 && p < 65536 => {}
            _ => return false,
        }
    }
    if parts.next().is_some() {
        return false;
    }

    let octets: Vec<&str> = ip.split('.').collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| !o.is_empty() && o.parse::<u32>().map(|v| v <= 255).unwrap_or(false))
}

/// Split `host:port` into its parts; the port must be non-zero
pub fn parse_host_port(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidEndpoint(format!("'{}' is missing a port", endpoint)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::InvalidEndpoint(format!("'{}' is missing a host", endpoint)));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::InvalidEndpoint(format!("invalid port in '{}'", endpoint)))?;
    Ok((host.to_string(), port))
}
