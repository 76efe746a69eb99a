// Tun Proxy - Linux TUN establishment
// Creates the tun device, assigns addresses, routes and resolvers

use std::fs::{self, File, OpenOptions};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};
use tun_proxy_common::{Error, IpPrefix, ProxyEndpoint, Result, TunnelConfig};

use super::{InterfaceEstablisher, NetworkProbe, PermissionGate, PermissionState, TunInterface};

const TUN_DEVICE: &str = "/dev/net/tun";
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
// _IOW('T', 202, int)
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const CAP_NET_ADMIN: u32 = 12;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Granted when running as root or holding CAP_NET_ADMIN
pub struct LinuxPermissionGate {
    status_path: PathBuf,
}

impl LinuxPermissionGate {
    pub fn new() -> Self {
        Self {
            status_path: PathBuf::from("/proc/self/status"),
        }
    }

    fn has_net_admin(&self) -> bool {
        let Ok(status) = fs::read_to_string(&self.status_path) else {
            return false;
        };
        status
            .lines()
            .find_map(|line| line.strip_prefix("CapEff:"))
            .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
            .map(|caps| caps & (1 << CAP_NET_ADMIN) != 0)
            .unwrap_or(false)
    }
}

impl Default for LinuxPermissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionGate for LinuxPermissionGate {
    fn check(&self) -> PermissionState {
        // SAFETY: geteuid has no preconditions
        let root = unsafe { libc::geteuid() } == 0;
        if root || self.has_net_admin() {
            PermissionState::Granted
        } else {
            PermissionState::NeedsUserGrant
        }
    }
}

/// An open tun device plus the host route added to reach the proxy
#[derive(Debug)]
pub struct LinuxTun {
    file: File,
    name: String,
    bypass_route: Option<Vec<String>>,
}

impl LinuxTun {
    fn open(name_template: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    Error::PermissionDenied(format!("cannot open {}: {}", TUN_DEVICE, e))
                }
                _ => Error::Establish(format!("cannot open {}: {}", TUN_DEVICE, e)),
            })?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req
            .name
            .iter_mut()
            .zip(name_template.as_bytes().iter().take(libc::IFNAMSIZ - 1))
        {
            *dst = *src as libc::c_char;
        }

        // SAFETY: req is a properly sized ifreq for TUNSETIFF
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EPERM) {
                Error::PermissionDenied(format!("TUNSETIFF: {}", err))
            } else {
                Error::Establish(format!("TUNSETIFF: {}", err))
            });
        }

        let name: String = req
            .name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8 as char)
            .collect();
        info!("Created tun device {}", name);

        Ok(Self {
            file,
            name,
            bypass_route: None,
        })
    }

    fn remove_bypass(&mut self) -> Result<()> {
        if let Some(route) = self.bypass_route.take() {
            let mut args: Vec<&str> = vec!["route", "del"];
            args.extend(route.iter().map(String::as_str));
            ip(&args)?;
        }
        Ok(())
    }
}

impl TunInterface for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let result = self.remove_bypass();
        info!("Closed tun device {}", self.name);
        result
    }
}

impl Drop for LinuxTun {
    fn drop(&mut self) {
        if let Err(e) = self.remove_bypass() {
            warn!("Failed to remove proxy route for {}: {}", self.name, e);
        }
    }
}

/// Establishes the tunnel on a Linux tun device
pub struct LinuxTunEstablisher {
    name_template: String,
    permission: Arc<dyn PermissionGate>,
    probe: Arc<dyn NetworkProbe>,
}

impl LinuxTunEstablisher {
    pub fn new(
        name_template: impl Into<String>,
        permission: Arc<dyn PermissionGate>,
        probe: Arc<dyn NetworkProbe>,
    ) -> Self {
        Self {
            name_template: name_template.into(),
            permission,
            probe,
        }
    }

    fn configure(&self, tun: &mut LinuxTun, config: &TunnelConfig) -> Result<()> {
        let name = tun.name.clone();
        let mtu = config.mtu.to_string();
        ip(&["link", "set", "dev", &name, "mtu", &mtu, "up"])?;

        ip(&["addr", "add", &config.ipv4.to_string(), "dev", &name])?;
        if let Err(e) = ip(&["-6", "addr", "add", &config.ipv6.to_string(), "dev", &name]) {
            warn!("IPv6 address not assigned to {}: {}", name, e);
        }

        // The proxy must stay reachable outside the tunnel
        if let Some(proxy) = &config.proxy {
            tun.bypass_route = self.add_bypass_route(proxy, &name)?;
        }

        for route in &config.routes {
            for prefix in split_default(route) {
                let family = if prefix.address.is_ipv4() { "-4" } else { "-6" };
                let target = prefix.to_string();
                let result = ip(&[family, "route", "replace", &target, "dev", &name]);
                match (result, prefix.address.is_ipv4()) {
                    (Ok(()), _) => debug!("Route {} via {}", target, name),
                    (Err(e), true) => return Err(e),
                    (Err(e), false) => warn!("IPv6 route {} not installed: {}", target, e),
                }
            }
        }

        set_resolvers(&name, &config.dns);

        if !config.filter.apps.is_empty() {
            info!(
                "Application filter ({}) not enforced on this platform: {:?}",
                config.filter.mode, config.filter.apps
            );
        }
        Ok(())
    }

    fn add_bypass_route(&self, proxy: &ProxyEndpoint, tun_name: &str) -> Result<Option<Vec<String>>> {
        let Some(address) = resolve_ipv4(&proxy.host, proxy.port) else {
            warn!("Proxy host {} has no IPv4 address, no bypass route added", proxy.host);
            return Ok(None);
        };
        if address.is_loopback() {
            return Ok(None);
        }
        let Some((gateway, device)) = self.probe.default_gateway(Some(tun_name)) else {
            warn!("No default gateway, proxy {} may be unreachable", proxy.host);
            return Ok(None);
        };

        let route = vec![
            format!("{}/32", address),
            "via".to_string(),
            gateway.to_string(),
            "dev".to_string(),
            device.0,
        ];
        let mut args: Vec<&str> = vec!["route", "replace"];
        args.extend(route.iter().map(String::as_str));
        ip(&args)?;
        info!("Proxy {} routed via {}", address, gateway);
        Ok(Some(route))
    }
}

impl InterfaceEstablisher for LinuxTunEstablisher {
    fn establish(&self, config: &TunnelConfig) -> Result<Box<dyn TunInterface>> {
        if self.permission.check() != PermissionState::Granted {
            return Err(Error::PermissionDenied(
                "CAP_NET_ADMIN is required to create the tunnel".to_string(),
            ));
        }

        let mut tun = LinuxTun::open(&self.name_template)?;
        // On failure the device is dropped, which removes it with its routes
        self.configure(&mut tun, config)?;
        info!(
            "Session '{}' established on {} (mtu {})",
            config.session, tun.name, config.mtu
        );
        Ok(Box::new(tun))
    }
}

/// A default route is installed as two halves so it wins over the host default
fn split_default(route: &IpPrefix) -> Vec<IpPrefix> {
    if !route.is_default_route() {
        return vec![*route];
    }
    let halves: [&str; 2] = if route.address.is_ipv4() {
        ["0.0.0.0/1", "128.0.0.0/1"]
    } else {
        ["::/1", "8000::/1"]
    };
    halves.iter().filter_map(|s| s.parse().ok()).collect()
}

fn resolve_ipv4(host: &str, port: u16) -> Option<IpAddr> {
    if let Ok(address) = host.parse::<IpAddr>() {
        return address.is_ipv4().then_some(address);
    }
    (host, port)
        .to_socket_addrs()
        .ok()?
        .find(SocketAddr::is_ipv4)
        .map(|addr| addr.ip())
}

fn set_resolvers(device: &str, dns: &[IpAddr]) {
    if dns.is_empty() {
        return;
    }
    let servers: Vec<String> = dns.iter().map(IpAddr::to_string).collect();
    let mut args = vec!["dns", device];
    args.extend(servers.iter().map(String::as_str));

    let applied = run_tool("resolvectl", &args)
        .and_then(|_| run_tool("resolvectl", &["domain", device, "~."]));
    match applied {
        Ok(()) => info!("Resolvers for {}: {}", device, servers.join(", ")),
        Err(e) => warn!("Resolvers not applied to {}: {}", device, e),
    }
}

fn ip(args: &[&str]) -> Result<()> {
    run_tool("ip", args).map_err(|e| Error::Establish(e.to_string()))
}

fn run_tool(program: &str, args: &[&str]) -> Result<()> {
    debug!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Establish(format!("failed to run {}: {}", program, e)))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Establish(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_split_ipv4_default() {
        let routes = split_default(&"0.0.0.0/0".parse().unwrap());
        let rendered: Vec<String> = routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(rendered, vec!["0.0.0.0/1", "128.0.0.0/1"]);
    }

    #[test]
    fn test_split_ipv6_default() {
        let routes = split_default(&"::/0".parse().unwrap());
        let rendered: Vec<String> = routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(rendered, vec!["::/1", "8000::/1"]);
    }

    #[test]
    fn test_specific_route_kept() {
        let route: IpPrefix = "10.0.0.0/8".parse().unwrap();
        assert_eq!(split_default(&route), vec![route]);
    }

    #[test]
    fn test_resolve_literal_addresses() {
        assert_eq!(
            resolve_ipv4("192.0.2.1", 1080),
            Some("192.0.2.1".parse().unwrap())
        );
        assert_eq!(resolve_ipv4("2001:db8::1", 1080), None);
    }

    #[test]
    fn test_capability_parsing() {
        let mut status = NamedTempFile::new().unwrap();
        writeln!(status, "Name:\tdaemon").unwrap();
        writeln!(status, "CapEff:\t0000000000001000").unwrap();
        let gate = LinuxPermissionGate {
            status_path: status.path().to_path_buf(),
        };
        assert!(gate.has_net_admin());

        let mut status = NamedTempFile::new().unwrap();
        writeln!(status, "CapEff:\t0000000000000000").unwrap();
        let gate = LinuxPermissionGate {
            status_path: status.path().to_path_buf(),
        };
        assert!(!gate.has_net_admin());
    }
}
