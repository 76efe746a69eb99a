// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - Platform Module
// Host operating system collaborators consumed by the controller

mod apps;
mod net;
mod tun;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;

use tun_proxy_common::{Result, TunnelConfig};

use crate::network_watcher::{NetworkId, NetworkSnapshot};

pub use apps::DesktopAppResolver;
pub use net::{ProcNetworkProbe, ResolvConfDns};
pub use tun::{LinuxPermissionGate, LinuxTunEstablisher};

/// Answer of the host permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    /// A user-interactive grant is required before an interface can be created
    NeedsUserGrant,
}

pub trait PermissionGate: Send + Sync {
    fn check(&self) -> PermissionState;
}

/// Established virtual interface
///
/// Closing it (or dropping it) releases the descriptor and removes the interface.
pub trait TunInterface: Send + fmt::Debug {
    fn name(&self) -> &str;
    fn raw_fd(&self) -> RawFd;
    fn close(self: Box<Self>) -> Result<()>;
}

/// Creates the virtual interface from a config snapshot
pub trait InterfaceEstablisher: Send + Sync {
    fn establish(&self, config: &TunnelConfig) -> Result<Box<dyn TunInterface>>;
}

/// Resolves application identifiers against what is installed right now
pub trait AppResolver: Send + Sync {
    fn is_installed(&self, app_id: &str) -> bool;
}

/// Resolvers of the currently active network, preferred first
pub trait DnsProvider: Send + Sync {
    fn system_dns(&self) -> Vec<IpAddr>;
}

/// Read-only view of the host's networks offering general connectivity
pub trait NetworkProbe: Send + Sync {
    /// Networks with a default route, never including `exclude`
    fn snapshot(&self, exclude: Option<&str>) -> NetworkSnapshot;

    /// Next hop of the current default route
    fn default_gateway(&self, exclude: Option<&str>) -> Option<(Ipv4Addr, NetworkId)>;

    fn interface_exists(&self, name: &str) -> bool;

    fn default_network(&self, exclude: Option<&str>) -> Option<NetworkId> {
        self.snapshot(exclude).default
    }
}
