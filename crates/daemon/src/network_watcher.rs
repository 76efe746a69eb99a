// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - Network Watcher
// Decides when a change of the default network requires a tunnel restart

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// A network is identified by the interface carrying its default route
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkId(pub String);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(s: &str) -> Self {
        NetworkId(s.to_string())
    }
}

/// Networks offering general connectivity at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub default: Option<NetworkId>,
    pub available: BTreeSet<NetworkId>,
}

/// Notifications delivered by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// `network` became the default network
    DefaultChanged(NetworkId),
    /// `network` no longer offers connectivity
    Lost(NetworkId),
}

/// Why a restart was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    Lost(NetworkId),
    Migrated {
        from: Option<NetworkId>,
        to: NetworkId,
    },
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Lost(n) => write!(f, "network {} lost", n),
            RestartReason::Migrated { from: Some(from), to } => {
                write!(f, "default network moved from {} to {}", from, to)
            }
            RestartReason::Migrated { from: None, to } => {
                write!(f, "default network {} appeared", to)
            }
        }
    }
}

/// Converts two consecutive snapshots into host notifications
pub fn diff_snapshots(previous: &NetworkSnapshot, current: &NetworkSnapshot) -> Vec<NetworkEvent> {
    let mut events: Vec<NetworkEvent> = previous
        .available
        .difference(&current.available)
        .cloned()
        .map(NetworkEvent::Lost)
        .collect();

    if current.default != previous.default {
        if let Some(default) = &current.default {
            events.push(NetworkEvent::DefaultChanged(default.clone()));
        }
    }
    events
}

/// Restart policy for the network the tunnel is bound to
///
/// Armed while the tunnel is up. Emits at most one restart per transition.
#[derive(Debug)]
pub struct NetworkWatcher {
    armed: bool,
    tracked: Option<NetworkId>,
    pending: Option<NetworkEvent>,
    cooldown: Duration,
    last_restart: Option<Instant>,
}

impl NetworkWatcher {
    /// `cooldown` of zero disables the flapping guard
    pub fn new(cooldown: Duration) -> Self {
        Self {
            armed: false,
            tracked: None,
            pending: None,
            cooldown,
            last_restart: None,
        }
    }

    /// Start reacting, bound to the network that is the default right now
    pub fn arm(&mut self, current: Option<NetworkId>) {
        if let Some(pending) = &self.pending {
            let settled = match pending {
                NetworkEvent::Lost(n) => current.as_ref() != Some(n),
                NetworkEvent::DefaultChanged(n) => current.as_ref() == Some(n),
            };
            if settled {
                self.pending = None;
            }
        }
        debug!("Network watcher bound to {:?}", current);
        self.tracked = current;
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.tracked = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn tracked(&self) -> Option<&NetworkId> {
        self.tracked.as_ref()
    }

    /// Feed one notification; returns the restart to perform, if any
    pub fn on_event(&mut self, event: &NetworkEvent) -> Option<RestartReason> {
        if !self.armed {
            return None;
        }

        let reason = match event {
            NetworkEvent::Lost(n) if self.tracked.as_ref() == Some(n) => {
                Some(RestartReason::Lost(n.clone()))
            }
            NetworkEvent::DefaultChanged(n) if self.tracked.as_ref() != Some(n) => {
                Some(RestartReason::Migrated {
                    from: self.tracked.clone(),
                    to: n.clone(),
                })
            }
            _ => None,
        }?;

        if self.pending.as_ref() == Some(event) {
            debug!("Restart for {:?} already requested, ignoring", event);
            return None;
        }

        if !self.cooldown.is_zero() {
            if let Some(last) = self.last_restart {
                if last.elapsed() < self.cooldown {
                    info!("Skipping restart ({}), last restart was {:?} ago", reason, last.elapsed());
                    return None;
                }
            }
        }

        self.pending = Some(event.clone());
        self.last_restart = Some(Instant::now());
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(name: &str) -> NetworkId {
        NetworkId::from(name)
    }

    fn snapshot(default: Option<&str>, available: &[&str]) -> NetworkSnapshot {
        NetworkSnapshot {
            default: default.map(net),
            available: available.iter().map(|n| net(n)).collect(),
        }
    }

    #[test]
    fn test_disarmed_watcher_is_silent() {
        let mut watcher = NetworkWatcher::new(Duration::ZERO);
        assert_eq!(watcher.on_event(&NetworkEvent::Lost(net("wlan0"))), None);
        assert_eq!(watcher.on_event(&NetworkEvent::DefaultChanged(net("eth0"))), None);
    }

    #[test]
    fn test_lost_tracked_network_restarts_once() {
        let mut watcher = NetworkWatcher::new(Duration::ZERO);
        watcher.arm(Some(net("wlan0")));

        let event = NetworkEvent::Lost(net("wlan0"));
        assert_eq!(watcher.on_event(&event), Some(RestartReason::Lost(net("wlan0"))));
        // Same transition reported again before the restart settled
        assert_eq!(watcher.on_event(&event), None);
    }

    #[test]
    fn test_lost_other_network_is_ignored() {
        let mut watcher = NetworkWatcher::new(Duration::ZERO);
        watcher.arm(Some(net("wlan0")));
        assert_eq!(watcher.on_event(&NetworkEvent::Lost(net("eth0"))), None);
    }

    #[test]
    fn test_new_default_network_migrates() {
        let mut watcher = NetworkWatcher::new(Duration::ZERO);
        watcher.arm(Some(net("wlan0")));

        assert_eq!(
            watcher.on_event(&NetworkEvent::DefaultChanged(net("eth0"))),
            Some(RestartReason::Migrated {
                from: Some(net("wlan0")),
                to: net("eth0"),
            })
        );
    }

    #[test]
    fn test_default_already_tracked_is_ignored() {
        let mut watcher = NetworkWatcher::new(Duration::ZERO);
        watcher.arm(Some(net("eth0")));
        assert_eq!(watcher.on_event(&NetworkEvent::DefaultChanged(net("eth0"))), None);
    }

    #[test]
    fn test_untracked_tunnel_migrates_when_network_appears() {
        let mut watcher = NetworkWatcher::new(Duration::ZERO);
        watcher.arm(None);
        assert_eq!(
            watcher.on_event(&NetworkEvent::DefaultChanged(net("eth0"))),
            Some(RestartReason::Migrated {
                from: None,
                to: net("eth0"),
            })
        );
    }

    #[test]
    fn test_duplicate_suppressed_until_transition_settles() {
        let mut watcher = NetworkWatcher::new(Duration::ZERO);
        watcher.arm(Some(net("wlan0")));

        let event = NetworkEvent::DefaultChanged(net("eth0"));
        assert!(watcher.on_event(&event).is_some());

        // Restart came back up but the host still reported wlan0 as default
        watcher.disarm();
        watcher.arm(Some(net("wlan0")));
        assert_eq!(watcher.on_event(&event), None);

        // Once bound to eth0 the transition is settled; a later switch back restarts
        watcher.disarm();
        watcher.arm(Some(net("eth0")));
        assert!(watcher
            .on_event(&NetworkEvent::DefaultChanged(net("wlan0")))
            .is_some());
    }

    #[test]
    fn test_cooldown_suppresses_flapping() {
        let mut watcher = NetworkWatcher::new(Duration::from_secs(60));
        watcher.arm(Some(net("wlan0")));
        assert!(watcher.on_event(&NetworkEvent::Lost(net("wlan0"))).is_some());

        watcher.disarm();
        watcher.arm(Some(net("eth0")));
        assert_eq!(watcher.on_event(&NetworkEvent::Lost(net("eth0"))), None);
    }

    #[test]
    fn test_diff_reports_lost_and_new_default() {
        let before = snapshot(Some("wlan0"), &["wlan0", "eth0"]);
        let after = snapshot(Some("eth0"), &["eth0"]);
        assert_eq!(
            diff_snapshots(&before, &after),
            vec![
                NetworkEvent::Lost(net("wlan0")),
                NetworkEvent::DefaultChanged(net("eth0")),
            ]
        );
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty() {
        let s = snapshot(Some("eth0"), &["eth0"]);
        assert!(diff_snapshots(&s, &s).is_empty());
    }

    #[test]
    fn test_diff_all_networks_gone() {
        let before = snapshot(Some("eth0"), &["eth0"]);
        let after = snapshot(None, &[]);
        assert_eq!(
            diff_snapshots(&before, &after),
            vec![NetworkEvent::Lost(net("eth0"))]
        );
    }
}
