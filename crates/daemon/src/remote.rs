// Tun Proxy - Remote Service
// Lets trusted local callers configure and start or stop the tunnel in one call

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};
use tun_proxy_common::{
    is_valid_ipv4_endpoint, Error, FilterMode, Preferences, RemoteOutcome, Result, StartOutcome,
};

use crate::controller::TunnelController;
use crate::platform::{PermissionGate, PermissionState};

/// Invoked exactly once with the outcome of a remote request
pub type Completion = Box<dyn FnOnce(&RemoteOutcome) + Send>;

pub struct RemoteService {
    controller: Arc<TunnelController>,
    preferences: Preferences,
    permission: Arc<dyn PermissionGate>,
}

impl RemoteService {
    pub fn new(
        controller: Arc<TunnelController>,
        preferences: Preferences,
        permission: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            controller,
            preferences,
            permission,
        }
    }

    /// Route only `apps` through the tunnel
    pub fn start_allowed(
        &self,
        host: &str,
        port: u16,
        apps: &[String],
        completion: Option<Completion>,
    ) -> RemoteOutcome {
        self.start_with(FilterMode::Allow, host, port, apps, completion)
    }

    /// Route everything except `apps` through the tunnel
    pub fn start_denied(
        &self,
        host: &str,
        port: u16,
        apps: &[String],
        completion: Option<Completion>,
    ) -> RemoteOutcome {
        self.start_with(FilterMode::Deny, host, port, apps, completion)
    }

    pub fn stop(&self, completion: Option<Completion>) -> RemoteOutcome {
        info!("Remote stop requested");
        let outcome = match self.controller.stop() {
            Ok(_) => RemoteOutcome::Success,
            Err(e) => RemoteOutcome::Failed {
                error: e.to_string(),
            },
        };
        complete(outcome, completion)
    }

    fn start_with(
        &self,
        mode: FilterMode,
        host: &str,
        port: u16,
        apps: &[String],
        completion: Option<Completion>,
    ) -> RemoteOutcome {
        info!(
            "Remote start ({}) via {}:{} for {} application(s)",
            mode,
            host,
            port,
            apps.len()
        );
        let outcome = match self.store_request(mode, host, port, apps) {
            Ok(()) => self.request_start(),
            Err(e) => {
                warn!("Remote start rejected: {}", e);
                RemoteOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        complete(outcome, completion)
    }

    fn store_request(&self, mode: FilterMode, host: &str, port: u16, apps: &[String]) -> Result<()> {
        if !is_valid_ipv4_endpoint(host) {
            return Err(Error::InvalidEndpoint(format!(
                "'{}' is not an IPv4 address",
                host
            )));
        }
        if port == 0 {
            return Err(Error::InvalidEndpoint("port must not be 0".to_string()));
        }

        let apps: BTreeSet<String> = apps
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        self.preferences.set_filter_mode(mode)?;
        self.preferences.save_host_port(host, port)?;
        self.preferences.store_filter_apps(mode, &apps)
    }

    fn request_start(&self) -> RemoteOutcome {
        if self.permission.check() != PermissionState::Granted {
            info!("Remote start needs a permission grant first");
            return RemoteOutcome::PermissionDenied;
        }

        // An active tunnel is restarted so the new settings apply
        match self.controller.restart_remote() {
            Ok(StartOutcome::Ignored) => RemoteOutcome::Failed {
                error: "another start or stop is in progress".to_string(),
            },
            Ok(_) => RemoteOutcome::Success,
            Err(e) if e.is_permission_denied() => RemoteOutcome::PermissionDenied,
            Err(e) => RemoteOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}

fn complete(outcome: RemoteOutcome, completion: Option<Completion>) -> RemoteOutcome {
    if let Some(completion) = completion {
        completion(&outcome);
    }
    outcome
}
