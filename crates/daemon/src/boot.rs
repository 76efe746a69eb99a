// Tun Proxy - Boot autostart
// Restores the tunnel at daemon start when it was running before

use tracing::{debug, info, warn};
use tun_proxy_common::{Preferences, StartOutcome};

use crate::controller::TunnelController;
use crate::platform::{PermissionGate, PermissionState};

/// Start the tunnel if it was running and permission is already in place
///
/// Never prompts; returns the start outcome when a start was attempted.
pub fn autostart(
    controller: &TunnelController,
    preferences: &Preferences,
    permission: &dyn PermissionGate,
) -> Option<StartOutcome> {
    let was_running = match preferences.is_running() {
        Ok(running) => running,
        Err(e) => {
            warn!("Cannot read running preference: {}", e);
            return None;
        }
    };
    if !was_running {
        debug!("Tunnel was not running, no autostart");
        return None;
    }
    if permission.check() != PermissionState::Granted {
        info!("Tunnel was running but permission is not granted, skipping autostart");
        return None;
    }

    info!("Restoring tunnel from previous session");
    match controller.start() {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!("Autostart failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_builder::ConfigBuilder;
    use crate::controller::{Collaborators, ControllerSettings};
    use crate::status::StatusPublisher;
    use crate::testing::{FakeApps, FakeDns, FakeEngine, FakeEstablisher, FakeGate, FakeProbe, Journal};
    use crate::wake_lock::WakeLock;
    use std::sync::Arc;

    fn controller(prefs: &Preferences) -> TunnelController {
        let journal = Journal::default();
        TunnelController::new(
            Collaborators {
                engine: Arc::new(FakeEngine::new(journal.clone(), 1500)),
                establisher: Arc::new(FakeEstablisher::new(journal)),
                probe: Arc::new(FakeProbe::with_default("eth0")),
                config_builder: ConfigBuilder::new(
                    prefs.clone(),
                    Arc::new(FakeApps::new(&[])),
                    Arc::new(FakeDns(vec![])),
                ),
                preferences: prefs.clone(),
                status: StatusPublisher::new(),
                wake_lock: WakeLock::noop(),
            },
            ControllerSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_no_autostart_when_not_running() {
        let prefs = Preferences::in_memory();
        let controller = controller(&prefs);
        assert_eq!(autostart(&controller, &prefs, &FakeGate::granted()), None);
    }

    #[test]
    fn test_autostart_restores_tunnel() {
        let prefs = Preferences::in_memory();
        prefs.save_host_port("127.0.0.1", 1080).unwrap();
        prefs.set_running(true).unwrap();
        let controller = controller(&prefs);

        assert_eq!(
            autostart(&controller, &prefs, &FakeGate::granted()),
            Some(StartOutcome::Started)
        );
        controller.stop().unwrap();
    }

    #[test]
    fn test_no_autostart_without_permission() {
        let prefs = Preferences::in_memory();
        prefs.set_running(true).unwrap();
        let controller = controller(&prefs);
        assert_eq!(autostart(&controller, &prefs, &FakeGate::denied()), None);
        assert!(!controller.is_running());
    }
}
