// Tun Proxy - Network Monitor
// Polls the host network state and forwards changes to the controller

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::TunnelController;
use crate::network_watcher::{diff_snapshots, NetworkEvent, NetworkSnapshot};
use crate::platform::NetworkProbe;

pub struct NetworkMonitor {
    probe: Arc<dyn NetworkProbe>,
    controller: Arc<TunnelController>,
    interval: Duration,
}

impl NetworkMonitor {
    pub fn new(probe: Arc<dyn NetworkProbe>, controller: Arc<TunnelController>, interval: Duration) -> Self {
        Self {
            probe,
            controller,
            interval,
        }
    }

    /// Run until `shutdown` fires
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Network monitor polling every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous = self.snapshot().await;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Network monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        previous = self.poll(previous).await;
                    }
                }
            }
        })
    }

    async fn poll(&self, previous: NetworkSnapshot) -> NetworkSnapshot {
        self.check_interface().await;

        let current = self.snapshot().await;
        for event in diff_snapshots(&previous, &current) {
            self.deliver(event).await;
        }
        current
    }

    async fn snapshot(&self) -> NetworkSnapshot {
        let probe = Arc::clone(&self.probe);
        let exclude = self.controller.interface_name();
        match tokio::task::spawn_blocking(move || probe.snapshot(exclude.as_deref())).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Network probe failed: {}", e);
                NetworkSnapshot::default()
            }
        }
    }

    /// The tunnel interface vanishing means the host took it away
    async fn check_interface(&self) {
        let Some(name) = self.controller.interface_name() else {
            return;
        };
        let probe = Arc::clone(&self.probe);
        let controller = Arc::clone(&self.controller);
        let result = tokio::task::spawn_blocking(move || {
            if !probe.interface_exists(&name) {
                controller.interface_gone(&name);
            }
        })
        .await;
        if let Err(e) = result {
            warn!("Interface check failed: {}", e);
        }
    }

    async fn deliver(&self, event: NetworkEvent) {
        debug!("Network event: {:?}", event);
        let controller = Arc::clone(&self.controller);
        if let Err(e) = tokio::task::spawn_blocking(move || controller.handle_network_event(&event)).await {
            warn!("Network event handling failed: {}", e);
        }
    }
}
