// Tun Proxy - Status Publisher
// Fans out lifecycle transitions to subscribers

use tokio::sync::broadcast;
use tracing::debug;
use tun_proxy_common::{StatusEvent, TunnelState, Utc};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct StatusPublisher {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: StatusEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            debug!("Status event dropped, no subscribers");
        }
    }

    pub fn state(&self, state: TunnelState) {
        self.publish(StatusEvent::StateChanged {
            state,
            timestamp: Utc::now(),
        });
    }

    pub fn running(&self, running: bool) {
        self.publish(StatusEvent::Running {
            running,
            timestamp: Utc::now(),
        });
    }

    pub fn busy(&self, busy: bool) {
        self.publish(StatusEvent::Busy {
            busy,
            timestamp: Utc::now(),
        });
    }

    pub fn started_remotely(&self, started_remotely: bool) {
        self.publish(StatusEvent::StartedRemotely {
            started_remotely,
            timestamp: Utc::now(),
        });
    }

    pub fn error(&self, error: impl Into<String>) {
        self.publish(StatusEvent::Error {
            error: error.into(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}
