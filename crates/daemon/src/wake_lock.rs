// Tun Proxy - Wake Lock
// Keeps the host from suspending while a tunnel is up

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use tun_proxy_common::Result;

/// Mechanism that actually blocks suspend
pub trait HoldBackend: Send + Sync {
    fn hold(&self) -> Result<()>;
    fn release(&self);
}

/// Does nothing; used when sleep inhibition is disabled
pub struct NoopBackend;

impl HoldBackend for NoopBackend {
    fn hold(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

/// Holds a logind sleep inhibitor through a `systemd-inhibit` child
pub struct SleepInhibitor {
    child: Mutex<Option<Child>>,
}

impl SleepInhibitor {
    pub fn new() -> Self {
        Self {
            child: Mutex::new(None),
        }
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SleepInhibitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HoldBackend for SleepInhibitor {
    fn hold(&self) -> Result<()> {
        let mut slot = self.child();
        if slot.is_some() {
            return Ok(());
        }
        let child = Command::new("systemd-inhibit")
            .args([
                "--what=sleep",
                "--who=tun-proxy",
                "--why=Tunnel active",
                "--mode=block",
                "sleep",
                "infinity",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        debug!("Sleep inhibitor running with PID {}", child.id());
        *slot = Some(child);
        Ok(())
    }

    fn release(&self) {
        if let Some(mut child) = self.child().take() {
            if let Err(e) = child.kill() {
                debug!("Sleep inhibitor already gone: {}", e);
            }
            let _ = child.wait();
        }
    }
}

struct Shared {
    holders: Mutex<usize>,
    backend: Box<dyn HoldBackend>,
}

impl Shared {
    fn holders(&self) -> MutexGuard<'_, usize> {
        self.holders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reference-counted lock; the backend is held while any guard is alive
#[derive(Clone)]
pub struct WakeLock {
    shared: Arc<Shared>,
}

impl WakeLock {
    pub fn new(backend: Box<dyn HoldBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                holders: Mutex::new(0),
                backend,
            }),
        }
    }

    pub fn noop() -> Self {
        Self::new(Box::new(NoopBackend))
    }

    /// Failure to hold is logged; the guard is still returned
    pub fn acquire(&self) -> WakeLockGuard {
        let mut holders = self.shared.holders();
        if *holders == 0 {
            match self.shared.backend.hold() {
                Ok(()) => info!("Wake lock acquired"),
                Err(e) => warn!("Wake lock not acquired: {}", e),
            }
        }
        *holders += 1;
        WakeLockGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn holders(&self) -> usize {
        *self.shared.holders()
    }
}

/// Released on drop
pub struct WakeLockGuard {
    shared: Arc<Shared>,
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        let mut holders = self.shared.holders();
        *holders = holders.saturating_sub(1);
        if *holders == 0 {
            self.shared.backend.release();
            info!("Wake lock released");
        }
    }
}
