// Tun Proxy - PID File Management
// Only one daemon may own the tunnel at a time

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Removes the PID file when dropped
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the default PID file, next to the API socket
    pub fn create() -> Result<Self> {
        let socket = tun_proxy_common::default_socket_path();
        let runtime_dir = socket
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))?;
        Self::create_at(&runtime_dir.join("daemon.pid"))
    }

    /// Fails when the file names a live process; stale files are replaced
    pub fn create_at(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(pid) if is_process_running(pid) => {
                    anyhow::bail!(
                        "Daemon is already running with PID {}. \
                         Stop it first or remove {} if it is stale.",
                        pid,
                        path.display()
                    );
                }
                Ok(pid) => {
                    warn!("Removing stale PID file for process {}", pid);
                    fs::remove_file(path).context("Failed to remove stale PID file")?;
                }
                Err(_) => {
                    warn!("Ignoring unreadable PID file {}", path.display());
                    let _ = fs::remove_file(path);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to read PID file {}: {}", path.display(), e);
                let _ = fs::remove_file(path);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(path, pid.to_string()).context("Failed to write PID file")?;
        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// kill(pid, 0) probes for existence without delivering a signal
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the permission and existence check
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}
