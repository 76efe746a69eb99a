// Tun Proxy - Permissions
// Hardening for the daemon's runtime directory and API socket

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Owner-only (or owner+group) modes for what the daemon creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessModes {
    pub directory: u32,
    pub socket: u32,
}

impl AccessModes {
    pub fn for_group_access(group_access: bool) -> Self {
        if group_access {
            Self {
                directory: 0o770,
                socket: 0o660,
            }
        } else {
            Self {
                directory: 0o700,
                socket: 0o600,
            }
        }
    }
}

/// Files created from here on are private to the daemon user
pub fn set_restrictive_umask() {
    // SAFETY: umask only changes this process's file creation mask
    unsafe {
        libc::umask(0o077);
    }
    debug!("Set restrictive umask: 0077");
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// Unix socket mode: 0600, or 0660 with group access
pub fn set_socket_permissions(path: &Path, group_access: bool) -> Result<()> {
    let mode = AccessModes::for_group_access(group_access).socket;
    set_mode(path, mode)?;
    info!("Set socket permissions to {:o}: {}", mode, path.display());
    Ok(())
}

/// Create `path` if needed and restrict it: 0700, or 0770 with group access
pub fn ensure_directory_with_permissions(path: &Path, group_access: bool) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    let mode = AccessModes::for_group_access(group_access).directory;
    set_mode(path, mode)?;
    info!("Set directory permissions to {:o}: {}", mode, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_directory_permissions() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("run").join("tun-proxy");

        ensure_directory_with_permissions(&dir, false).unwrap();
        assert_eq!(mode(&dir), 0o700);

        ensure_directory_with_permissions(&dir, true).unwrap();
        assert_eq!(mode(&dir), 0o770);
    }

    #[test]
    fn test_socket_permissions() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("tun-proxy.sock");
        fs::write(&file, "").unwrap();

        set_socket_permissions(&file, false).unwrap();
        assert_eq!(mode(&file), 0o600);

        set_socket_permissions(&file, true).unwrap();
        assert_eq!(mode(&file), 0o660);
    }
}
