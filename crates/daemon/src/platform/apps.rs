// Tun Proxy - Installed application lookup
// Applications are desktop entry ids or executables on PATH

use std::env;
use std::path::PathBuf;

use super::AppResolver;

pub struct DesktopAppResolver {
    entry_dirs: Vec<PathBuf>,
    bin_dirs: Vec<PathBuf>,
}

impl DesktopAppResolver {
    /// XDG application directories plus the daemon's PATH
    pub fn from_environment() -> Self {
        let mut entry_dirs = Vec::new();
        if let Some(data) = dirs::data_dir() {
            entry_dirs.push(data.join("applications"));
            entry_dirs.push(data.join("flatpak/exports/share/applications"));
        }
        let data_dirs = env::var("XDG_DATA_DIRS")
            .unwrap_or_else(|_| "/usr/local/share:/usr/share".to_string());
        entry_dirs.extend(
            data_dirs
                .split(':')
                .filter(|d| !d.is_empty())
                .map(|d| PathBuf::from(d).join("applications")),
        );
        entry_dirs.push(PathBuf::from("/var/lib/flatpak/exports/share/applications"));

        let bin_dirs = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect())
            .unwrap_or_default();

        Self::with_dirs(entry_dirs, bin_dirs)
    }

    pub fn with_dirs(entry_dirs: Vec<PathBuf>, bin_dirs: Vec<PathBuf>) -> Self {
        Self {
            entry_dirs,
            bin_dirs,
        }
    }
}

impl AppResolver for DesktopAppResolver {
    fn is_installed(&self, app_id: &str) -> bool {
        if app_id.is_empty() || app_id.contains('/') {
            return false;
        }
        let entry = format!("{}.desktop", app_id.trim_end_matches(".desktop"));
        self.entry_dirs.iter().any(|dir| dir.join(&entry).is_file())
            || self.bin_dirs.iter().any(|dir| dir.join(app_id).is_file())
    }
}
