// Tun Proxy - CLI Config Module
// Where the CLI finds the daemon and the shared preference file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tun_proxy_common::{DaemonClientConfig, TomlPreferenceStore};

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,

    /// Preference file edited by `proxy`, `filter`, `log-level` and `addresses`;
    /// must match the daemon's `preferences_path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences_path: Option<PathBuf>,
}

impl CliConfig {
    /// Load CLI configuration, defaults when the file doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read CLI configuration")?;

        toml::from_str(&contents).context("Failed to parse CLI configuration")
    }

    pub fn preferences_path(&self) -> Result<PathBuf> {
        match &self.preferences_path {
            Some(path) => Ok(path.clone()),
            None => Ok(TomlPreferenceStore::default_path()?),
        }
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tun-proxy").join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tun_proxy_common::ConnectionMode;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(
            config.daemon_config.connection_mode,
            ConnectionMode::UnixSocket
        );
        assert_eq!(config.daemon_config.daemon_base_url(), "http://daemon");
        assert!(config.preferences_path.is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load_from(&dir.path().join("cli.toml")).unwrap();
        assert_eq!(config.daemon_config.daemon_port, 3480);
    }

    #[test]
    fn test_http_mode_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cli.toml");
        fs::write(
            &path,
            "connection_mode = \"http\"\ndaemon_port = 4000\npreferences_path = \"/etc/tun-proxy/preferences.toml\"\n",
        )
        .unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.daemon_config.connection_mode, ConnectionMode::Http);
        assert_eq!(config.daemon_config.daemon_base_url(), "http://127.0.0.1:4000");
        assert_eq!(
            config.preferences_path().unwrap(),
            PathBuf::from("/etc/tun-proxy/preferences.toml")
        );
    }
}
