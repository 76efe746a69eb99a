// Tun Proxy - Daemon Config Module
// Handles daemon configuration (listener, engine, platform collaborators)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tun_proxy_common::{is_loopback_address, TomlPreferenceStore};

use crate::engine::{default_engine_args, EngineSettings, DEFAULT_ENGINE_MTU};

/// Listener mode for the daemon
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// TCP with HTTP (loopback-only)
    TcpHttp,
}

/// External forwarder launched for each tunnel run
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_engine_command")]
    pub command: PathBuf,

    /// Arguments with `{fd}`, `{proxy}`, `{loglevel}` and `{mtu}` placeholders
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,

    #[serde(default = "default_engine_mtu")]
    pub mtu: u32,
}

fn default_engine_command() -> PathBuf {
    PathBuf::from("tun2socks")
}

fn default_engine_mtu() -> u32 {
    DEFAULT_ENGINE_MTU
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            mtu: default_engine_mtu(),
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            command: self.command.clone(),
            args: self.args.clone(),
            mtu: self.mtu,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Listener mode (UnixSocket or TcpHttp)
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind host for TCP mode, must be a loopback address
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bind port for TCP mode
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Enable group access to Unix socket and runtime directory
    /// When true, sets permissions to 0770/0660 instead of 0700/0600
    #[serde(default)]
    pub group_access: bool,

    /// Preference file shared with the CLI
    #[serde(default = "default_preferences_path")]
    pub preferences_path: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Tun device name; `%d` lets the kernel pick a free number
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// Passed to the engine when its context is created
    #[serde(default = "default_platform_version")]
    pub platform_version: u32,

    /// How often host networks are polled
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Minimum time between network-triggered restarts; 0 disables the guard
    #[serde(default)]
    pub restart_cooldown_ms: u64,

    /// Restore the tunnel at startup when it was running before
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    /// Block system sleep while the tunnel is up
    #[serde(default)]
    pub inhibit_sleep: bool,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    3480
}

fn default_preferences_path() -> PathBuf {
    TomlPreferenceStore::default_path()
        .unwrap_or_else(|_| PathBuf::from("preferences.toml"))
}

fn default_interface_name() -> String {
    "tunproxy%d".to_string()
}

fn default_platform_version() -> u32 {
    1
}

fn default_monitor_interval_ms() -> u64 {
    2000
}

fn default_autostart() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            group_access: false,
            preferences_path: default_preferences_path(),
            engine: EngineConfig::default(),
            interface_name: default_interface_name(),
            platform_version: default_platform_version(),
            monitor_interval_ms: default_monitor_interval_ms(),
            restart_cooldown_ms: 0,
            autostart: default_autostart(),
            inhibit_sleep: false,
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp && !is_loopback_address(&self.bind_host) {
            anyhow::bail!(
                "Security violation: tcp-http listener must bind to a loopback address (bind_host: {}).\n\
                 The API can start and stop system-wide routing; use 127.0.0.1, ::1 or localhost,\n\
                 or switch listener_mode to 'unix-socket'.",
                self.bind_host
            );
        }

        if self.listener_mode == ListenerMode::TcpHttp && self.bind_port == 0 {
            anyhow::bail!("bind_port must not be 0 in tcp-http mode");
        }

        if self.engine.command.as_os_str().is_empty() {
            anyhow::bail!("engine.command must not be empty");
        }

        if self.engine.mtu < 576 {
            anyhow::bail!("engine.mtu {} is below the IPv4 minimum of 576", self.engine.mtu);
        }

        if self.interface_name.is_empty() || self.interface_name.len() >= libc::IFNAMSIZ {
            anyhow::bail!(
                "interface_name '{}' must be 1-{} characters",
                self.interface_name,
                libc::IFNAMSIZ - 1
            );
        }

        if self.monitor_interval_ms == 0 {
            anyhow::bail!("monitor_interval_ms must be greater than 0");
        }

        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    /// Load daemon configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .context("Failed to read daemon configuration")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse daemon configuration")?;

        // Validate the loaded configuration
        config.validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents)
            .context("Failed to write daemon configuration")?;

        // Set restrictive permissions on config file (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tun-proxy").join("daemon.toml"))
    }
}
