// Tun Proxy - Preferences Module
// Key/value storage shared by the daemon and the CLI

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{
    IpPrefix, LogLevel, ProxyCredentials, ProxyEndpoint, DEFAULT_LOCAL_IPV4, DEFAULT_LOCAL_IPV6,
};
use crate::error::{Error, Result};
use crate::types::FilterMode;

/// Preference keys
pub mod keys {
    pub const PROXY_HOST: &str = "pref_proxy_host";
    pub const PROXY_PORT: &str = "pref_proxy_port";
    pub const PROXY_USER: &str = "pref_proxy_user";
    pub const PROXY_PASSWORD: &str = "pref_proxy_password";
    pub const LOG_LEVEL: &str = "pref_log_level";
    pub const RUNNING: &str = "pref_running";
    pub const LOCAL_IPV4: &str = "vpn4";
    pub const LOCAL_IPV6: &str = "vpn6";
    pub const FILTER_MODE: &str = "pref_vpn_connection_mode";
    pub const ALLOWED_APPS: &str = "pref_vpn_allowed_application";
    pub const DENIED_APPS: &str = "pref_vpn_disallowed_application";
}

/// A stored preference value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    String(String),
    StringSet(BTreeSet<String>),
}

/// Key/value storage collaborator
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<PrefValue>>;
    fn set(&self, key: &str, value: PrefValue) -> Result<()>;
}

/// In-process store, used when nothing needs to survive a restart
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<BTreeMap<String, PrefValue>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Result<Option<PrefValue>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: PrefValue) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// TOML file store
///
/// The file is re-read on every access so that edits made by another
/// process (the CLI) are seen by the daemon on its next start.
#[derive(Debug)]
pub struct TomlPreferenceStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TomlPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Default location: `<config_dir>/tun-proxy/preferences.toml`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join("tun-proxy").join("preferences.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, PrefValue>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn save(&self, values: &BTreeMap<String, PrefValue>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(values)
            .map_err(|e| Error::Preferences(format!("Failed to serialize preferences: {}", e)))?;
        fs::write(&self.path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl PreferenceStore for TomlPreferenceStore {
    fn get(&self, key: &str) -> Result<Option<PrefValue>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: PrefValue) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.load()?;
        values.insert(key.to_string(), value);
        self.save(&values)?;
        debug!("Stored preference {} in {}", key, self.path.display());
        Ok(())
    }
}

/// Typed access to the stored preferences
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn PreferenceStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    /// Preferences backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPreferenceStore::new()))
    }

    fn string(&self, key: &str) -> Result<Option<String>> {
        match self.store.get(key)? {
            None => Ok(None),
            Some(PrefValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(mismatch(key, "string", &other)),
        }
    }

    fn int(&self, key: &str) -> Result<Option<i64>> {
        match self.store.get(key)? {
            None => Ok(None),
            Some(PrefValue::Int(i)) => Ok(Some(i)),
            // list preferences are written as strings by some editors
            Some(PrefValue::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Preferences(format!("{} is not a number: '{}'", key, s))),
            Some(other) => Err(mismatch(key, "integer", &other)),
        }
    }

    fn string_set(&self, key: &str) -> Result<BTreeSet<String>> {
        match self.store.get(key)? {
            None => Ok(BTreeSet::new()),
            Some(PrefValue::StringSet(set)) => Ok(set),
            Some(other) => Err(mismatch(key, "string set", &other)),
        }
    }

    pub fn save_host_port(&self, host: &str, port: u16) -> Result<()> {
        self.store
            .set(keys::PROXY_HOST, PrefValue::String(host.to_string()))?;
        self.store
            .set(keys::PROXY_PORT, PrefValue::Int(i64::from(port)))
    }

    pub fn save_credentials(&self, username: &str, password: &str) -> Result<()> {
        self.store
            .set(keys::PROXY_USER, PrefValue::String(username.to_string()))?;
        self.store
            .set(keys::PROXY_PASSWORD, PrefValue::String(password.to_string()))
    }

    /// Stored proxy endpoint, `None` when host is empty or port is 0
    pub fn proxy_endpoint(&self) -> Result<Option<ProxyEndpoint>> {
        let host = self.string(keys::PROXY_HOST)?.unwrap_or_default();
        let port = self.int(keys::PROXY_PORT)?.unwrap_or(0);
        if host.trim().is_empty() || port == 0 {
            return Ok(None);
        }
        let port = u16::try_from(port)
            .map_err(|_| Error::Preferences(format!("proxy port {} out of range", port)))?;

        let username = self.string(keys::PROXY_USER)?.unwrap_or_default();
        let credentials = if username.is_empty() {
            None
        } else {
            Some(ProxyCredentials {
                username,
                password: self.string(keys::PROXY_PASSWORD)?.unwrap_or_default(),
            })
        };

        Ok(Some(ProxyEndpoint {
            host,
            port,
            credentials,
        }))
    }

    pub fn log_level(&self) -> Result<LogLevel> {
        match self.int(keys::LOG_LEVEL)? {
            Some(level) => i32::try_from(level)
                .map(LogLevel)
                .map_err(|_| Error::Preferences(format!("log level {} out of range", level))),
            None => Ok(LogLevel::default()),
        }
    }

    pub fn set_log_level(&self, level: LogLevel) -> Result<()> {
        self.store
            .set(keys::LOG_LEVEL, PrefValue::Int(i64::from(level.0)))
    }

    pub fn filter_mode(&self) -> Result<FilterMode> {
        match self.string(keys::FILTER_MODE)? {
            Some(mode) => mode.parse(),
            None => Ok(FilterMode::default()),
        }
    }

    pub fn set_filter_mode(&self, mode: FilterMode) -> Result<()> {
        self.store
            .set(keys::FILTER_MODE, PrefValue::String(mode.as_str().to_string()))
    }

    /// Application identifiers stored for `mode` (one set per mode)
    pub fn filter_apps(&self, mode: FilterMode) -> Result<BTreeSet<String>> {
        self.string_set(apps_key(mode))
    }

    pub fn store_filter_apps(&self, mode: FilterMode, apps: &BTreeSet<String>) -> Result<()> {
        self.store
            .set(apps_key(mode), PrefValue::StringSet(apps.clone()))
    }

    pub fn is_running(&self) -> Result<bool> {
        match self.store.get(keys::RUNNING)? {
            None => Ok(false),
            Some(PrefValue::Bool(b)) => Ok(b),
            Some(other) => Err(mismatch(keys::RUNNING, "bool", &other)),
        }
    }

    pub fn set_running(&self, running: bool) -> Result<()> {
        self.store.set(keys::RUNNING, PrefValue::Bool(running))
    }

    pub fn local_ipv4(&self) -> Result<IpPrefix> {
        self.local_address(keys::LOCAL_IPV4, IpAddr::V4(DEFAULT_LOCAL_IPV4))
    }

    pub fn local_ipv6(&self) -> Result<IpPrefix> {
        self.local_address(keys::LOCAL_IPV6, IpAddr::V6(DEFAULT_LOCAL_IPV6))
    }

    pub fn set_local_addresses(&self, ipv4: Option<IpPrefix>, ipv6: Option<IpPrefix>) -> Result<()> {
        if let Some(v4) = ipv4 {
            if !v4.address.is_ipv4() {
                return Err(Error::Config(format!("{} is not an IPv4 address", v4)));
            }
            self.store
                .set(keys::LOCAL_IPV4, PrefValue::String(v4.to_string()))?;
        }
        if let Some(v6) = ipv6 {
            if !v6.address.is_ipv6() {
                return Err(Error::Config(format!("{} is not an IPv6 address", v6)));
            }
            self.store
                .set(keys::LOCAL_IPV6, PrefValue::String(v6.to_string()))?;
        }
        Ok(())
    }

    fn local_address(&self, key: &str, default: IpAddr) -> Result<IpPrefix> {
        match self.string(key)? {
            Some(s) if !s.trim().is_empty() => s.parse(),
            _ => Ok(IpPrefix::host(default)),
        }
    }
}

fn apps_key(mode: FilterMode) -> &'static str {
    match mode {
        FilterMode::Allow => keys::ALLOWED_APPS,
        FilterMode::Deny => keys::DENIED_APPS,
    }
}

fn mismatch(key: &str, expected: &str, found: &PrefValue) -> Error {
    Error::Preferences(format!("{} should be a {}, found {:?}", key, expected, found))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_when_empty() {
        let prefs = Preferences::in_memory();
        assert_eq!(prefs.proxy_endpoint().unwrap(), None);
        assert_eq!(prefs.log_level().unwrap(), LogLevel::WARN);
        assert_eq!(prefs.filter_mode().unwrap(), FilterMode::Deny);
        assert!(!prefs.is_running().unwrap());
        assert_eq!(prefs.local_ipv4().unwrap().to_string(), "10.1.10.1/32");
        assert_eq!(
            prefs.local_ipv6().unwrap().to_string(),
            "fd00:1:fd00:1:fd00:1:fd00:1/128"
        );
    }

    #[test]
    fn test_port_zero_means_unset() {
        let prefs = Preferences::in_memory();
        prefs.save_host_port("10.0.0.5", 0).unwrap();
        assert_eq!(prefs.proxy_endpoint().unwrap(), None);

        prefs.save_host_port("", 1080).unwrap();
        assert_eq!(prefs.proxy_endpoint().unwrap(), None);

        prefs.save_host_port("10.0.0.5", 1080).unwrap();
        let endpoint = prefs.proxy_endpoint().unwrap().unwrap();
        assert_eq!(endpoint.host, "10.0.0.5");
        assert_eq!(endpoint.port, 1080);
        assert!(endpoint.credentials.is_none());
    }

    #[test]
    fn test_filter_sets_are_per_mode() {
        let prefs = Preferences::in_memory();
        prefs
            .store_filter_apps(FilterMode::Allow, &set(&["firefox"]))
            .unwrap();
        prefs
            .store_filter_apps(FilterMode::Deny, &set(&["steam", "spotify"]))
            .unwrap();

        assert_eq!(prefs.filter_apps(FilterMode::Allow).unwrap(), set(&["firefox"]));
        assert_eq!(
            prefs.filter_apps(FilterMode::Deny).unwrap(),
            set(&["spotify", "steam"])
        );
    }

    #[test]
    fn test_log_level_accepts_string_values() {
        let store = Arc::new(MemoryPreferenceStore::new());
        store
            .set(keys::LOG_LEVEL, PrefValue::String("4".to_string()))
            .unwrap();
        let prefs = Preferences::new(store);
        assert_eq!(prefs.log_level().unwrap(), LogLevel::INFO);
    }

    #[test]
    fn test_log_level_out_of_range_rejected() {
        let store = Arc::new(MemoryPreferenceStore::new());
        store
            .set(keys::LOG_LEVEL, PrefValue::Int(i64::from(i32::MAX) + 5))
            .unwrap();
        let prefs = Preferences::new(store);
        assert!(matches!(prefs.log_level(), Err(Error::Preferences(_))));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let store = Arc::new(MemoryPreferenceStore::new());
        store.set(keys::RUNNING, PrefValue::Int(1)).unwrap();
        let prefs = Preferences::new(store);
        assert!(prefs.is_running().is_err());
    }

    #[test]
    fn test_local_addresses_validate_family() {
        let prefs = Preferences::in_memory();
        let v6: IpPrefix = "fd00::2/64".parse().unwrap();
        assert!(prefs.set_local_addresses(Some(v6), None).is_err());

        let v4: IpPrefix = "10.9.0.1/24".parse().unwrap();
        prefs.set_local_addresses(Some(v4), Some(v6)).unwrap();
        assert_eq!(prefs.local_ipv4().unwrap(), v4);
        assert_eq!(prefs.local_ipv6().unwrap(), v6);
    }

    #[test]
    fn test_toml_store_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.toml");

        let prefs = Preferences::new(Arc::new(TomlPreferenceStore::new(&path)));
        prefs.save_host_port("10.0.0.5", 1080).unwrap();
        prefs.set_filter_mode(FilterMode::Allow).unwrap();
        prefs
            .store_filter_apps(FilterMode::Allow, &set(&["org.mozilla.firefox"]))
            .unwrap();
        prefs.set_running(true).unwrap();

        // A second handle on the same file sees every write
        let other = Preferences::new(Arc::new(TomlPreferenceStore::new(&path)));
        assert_eq!(other.proxy_endpoint().unwrap().unwrap().port, 1080);
        assert_eq!(other.filter_mode().unwrap(), FilterMode::Allow);
        assert_eq!(
            other.filter_apps(FilterMode::Allow).unwrap(),
            set(&["org.mozilla.firefox"])
        );
        assert!(other.is_running().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_toml_store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = TomlPreferenceStore::new(dir.path().join("nested").join("prefs.toml"));
        store
            .set(keys::PROXY_PASSWORD, PrefValue::String("secret".to_string()))
            .unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
