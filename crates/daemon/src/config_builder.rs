// Tun Proxy - Config Builder
// Assembles the tunnel configuration snapshot from stored preferences

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};
use tun_proxy_common::{
    default_routes, AppFilter, Preferences, Result, TunnelConfig, FALLBACK_DNS, SESSION_NAME,
};

use crate::platform::{AppResolver, DnsProvider};

pub struct ConfigBuilder {
    preferences: Preferences,
    apps: Arc<dyn AppResolver>,
    dns: Arc<dyn DnsProvider>,
}

impl ConfigBuilder {
    pub fn new(preferences: Preferences, apps: Arc<dyn AppResolver>, dns: Arc<dyn DnsProvider>) -> Self {
        Self {
            preferences,
            apps,
            dns,
        }
    }

    /// Read preferences and produce the snapshot for one (re)start
    ///
    /// Uninstalled applications are pruned from the active filter list and the
    /// pruned list is written back.
    pub fn build(&self, mtu: u32) -> Result<TunnelConfig> {
        let filter = self.resolve_filter()?;
        let config = TunnelConfig {
            session: SESSION_NAME.to_string(),
            mtu,
            ipv4: self.preferences.local_ipv4()?,
            ipv6: self.preferences.local_ipv6()?,
            routes: default_routes(),
            dns: with_fallback(self.dns.system_dns()),
            proxy: self.preferences.proxy_endpoint()?,
            log_level: self.preferences.log_level()?,
            filter,
        };
        debug!(
            "Tunnel config: mtu={} ipv4={} ipv6={} dns={:?} proxy={}",
            config.mtu,
            config.ipv4,
            config.ipv6,
            config.dns,
            config
                .proxy
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(config)
    }

    fn resolve_filter(&self) -> Result<AppFilter> {
        let mode = self.preferences.filter_mode()?;
        let stored = self.preferences.filter_apps(mode)?;

        let (installed, missing): (BTreeSet<String>, BTreeSet<String>) = stored
            .into_iter()
            .partition(|app| self.apps.is_installed(app));

        if !missing.is_empty() {
            info!(
                "Removing {} uninstalled application(s) from {} list: {:?}",
                missing.len(),
                mode,
                missing
            );
            self.preferences.store_filter_apps(mode, &installed)?;
        }

        Ok(AppFilter {
            mode,
            apps: installed,
        })
    }
}

/// First two system resolvers, each missing slot filled from the fallback pair
fn with_fallback(system: Vec<IpAddr>) -> Vec<IpAddr> {
    FALLBACK_DNS
        .iter()
        .enumerate()
        .map(|(i, fallback)| system.get(i).copied().unwrap_or(*fallback))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApps, FakeDns};
    use tun_proxy_common::{FilterMode, IpPrefix, LogLevel, DEFAULT_LOCAL_IPV4, DEFAULT_LOCAL_IPV6};

    fn apps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn builder(prefs: &Preferences, installed: &[&str], dns: Vec<IpAddr>) -> ConfigBuilder {
        ConfigBuilder::new(
            prefs.clone(),
            Arc::new(FakeApps::new(installed)),
            Arc::new(FakeDns(dns)),
        )
    }

    #[test]
    fn test_defaults_when_nothing_stored() {
        let prefs = Preferences::in_memory();
        let config = builder(&prefs, &[], vec![]).build(10000).unwrap();

        assert_eq!(config.session, SESSION_NAME);
        assert_eq!(config.mtu, 10000);
        assert_eq!(config.ipv4, IpPrefix::host(IpAddr::V4(DEFAULT_LOCAL_IPV4)));
        assert_eq!(config.ipv6, IpPrefix::host(IpAddr::V6(DEFAULT_LOCAL_IPV6)));
        assert_eq!(config.routes, default_routes());
        assert_eq!(config.dns, FALLBACK_DNS.to_vec());
        assert_eq!(config.proxy, None);
        assert_eq!(config.log_level, LogLevel::WARN);
        assert_eq!(config.filter.mode, FilterMode::Deny);
        assert!(config.filter.apps.is_empty());
    }

    #[test]
    fn test_mtu_passed_through() {
        let prefs = Preferences::in_memory();
        let config = builder(&prefs, &[], vec![]).build(1280).unwrap();
        assert_eq!(config.mtu, 1280);
    }

    #[test]
    fn test_uninstalled_apps_pruned_and_written_back() {
        let prefs = Preferences::in_memory();
        prefs.set_filter_mode(FilterMode::Allow).unwrap();
        prefs
            .store_filter_apps(FilterMode::Allow, &apps(&["a", "b", "c"]))
            .unwrap();

        let config = builder(&prefs, &["a", "c"], vec![]).build(1500).unwrap();

        assert_eq!(config.filter.mode, FilterMode::Allow);
        assert_eq!(config.filter.apps, apps(&["a", "c"]));
        assert_eq!(prefs.filter_apps(FilterMode::Allow).unwrap(), apps(&["a", "c"]));
    }

    #[test]
    fn test_inactive_list_untouched() {
        let prefs = Preferences::in_memory();
        prefs
            .store_filter_apps(FilterMode::Allow, &apps(&["gone"]))
            .unwrap();
        prefs
            .store_filter_apps(FilterMode::Deny, &apps(&["kept", "gone"]))
            .unwrap();

        let config = builder(&prefs, &["kept"], vec![]).build(1500).unwrap();

        assert_eq!(config.filter.apps, apps(&["kept"]));
        assert_eq!(prefs.filter_apps(FilterMode::Allow).unwrap(), apps(&["gone"]));
    }

    #[test]
    fn test_system_dns_preferred() {
        let prefs = Preferences::in_memory();
        let system: Vec<IpAddr> = vec![
            "192.168.1.1".parse().unwrap(),
            "192.168.1.2".parse().unwrap(),
            "192.168.1.3".parse().unwrap(),
        ];
        let config = builder(&prefs, &[], system.clone()).build(1500).unwrap();
        assert_eq!(config.dns, system[..2].to_vec());
    }

    #[test]
    fn test_single_system_dns_gets_secondary_fallback() {
        let prefs = Preferences::in_memory();
        let primary: IpAddr = "192.168.1.1".parse().unwrap();
        let config = builder(&prefs, &[], vec![primary]).build(1500).unwrap();
        assert_eq!(config.dns, vec![primary, FALLBACK_DNS[1]]);
    }

    #[test]
    fn test_stored_proxy_and_addresses() {
        let prefs = Preferences::in_memory();
        prefs.save_host_port("10.0.0.1", 1080).unwrap();
        prefs.save_credentials("user", "secret").unwrap();
        prefs.set_log_level(LogLevel::DEBUG).unwrap();
        prefs
            .set_local_addresses(Some("10.9.0.1/24".parse().unwrap()), None)
            .unwrap();

        let config = builder(&prefs, &[], vec![]).build(1500).unwrap();

        let proxy = config.proxy.expect("proxy");
        assert_eq!(proxy.host, "10.0.0.1");
        assert_eq!(proxy.port, 1080);
        assert_eq!(proxy.user_pass(), ("user", "secret"));
        assert_eq!(config.log_level, LogLevel::DEBUG);
        assert_eq!(config.ipv4.to_string(), "10.9.0.1/24");
    }
}
