// In-process stand-ins for the host and engine collaborators

use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tun_proxy_common::{Error, LogLevel, Result, TunnelConfig};

use crate::engine::{EngineBridge, EngineContext};
use crate::network_watcher::{NetworkId, NetworkSnapshot};
use crate::platform::{
    AppResolver, DnsProvider, InterfaceEstablisher, NetworkProbe, PermissionGate,
    PermissionState, TunInterface,
};

/// Ordered record of collaborator calls shared across fakes
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

pub struct FakeApps(pub BTreeSet<String>);

impl FakeApps {
    pub fn new(installed: &[&str]) -> Self {
        FakeApps(installed.iter().map(|s| s.to_string()).collect())
    }
}

impl AppResolver for FakeApps {
    fn is_installed(&self, app_id: &str) -> bool {
        self.0.contains(app_id)
    }
}

pub struct FakeDns(pub Vec<IpAddr>);

impl DnsProvider for FakeDns {
    fn system_dns(&self) -> Vec<IpAddr> {
        self.0.clone()
    }
}

pub struct FakeGate(pub AtomicBool);

impl FakeGate {
    pub fn granted() -> Self {
        FakeGate(AtomicBool::new(true))
    }

    pub fn denied() -> Self {
        FakeGate(AtomicBool::new(false))
    }
}

impl PermissionGate for FakeGate {
    fn check(&self) -> PermissionState {
        if self.0.load(Ordering::SeqCst) {
            PermissionState::Granted
        } else {
            PermissionState::NeedsUserGrant
        }
    }
}

#[derive(Default)]
pub struct FakeProbe {
    snapshot: Mutex<NetworkSnapshot>,
    interfaces: Mutex<HashSet<String>>,
}

impl FakeProbe {
    pub fn with_default(name: &str) -> Self {
        let probe = FakeProbe::default();
        probe.set_networks(Some(name), &[name]);
        probe
    }

    pub fn set_networks(&self, default: Option<&str>, available: &[&str]) {
        *self.snapshot.lock().unwrap() = NetworkSnapshot {
            default: default.map(NetworkId::from),
            available: available.iter().map(|n| NetworkId::from(*n)).collect(),
        };
    }

    pub fn add_interface(&self, name: &str) {
        self.interfaces.lock().unwrap().insert(name.to_string());
    }

    pub fn remove_interface(&self, name: &str) {
        self.interfaces.lock().unwrap().remove(name);
    }
}

impl NetworkProbe for FakeProbe {
    fn snapshot(&self, exclude: Option<&str>) -> NetworkSnapshot {
        let mut snapshot = self.snapshot.lock().unwrap().clone();
        if let Some(exclude) = exclude {
            snapshot.available.retain(|n| n.0 != exclude);
            if snapshot.default.as_ref().map(|n| n.0.as_str()) == Some(exclude) {
                snapshot.default = None;
            }
        }
        snapshot
    }

    fn default_gateway(&self, exclude: Option<&str>) -> Option<(Ipv4Addr, NetworkId)> {
        self.default_network(exclude)
            .map(|n| (Ipv4Addr::new(192, 0, 2, 1), n))
    }

    fn interface_exists(&self, name: &str) -> bool {
        self.interfaces.lock().unwrap().contains(name)
    }
}

#[derive(Debug)]
pub struct FakeTun {
    name: String,
    fd: RawFd,
    journal: Journal,
    open: Arc<AtomicUsize>,
}

impl TunInterface for FakeTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.journal.push(format!("close:{}", self.name));
        self.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeEstablisher {
    journal: Journal,
    pub configs: Mutex<Vec<TunnelConfig>>,
    pub fail: AtomicBool,
    pub open: Arc<AtomicUsize>,
    created: AtomicUsize,
}

impl FakeEstablisher {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            configs: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            open: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
        }
    }

    pub fn established(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn open_interfaces(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<TunnelConfig> {
        self.configs.lock().unwrap().last().cloned()
    }
}

impl InterfaceEstablisher for FakeEstablisher {
    fn establish(&self, config: &TunnelConfig) -> Result<Box<dyn TunInterface>> {
        self.configs.lock().unwrap().push(config.clone());
        if self.fail.load(Ordering::SeqCst) {
            self.journal.push("establish:failed");
            return Err(Error::Establish("interface refused".to_string()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let name = format!("tun{}", n);
        self.journal.push(format!("establish:{}", name));
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTun {
            name,
            fd: 100 + n as RawFd,
            journal: self.journal.clone(),
            open: Arc::clone(&self.open),
        }))
    }
}

/// How the next `run` call behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBehavior {
    BlockUntilStopped,
    FailImmediately,
    Panic,
}

pub struct FakeEngine {
    journal: Journal,
    mtu: u32,
    behavior: Mutex<RunBehavior>,
    stopped: Mutex<bool>,
    wake: Condvar,
    next_ctx: AtomicU64,
    pub running: AtomicUsize,
    pub proxies: Mutex<Vec<(String, u16, String, String)>>,
    pub levels: Mutex<Vec<LogLevel>>,
    pub fds: Mutex<Vec<RawFd>>,
    pub run_args: Mutex<Vec<(bool, i32)>>,
}

impl FakeEngine {
    pub fn new(journal: Journal, mtu: u32) -> Self {
        Self {
            journal,
            mtu,
            behavior: Mutex::new(RunBehavior::BlockUntilStopped),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            next_ctx: AtomicU64::new(1),
            running: AtomicUsize::new(0),
            proxies: Mutex::new(Vec::new()),
            levels: Mutex::new(Vec::new()),
            fds: Mutex::new(Vec::new()),
            run_args: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: RunBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Wait until `count` workers are inside `run`
    pub fn wait_running(&self, count: usize) -> bool {
        for _ in 0..500 {
            if self.running.load(Ordering::SeqCst) == count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl EngineBridge for FakeEngine {
    fn init(&self, platform_version: u32) -> Result<EngineContext> {
        self.journal.push(format!("init:{}", platform_version));
        Ok(EngineContext::from_raw(
            self.next_ctx.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn recommended_mtu(&self) -> u32 {
        self.mtu
    }

    fn configure_proxy(
        &self,
        _ctx: EngineContext,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<()> {
        self.journal.push("configure");
        self.proxies.lock().unwrap().push((
            host.to_string(),
            port,
            username.to_string(),
            password.to_string(),
        ));
        Ok(())
    }

    fn start_run(&self, _ctx: EngineContext, level: LogLevel) -> Result<()> {
        self.journal.push("start_run");
        self.levels.lock().unwrap().push(level);
        *self.stopped.lock().unwrap() = false;
        Ok(())
    }

    fn run(&self, _ctx: EngineContext, fd: RawFd, forward_port53: bool, response_code: i32) -> Result<()> {
        self.journal.push("run:enter");
        self.fds.lock().unwrap().push(fd);
        self.run_args.lock().unwrap().push((forward_port53, response_code));

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            RunBehavior::FailImmediately => {
                self.journal.push("run:exit");
                Err(Error::Engine("engine failed".to_string()))
            }
            RunBehavior::Panic => panic!("engine crashed"),
            RunBehavior::BlockUntilStopped => {
                self.running.fetch_add(1, Ordering::SeqCst);
                let mut stopped = self.stopped.lock().unwrap();
                while !*stopped {
                    stopped = self.wake.wait(stopped).unwrap();
                }
                drop(stopped);
                self.running.fetch_sub(1, Ordering::SeqCst);
                self.journal.push("run:exit");
                Ok(())
            }
        }
    }

    fn stop(&self, _ctx: EngineContext) {
        self.journal.push("stop");
        *self.stopped.lock().unwrap() = true;
        self.wake.notify_all();
    }

    fn clear(&self, _ctx: EngineContext) {
        self.journal.push("clear");
    }

    fn teardown(&self, _ctx: EngineContext) {
        self.journal.push("teardown");
    }
}
