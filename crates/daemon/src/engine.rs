// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - Engine Bridge
// Boundary to the packet-forwarding engine that reads the tunnel descriptor

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};
use tun_proxy_common::{format_host_port, Error, LogLevel, Result};

/// Handle to one engine instance
///
/// Created once per controller lifetime by [`EngineBridge::init`] and destroyed by
/// [`EngineBridge::teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineContext(u64);

impl EngineContext {
    pub fn from_raw(id: u64) -> Self {
        EngineContext(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// The packet-forwarding engine as seen by the controller
///
/// `run` blocks its calling thread until `stop` is called from another thread
/// or the engine fails.
pub trait EngineBridge: Send + Sync {
    fn init(&self, platform_version: u32) -> Result<EngineContext>;

    fn recommended_mtu(&self) -> u32;

    fn configure_proxy(
        &self,
        ctx: EngineContext,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<()>;

    fn start_run(&self, ctx: EngineContext, level: LogLevel) -> Result<()>;

    fn run(&self, ctx: EngineContext, fd: RawFd, forward_port53: bool, response_code: i32) -> Result<()>;

    fn stop(&self, ctx: EngineContext);

    fn clear(&self, ctx: EngineContext);

    fn teardown(&self, ctx: EngineContext);
}

pub const DEFAULT_ENGINE_MTU: u32 = 10000;

/// Placeholders expanded in the engine argument template
const FD_PLACEHOLDER: &str = "{fd}";
const PROXY_PLACEHOLDER: &str = "{proxy}";
const LOGLEVEL_PLACEHOLDER: &str = "{loglevel}";
const MTU_PLACEHOLDER: &str = "{mtu}";

pub fn default_engine_args() -> Vec<String> {
    [
        "-device",
        "fd://{fd}",
        "-proxy",
        "{proxy}",
        "-loglevel",
        "{loglevel}",
        "-mtu",
        "{mtu}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// How to launch the external forwarder
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub mtu: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: PathBuf::from("tun2socks"),
            args: default_engine_args(),
            mtu: DEFAULT_ENGINE_MTU,
        }
    }
}

#[derive(Clone)]
struct ProxyTarget {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl ProxyTarget {
    fn url(&self) -> String {
        let endpoint = format_host_port(&self.host, self.port);
        if self.username.is_empty() {
            format!("socks5://{}", endpoint)
        } else {
            format!("socks5://{}:{}@{}", self.username, self.password, endpoint)
        }
    }
}

#[derive(Default)]
struct RunSlot {
    proxy: Option<ProxyTarget>,
    level: LogLevel,
    child: Option<u32>,
    stop_requested: bool,
}

/// Engine backed by an external tun2socks-style process
///
/// The tunnel descriptor is inherited by the child; `run` waits for it to exit.
pub struct ProcessEngine {
    settings: EngineSettings,
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, RunSlot>>,
    wait_exited: fn(u32) -> io::Result<()>,
}

impl ProcessEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
            wait_exited,
        }
    }

    /// Forget the running child; returns whether a stop was requested
    fn unpublish_child(&self, ctx: EngineContext) -> bool {
        match self.slots().get_mut(&ctx.0) {
            Some(slot) => {
                slot.child = None;
                slot.stop_requested
            }
            None => true,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u64, RunSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expand_args(&self, fd: RawFd, proxy: &ProxyTarget, level: LogLevel) -> Vec<String> {
        let fd = fd.to_string();
        let proxy = proxy.url();
        let mtu = self.settings.mtu.to_string();
        self.settings
            .args
            .iter()
            .map(|arg| {
                arg.replace(FD_PLACEHOLDER, &fd)
                    .replace(PROXY_PLACEHOLDER, &proxy)
                    .replace(LOGLEVEL_PLACEHOLDER, level.engine_name())
                    .replace(MTU_PLACEHOLDER, &mtu)
            })
            .collect()
    }
}

impl EngineBridge for ProcessEngine {
    fn init(&self, platform_version: u32) -> Result<EngineContext> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots().insert(id, RunSlot::default());
        info!(
            "Engine context {} created (platform version {}, forwarder {})",
            id,
            platform_version,
            self.settings.command.display()
        );
        Ok(EngineContext(id))
    }

    fn recommended_mtu(&self) -> u32 {
        self.settings.mtu
    }

    fn configure_proxy(
        &self,
        ctx: EngineContext,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(&ctx.0)
            .ok_or_else(|| Error::Engine(format!("unknown {}", ctx)))?;
        slot.proxy = Some(ProxyTarget {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        });
        debug!("{}: SOCKS5 proxy {}", ctx, format_host_port(host, port));
        Ok(())
    }

    fn start_run(&self, ctx: EngineContext, level: LogLevel) -> Result<()> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(&ctx.0)
            .ok_or_else(|| Error::Engine(format!("unknown {}", ctx)))?;
        slot.level = level;
        slot.stop_requested = false;
        Ok(())
    }

    fn run(&self, ctx: EngineContext, fd: RawFd, forward_port53: bool, response_code: i32) -> Result<()> {
        let args = {
            let slots = self.slots();
            let slot = slots
                .get(&ctx.0)
                .ok_or_else(|| Error::Engine(format!("unknown {}", ctx)))?;
            if slot.stop_requested {
                debug!("{}: stop requested before run, not launching forwarder", ctx);
                return Ok(());
            }
            let proxy = slot
                .proxy
                .as_ref()
                .ok_or_else(|| Error::Engine("proxy not configured".to_string()))?;
            self.expand_args(fd, proxy, slot.level)
        };

        // The forwarder resolves DNS through the proxy itself
        debug!(
            "{}: forward_port53={} response_code={}",
            ctx, forward_port53, response_code
        );

        let mut command = Command::new(&self.settings.command);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        // SAFETY: only async-signal-safe fcntl calls run between fork and exec
        unsafe {
            command.pre_exec(move || {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Engine(format!(
                "failed to launch {}: {}",
                self.settings.command.display(),
                e
            ))
        })?;
        let pid = child.id();
        info!("{}: forwarder running with PID {}", ctx, pid);

        let stop_requested = {
            let mut slots = self.slots();
            match slots.get_mut(&ctx.0) {
                Some(slot) => {
                    slot.child = Some(pid);
                    slot.stop_requested
                }
                None => true,
            }
        };
        if stop_requested {
            terminate(pid);
        }

        let waited = (self.wait_exited)(pid);
        let stopped = self.unpublish_child(ctx);

        // Reap only after the PID is unpublished so stop() never signals a reused PID
        if let Err(e) = waited {
            warn!("{}: lost track of forwarder {}: {}", ctx, pid, e);
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Engine(format!("waiting for forwarder: {}", e)));
        }
        let status = child
            .wait()
            .map_err(|e| Error::Engine(format!("reaping forwarder: {}", e)))?;

        if status.success() || stopped {
            info!("{}: forwarder exited ({})", ctx, status);
            Ok(())
        } else {
            Err(Error::Engine(format!("forwarder exited with {}", status)))
        }
    }

    fn stop(&self, ctx: EngineContext) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&ctx.0) {
            slot.stop_requested = true;
            if let Some(pid) = slot.child {
                debug!("{}: terminating forwarder {}", ctx, pid);
                terminate(pid);
            }
        }
    }

    fn clear(&self, ctx: EngineContext) {
        if let Some(slot) = self.slots().get_mut(&ctx.0) {
            slot.child = None;
            slot.stop_requested = false;
        }
    }

    fn teardown(&self, ctx: EngineContext) {
        if let Some(slot) = self.slots().remove(&ctx.0) {
            if let Some(pid) = slot.child {
                warn!("{}: torn down with forwarder {} still running", ctx, pid);
                terminate(pid);
            }
        }
        info!("Engine context {} destroyed", ctx.0);
    }
}

fn terminate(pid: u32) {
    // SAFETY: plain signal delivery to a child we have not reaped yet
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!("kill({}) failed: {}", pid, io::Error::last_os_error());
    }
}

/// Block until the child exits without reaping it
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data; waitid fills it in
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
