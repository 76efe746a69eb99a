// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - Tunnel Lifecycle Controller
// Owns the virtual interface, the forwarding worker and the network binding

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use tun_proxy_common::{
    Error, LogLevel, Preferences, ProxyEndpoint, Result, StartOutcome, StopOutcome,
    TunnelState, TunnelStatusResponse,
};

use crate::config_builder::ConfigBuilder;
use crate::engine::{EngineBridge, EngineContext};
use crate::network_watcher::{NetworkEvent, NetworkWatcher};
use crate::platform::{InterfaceEstablisher, NetworkProbe, TunInterface};
use crate::status::StatusPublisher;
use crate::wake_lock::{WakeLock, WakeLockGuard};

/// DNS on port 53 is handled by the proxy, not answered locally
pub const FORWARD_PORT_53: bool = false;
/// Response code for locally refused lookups (NXDOMAIN)
pub const DNS_RESPONSE_CODE: i32 = 3;

const WORKER_THREAD_NAME: &str = "tun-proxy-worker";

/// Everything the controller talks to
pub struct Collaborators {
    pub engine: Arc<dyn EngineBridge>,
    pub establisher: Arc<dyn InterfaceEstablisher>,
    pub probe: Arc<dyn NetworkProbe>,
    pub config_builder: ConfigBuilder,
    pub preferences: Preferences,
    pub status: StatusPublisher,
    pub wake_lock: WakeLock,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub platform_version: u32,
    pub restart_cooldown: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            platform_version: 1,
            restart_cooldown: Duration::ZERO,
        }
    }
}

enum WorkerExit {
    Finished,
    Failed(String),
    Panicked,
}

/// Sent by the worker as its last act, returning the interface it borrowed
struct WorkerDone {
    interface: Box<dyn TunInterface>,
    exit: WorkerExit,
}

struct Worker {
    thread: JoinHandle<()>,
    done: Receiver<WorkerDone>,
}

struct Inner {
    state: TunnelState,
    /// Held here while idle; moved into the worker while it runs
    interface: Option<Box<dyn TunInterface>>,
    worker: Option<Worker>,
    watcher: NetworkWatcher,
    wake_guard: Option<WakeLockGuard>,
}

/// Single owner of the tunnel lifecycle
///
/// Transitions are serialized by one lock. User commands arriving while a
/// transition is in progress are ignored; internal triggers wait for it.
pub struct TunnelController {
    engine: Arc<dyn EngineBridge>,
    establisher: Arc<dyn InterfaceEstablisher>,
    probe: Arc<dyn NetworkProbe>,
    config_builder: ConfigBuilder,
    preferences: Preferences,
    status: StatusPublisher,
    wake_lock: WakeLock,
    context: EngineContext,
    inner: Mutex<Inner>,
    state: AtomicU8,
    running: AtomicBool,
    busy: AtomicBool,
    started_remotely: AtomicBool,
    worker_active: Arc<AtomicBool>,
    interface_name: RwLock<Option<String>>,
}

struct BusyGuard<'a> {
    controller: &'a TunnelController,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.controller.set_busy(false);
    }
}

impl TunnelController {
    /// Creates the engine context; it lives until the controller is dropped
    pub fn new(collaborators: Collaborators, settings: ControllerSettings) -> Result<Self> {
        let Collaborators {
            engine,
            establisher,
            probe,
            config_builder,
            preferences,
            status,
            wake_lock,
        } = collaborators;

        let context = engine.init(settings.platform_version)?;
        info!("Tunnel controller ready ({})", context);

        Ok(Self {
            engine,
            establisher,
            probe,
            config_builder,
            preferences,
            status,
            wake_lock,
            context,
            inner: Mutex::new(Inner {
                state: TunnelState::Stopped,
                interface: None,
                worker: None,
                watcher: NetworkWatcher::new(settings.restart_cooldown),
                wake_guard: None,
            }),
            state: AtomicU8::new(encode_state(TunnelState::Stopped)),
            running: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            started_remotely: AtomicBool::new(false),
            worker_active: Arc::new(AtomicBool::new(false)),
            interface_name: RwLock::new(None),
        })
    }

    pub fn state(&self) -> TunnelState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn interface_name(&self) -> Option<String> {
        self.interface_name
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn status(&self) -> TunnelStatusResponse {
        TunnelStatusResponse {
            state: self.state(),
            running: self.is_running(),
            busy: self.is_busy(),
            started_remotely: self.started_remotely.load(Ordering::Acquire),
            worker_active: self.worker_active.load(Ordering::Acquire),
            interface: self.interface_name(),
        }
    }

    pub fn status_publisher(&self) -> &StatusPublisher {
        &self.status
    }

    /// Bring the tunnel up; a no-op unless stopped
    pub fn start(&self) -> Result<StartOutcome> {
        if self.is_busy() {
            info!("Start ignored, another transition is in progress");
            return Ok(StartOutcome::Ignored);
        }
        let mut inner = self.lock_inner();
        if inner.state != TunnelState::Stopped {
            debug!("Start requested while {}", inner.state);
            return Ok(StartOutcome::AlreadyRunning);
        }
        let _busy = self.enter_busy();
        self.start_locked(&mut inner)
    }

    /// Same as [`restart`](Self::restart), flagging the tunnel as started by a remote caller
    pub fn restart_remote(&self) -> Result<StartOutcome> {
        let outcome = self.restart()?;
        if matches!(outcome, StartOutcome::Started | StartOutcome::Idle) {
            self.set_started_remotely(true);
        }
        Ok(outcome)
    }

    /// Tear the tunnel down; a no-op when stopped
    pub fn stop(&self) -> Result<StopOutcome> {
        if self.is_busy() {
            info!("Stop ignored, another transition is in progress");
            return Ok(StopOutcome::Ignored);
        }
        let mut inner = self.lock_inner();
        if inner.state == TunnelState::Stopped {
            debug!("Stop requested while already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        }
        let _busy = self.enter_busy();
        Ok(self.stop_locked(&mut inner, true))
    }

    /// Apply the current preferences: restart when up, start when stopped
    pub fn restart(&self) -> Result<StartOutcome> {
        if self.is_busy() {
            info!("Restart ignored, another transition is in progress");
            return Ok(StartOutcome::Ignored);
        }
        let mut inner = self.lock_inner();
        let _busy = self.enter_busy();
        if inner.state != TunnelState::Stopped {
            info!("Restarting tunnel to apply new settings");
            self.stop_locked(&mut inner, true);
        }
        self.start_locked(&mut inner)
    }

    /// The host withdrew permission for the tunnel
    pub fn revoke(&self) {
        let mut inner = self.lock_inner();
        if inner.state == TunnelState::Stopped {
            return;
        }
        warn!("Tunnel permission revoked, stopping");
        let _busy = self.enter_busy();
        self.stop_locked(&mut inner, true);
    }

    /// The interface `name` disappeared underneath us
    pub fn interface_gone(&self, name: &str) {
        let mut inner = self.lock_inner();
        if inner.state != TunnelState::Running || self.interface_name().as_deref() != Some(name) {
            return;
        }
        warn!("Interface {} was removed externally, stopping", name);
        let _busy = self.enter_busy();
        self.stop_locked(&mut inner, true);
    }

    /// Feed a host network notification; restarts the tunnel when bound network changes
    pub fn handle_network_event(&self, event: &NetworkEvent) {
        let mut inner = self.lock_inner();
        if inner.state != TunnelState::Running {
            return;
        }
        let Some(reason) = inner.watcher.on_event(event) else {
            return;
        };

        info!("Restarting tunnel: {}", reason);
        let _busy = self.enter_busy();
        self.stop_locked(&mut inner, true);
        if let Err(e) = self.start_locked(&mut inner) {
            warn!("Tunnel not restarted after {}: {}", reason, e);
        }
    }

    /// Stop for daemon exit, keeping the persisted running flag for the next boot
    pub fn shutdown(&self) {
        let mut inner = self.lock_inner();
        if inner.state == TunnelState::Stopped {
            return;
        }
        info!("Stopping tunnel for shutdown");
        let _busy = self.enter_busy();
        self.stop_locked(&mut inner, false);
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<StartOutcome> {
        self.set_state(inner, TunnelState::Starting);
        match self.bring_up(inner) {
            Ok(outcome) => {
                self.set_state(inner, TunnelState::Running);
                self.set_running(true);
                Ok(outcome)
            }
            Err(e) => {
                error!("Failed to start tunnel: {}", e);
                self.status.error(e.to_string());
                self.set_state(inner, TunnelState::Stopped);
                Err(e)
            }
        }
    }

    fn bring_up(&self, inner: &mut Inner) -> Result<StartOutcome> {
        let config = self.config_builder.build(self.engine.recommended_mtu())?;
        let interface = self.establisher.establish(&config)?;
        let name = interface.name().to_string();

        let outcome = match &config.proxy {
            None => {
                info!("No proxy configured, tunnel {} is idle", name);
                inner.interface = Some(interface);
                StartOutcome::Idle
            }
            Some(proxy) => {
                let worker = self.launch_worker(interface, proxy, config.log_level)?;
                inner.worker = Some(worker);
                info!("Tunnel {} forwarding to {}", name, proxy);
                StartOutcome::Started
            }
        };

        inner.watcher.arm(self.probe.default_network(Some(&name)));
        inner.wake_guard = Some(self.wake_lock.acquire());
        *self
            .interface_name
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(name);
        Ok(outcome)
    }

    fn launch_worker(
        &self,
        interface: Box<dyn TunInterface>,
        proxy: &ProxyEndpoint,
        level: LogLevel,
    ) -> Result<Worker> {
        let (username, password) = proxy.user_pass();
        if let Err(e) = self
            .engine
            .configure_proxy(self.context, &proxy.host, proxy.port, username, password)
        {
            close_quietly(interface);
            return Err(e);
        }

        self.persist_running(true);
        if let Err(e) = self.engine.start_run(self.context, level) {
            self.persist_running(false);
            close_quietly(interface);
            return Err(e);
        }

        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let engine = Arc::clone(&self.engine);
        let ctx = self.context;
        let active = Arc::clone(&self.worker_active);
        active.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let fd = interface.raw_fd();
                debug!("Worker running on {} (fd {})", interface.name(), fd);

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    engine.run(ctx, fd, FORWARD_PORT_53, DNS_RESPONSE_CODE)
                }));
                let exit = match result {
                    Ok(Ok(())) => {
                        info!("Tunnel worker exited");
                        WorkerExit::Finished
                    }
                    Ok(Err(e)) => {
                        error!("Tunnel worker failed: {}", e);
                        WorkerExit::Failed(e.to_string())
                    }
                    Err(_) => {
                        error!("Tunnel worker panicked");
                        WorkerExit::Panicked
                    }
                };

                active.store(false, Ordering::Release);
                if done_tx.send(WorkerDone { interface, exit }).is_err() {
                    warn!("Controller gone, dropping tunnel interface");
                }
            });

        match spawned {
            Ok(thread) => Ok(Worker {
                thread,
                done: done_rx,
            }),
            Err(e) => {
                self.worker_active.store(false, Ordering::Release);
                self.engine.clear(self.context);
                self.persist_running(false);
                Err(Error::Io(e))
            }
        }
    }

    /// Always completes; close failures are published, not returned
    fn stop_locked(&self, inner: &mut Inner, forget_running: bool) -> StopOutcome {
        self.set_state(inner, TunnelState::Stopping);

        if let Some(worker) = inner.worker.take() {
            self.engine.stop(self.context);
            match worker.done.recv() {
                Ok(done) => {
                    match done.exit {
                        WorkerExit::Finished => {}
                        WorkerExit::Failed(e) => debug!("Worker had failed earlier: {}", e),
                        WorkerExit::Panicked => debug!("Worker had panicked earlier"),
                    }
                    inner.interface = Some(done.interface);
                }
                Err(_) => error!("Worker ended without returning the interface"),
            }
            if worker.thread.join().is_err() {
                error!("Worker thread panicked outside the engine");
            }
            self.engine.clear(self.context);
        }

        if forget_running {
            self.persist_running(false);
        }

        if let Some(interface) = inner.interface.take() {
            let name = interface.name().to_string();
            match interface.close() {
                Ok(()) => info!("Tunnel interface {} closed", name),
                Err(e) => {
                    error!("Failed to close interface {}: {}", name, e);
                    self.status.error(e.to_string());
                }
            }
        }

        inner.watcher.disarm();
        inner.wake_guard = None;
        *self
            .interface_name
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.set_running(false);
        self.set_started_remotely(false);
        self.set_state(inner, TunnelState::Stopped);
        StopOutcome::Stopped
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter_busy(&self) -> BusyGuard<'_> {
        self.set_busy(true);
        BusyGuard { controller: self }
    }

    fn set_state(&self, inner: &mut Inner, state: TunnelState) {
        if inner.state == state {
            return;
        }
        debug!("Tunnel state {} -> {}", inner.state, state);
        inner.state = state;
        self.state.store(encode_state(state), Ordering::Release);
        self.status.state(state);
    }

    fn set_running(&self, running: bool) {
        if self.running.swap(running, Ordering::AcqRel) != running {
            self.status.running(running);
        }
    }

    fn set_busy(&self, busy: bool) {
        if self.busy.swap(busy, Ordering::AcqRel) != busy {
            self.status.busy(busy);
        }
    }

    fn set_started_remotely(&self, remote: bool) {
        if self.started_remotely.swap(remote, Ordering::AcqRel) != remote {
            self.status.started_remotely(remote);
        }
    }

    fn persist_running(&self, running: bool) {
        if let Err(e) = self.preferences.set_running(running) {
            warn!("Failed to persist running={}: {}", running, e);
        }
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        let mut inner = self.lock_inner();
        if inner.state != TunnelState::Stopped {
            self.stop_locked(&mut inner, false);
        }
        drop(inner);
        self.engine.teardown(self.context);
    }
}

fn close_quietly(interface: Box<dyn TunInterface>) {
    let name = interface.name().to_string();
    if let Err(e) = interface.close() {
        warn!("Failed to close interface {}: {}", name, e);
    }
}

fn encode_state(state: TunnelState) -> u8 {
    match state {
        TunnelState::Stopped => 0,
        TunnelState::Starting => 1,
        TunnelState::Running => 2,
        TunnelState::Stopping => 3,
    }
}

fn decode_state(raw: u8) -> TunnelState {
    match raw {
        1 => TunnelState::Starting,
        2 => TunnelState::Running,
        3 => TunnelState::Stopping,
        _ => TunnelState::Stopped,
    }
}
