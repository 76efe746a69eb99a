// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - Daemon
// Owns the tunnel interface and the forwarding engine, controlled over a local API

mod api;
mod boot;
mod config;
mod config_builder;
mod controller;
mod engine;
mod monitor;
mod network_watcher;
mod permissions;
mod pidfile;
mod platform;
mod remote;
mod status;
#[cfg(test)]
mod testing;
mod wake_lock;

use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tun_proxy_common::{Preferences, TomlPreferenceStore};

use api::{create_router, AppState};
use config::{DaemonConfig, ListenerMode};
use config_builder::ConfigBuilder;
use controller::{Collaborators, ControllerSettings, TunnelController};
use engine::ProcessEngine;
use monitor::NetworkMonitor;
use platform::{
    DesktopAppResolver, LinuxPermissionGate, LinuxTunEstablisher, NetworkProbe, PermissionGate,
    ProcNetworkProbe, ResolvConfDns,
};
use remote::RemoteService;
use status::StatusPublisher;
use wake_lock::{SleepInhibitor, WakeLock};

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tun_proxy_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tun Proxy Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);
    info!("Preferences: {}", daemon_config.preferences_path.display());

    let preferences = Preferences::new(Arc::new(TomlPreferenceStore::new(
        daemon_config.preferences_path.clone(),
    )));
    let permission: Arc<dyn PermissionGate> = Arc::new(LinuxPermissionGate::new());
    let probe: Arc<dyn NetworkProbe> = Arc::new(ProcNetworkProbe::new());
    let establisher = LinuxTunEstablisher::new(
        daemon_config.interface_name.clone(),
        Arc::clone(&permission),
        Arc::clone(&probe),
    );
    let wake_lock = if daemon_config.inhibit_sleep {
        WakeLock::new(Box::new(SleepInhibitor::new()))
    } else {
        WakeLock::noop()
    };
    let status = StatusPublisher::new();

    let controller = TunnelController::new(
        Collaborators {
            engine: Arc::new(ProcessEngine::new(daemon_config.engine.settings())),
            establisher: Arc::new(establisher),
            probe: Arc::clone(&probe),
            config_builder: ConfigBuilder::new(
                preferences.clone(),
                Arc::new(DesktopAppResolver::from_environment()),
                Arc::new(ResolvConfDns::new()),
            ),
            preferences: preferences.clone(),
            status: status.clone(),
            wake_lock,
        },
        ControllerSettings {
            platform_version: daemon_config.platform_version,
            restart_cooldown: daemon_config.restart_cooldown(),
        },
    )
    .context("Failed to initialize tunnel controller")?;
    let controller = Arc::new(controller);

    let remote = Arc::new(RemoteService::new(
        Arc::clone(&controller),
        preferences.clone(),
        Arc::clone(&permission),
    ));

    // Subscribe to status events for logging
    let mut event_rx = status.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Status event: {:?}", event);
        }
    });

    if daemon_config.autostart {
        let controller = Arc::clone(&controller);
        let preferences = preferences.clone();
        let permission = Arc::clone(&permission);
        let restored = tokio::task::spawn_blocking(move || {
            boot::autostart(&controller, &preferences, permission.as_ref())
        })
        .await;
        match restored {
            Ok(Some(outcome)) => info!("Autostart: {:?}", outcome),
            Ok(None) => debug!("Autostart skipped"),
            Err(e) => warn!("Autostart task failed: {}", e),
        }
    }

    // Shutdown broadcast ends SSE streams and the network monitor
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let monitor = NetworkMonitor::new(
        Arc::clone(&probe),
        Arc::clone(&controller),
        daemon_config.monitor_interval(),
    )
    .spawn(shutdown_tx.subscribe());

    let state = Arc::new(AppState {
        controller: Arc::clone(&controller),
        remote,
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state);

    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, &daemon_config, Arc::clone(&controller), shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            let bind_address = tun_proxy_common::format_host_port(
                &daemon_config.bind_host,
                daemon_config.bind_port,
            );
            serve_tcp_http(app, &bind_address, Arc::clone(&controller), shutdown_tx).await?;
        }
    }

    if let Err(e) = monitor.await {
        warn!("Network monitor ended abnormally: {}", e);
    }

    info!("Daemon shut down");
    Ok(())
}

/// Serve on Unix domain socket (local-only)
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    controller: Arc<TunnelController>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = tun_proxy_common::default_socket_path();

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    // Set socket permissions immediately after binding
    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(controller).await;
        let _ = shutdown_broadcast.send(());
        let _ = shutdown_signal_tx.send(()).await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // `tun-proxy watch` clients hang up mid-stream
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on loopback TCP with plain HTTP
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    controller: Arc<TunnelController>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("Daemon started successfully");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown(controller).await;
            let _ = shutdown_tx.send(());
        })
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then bring the tunnel down
///
/// The running preference is kept so the next start can restore the tunnel.
async fn wait_for_shutdown(controller: Arc<TunnelController>) {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down");
        }
    }

    if let Err(e) = tokio::task::spawn_blocking(move || controller.shutdown()).await {
        error!("Tunnel shutdown failed: {}", e);
    }
    info!("Tunnel stopped");
}
