// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - Daemon Client Module
// Shared daemon connection logic for the CLI

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{
    RemoteOutcome, RemoteStartRequest, StartOutcome, StopOutcome, TunnelStatusResponse,
};
use crate::FilterMode;

/// Socket of a daemon running as a system service
pub const SYSTEM_SOCKET_PATH: &str = "/run/tun-proxy/tun-proxy.sock";

/// Connection mode for client to daemon communication
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// HTTP on a loopback address
    Http,
}

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Daemon host for HTTP mode
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port for HTTP mode
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Socket path override for UnixSocket mode
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    3480
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            socket_path: None,
        }
    }
}

impl DaemonClientConfig {
    /// Base URL for API requests
    pub fn daemon_base_url(&self) -> String {
        match self.connection_mode {
            // reqwest needs some authority even when talking over a socket
            ConnectionMode::UnixSocket => "http://daemon".to_string(),
            ConnectionMode::Http => format!(
                "http://{}",
                crate::format_host_port(&self.daemon_host, self.daemon_port)
            ),
        }
    }

    /// Socket path to connect to (UnixSocket mode)
    pub fn socket_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.socket_path {
            return Ok(path.clone());
        }

        let user_socket = default_socket_path();
        if user_socket.exists() {
            return Ok(user_socket);
        }

        let system_socket = PathBuf::from(SYSTEM_SOCKET_PATH);
        if system_socket.exists() {
            return Ok(system_socket);
        }

        // Neither exists yet, the daemon will create the user one
        Ok(user_socket)
    }
}

/// Socket the daemon binds by default: `<runtime_dir>/tun-proxy/tun-proxy.sock`
///
/// Falls back to the system socket when there is no user runtime directory (system daemon).
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join("tun-proxy").join("tun-proxy.sock"))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_SOCKET_PATH))
}

/// Create an HTTP client configured to connect to the daemon
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    let mut client_builder = Client::builder();

    if config.connection_mode == ConnectionMode::UnixSocket {
        client_builder = client_builder.unix_socket(config.socket_path()?);
    }

    client_builder
        .build()
        .context("Failed to build daemon client")
}

/// Thin typed wrapper over the daemon REST API
pub struct DaemonClient {
    config: DaemonClientConfig,
    client: Client,
}

impl DaemonClient {
    pub fn new(config: DaemonClientConfig) -> Result<Self> {
        let client = create_daemon_client(&config)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &DaemonClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.daemon_base_url(), path)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: Option<&B>) -> Result<T> {
        let mut request = self.client.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Failed to reach the daemon. Is tun-proxy-daemon running?")?;
        decode(resp).await
    }

    pub async fn status(&self) -> Result<TunnelStatusResponse> {
        let resp = self
            .client
            .get(self.url("/api/status"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Failed to reach the daemon. Is tun-proxy-daemon running?")?;
        decode(resp).await
    }

    pub async fn start(&self) -> Result<StartOutcome> {
        self.post::<(), _>("/api/tunnel/start", None).await
    }

    pub async fn stop(&self) -> Result<StopOutcome> {
        self.post::<(), _>("/api/tunnel/stop", None).await
    }

    /// Store the endpoint and application set for `mode`, then start
    pub async fn remote_start(
        &self,
        mode: FilterMode,
        host: &str,
        port: u16,
        apps: Vec<String>,
    ) -> Result<RemoteOutcome> {
        let path = match mode {
            FilterMode::Allow => "/api/remote/start-allowed",
            FilterMode::Deny => "/api/remote/start-denied",
        };
        let body = RemoteStartRequest {
            host: host.to_string(),
            port,
            apps,
        };
        self.post(path, Some(&body)).await
    }

    pub async fn remote_stop(&self) -> Result<RemoteOutcome> {
        self.post::<(), _>("/api/remote/stop", None).await
    }
}

/// Start/stop can block while the forwarding worker drains
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        anyhow::bail!("Daemon returned {}: {}", status, message);
    }
    resp.json::<T>()
        .await
        .context("Failed to decode daemon response")
}
