// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - Common Library
// Shared types, configuration model, and preference storage

pub mod config;
pub mod daemon_client;
pub mod error;
pub mod network;
pub mod preferences;
pub mod sse;
pub mod types;

pub use config::{
    default_routes, AppFilter, IpPrefix, LogLevel, ProxyCredentials, ProxyEndpoint,
    TunnelConfig, DEFAULT_LOCAL_IPV4, DEFAULT_LOCAL_IPV6, FALLBACK_DNS, SESSION_NAME,
};
pub use daemon_client::{
    create_daemon_client, default_socket_path, ConnectionMode, DaemonClient, DaemonClientConfig,
    SYSTEM_SOCKET_PATH,
};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address, is_valid_ipv4_endpoint, parse_host_port};
pub use preferences::{
    MemoryPreferenceStore, PrefValue, PreferenceStore, Preferences, TomlPreferenceStore,
};
pub use sse::EventListener;
pub use types::{
    FilterMode, RemoteOutcome, RemoteStartRequest, StartOutcome, StatusEvent, StopOutcome,
    TunnelState, TunnelStatusResponse,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
