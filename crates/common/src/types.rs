// Common types for Tun Proxy

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle state of the tunnel controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl TunnelState {
    /// Check if the state represents a transitional state
    pub fn is_in_progress(&self) -> bool {
        matches!(self, TunnelState::Starting | TunnelState::Stopping)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Per-application filter mode
///
/// `Allow` routes only the listed applications through the tunnel,
/// `Deny` routes everything except the listed applications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterMode {
    Allow,
    #[default]
    Deny,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Allow => "ALLOW",
            FilterMode::Deny => "DENY",
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALLOW" => Ok(FilterMode::Allow),
            // DISALLOW is the name older preference files used
            "DENY" | "DISALLOW" => Ok(FilterMode::Deny),
            other => Err(Error::Config(format!("unknown filter mode '{}'", other))),
        }
    }
}

/// State-change notifications pushed to status subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Controller state machine moved
    StateChanged {
        state: TunnelState,
        timestamp: DateTime<Utc>,
    },

    /// Publicly observable running bit changed
    Running {
        running: bool,
        timestamp: DateTime<Utc>,
    },

    /// A start/stop operation began or finished
    Busy {
        busy: bool,
        timestamp: DateTime<Utc>,
    },

    /// The tunnel was (or is no longer) started by a remote caller
    StartedRemotely {
        started_remotely: bool,
        timestamp: DateTime<Utc>,
    },

    /// A start attempt failed
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Keep-alive for event streams
    Heartbeat { timestamp: DateTime<Utc> },
}

/// Result of a `start()` request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    /// Interface established and forwarding worker launched
    Started,
    /// Interface established without a proxy endpoint, no worker running
    Idle,
    /// Tunnel was already up
    AlreadyRunning,
    /// Another start/stop was in progress
    Ignored,
}

/// Result of a `stop()` request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
    Ignored,
}

/// Completion reported to remote callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteOutcome {
    Success,
    PermissionDenied,
    Failed { error: String },
}

/// Snapshot of the controller returned by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelStatusResponse {
    pub state: TunnelState,
    pub running: bool,
    pub busy: bool,
    pub started_remotely: bool,
    pub worker_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Body of the remote start endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStartRequest {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub apps: Vec<String>,
}
