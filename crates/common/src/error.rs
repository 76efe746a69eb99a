// Error types for Tun Proxy

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Could not establish tunnel interface: {0}")]
    Establish(String),

    #[error("Forwarding engine error: {0}")]
    Engine(String),

    #[error("Preference store error: {0}")]
    Preferences(String),

    #[error("Invalid proxy endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error came from the host refusing to create the interface
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
