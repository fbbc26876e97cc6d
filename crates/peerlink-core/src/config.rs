use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;
use crate::types::{Endpoint, DEFAULT_SERVER_PORT};

/// File read when `PEERLINK_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "peerlink.json";

/// Client configuration: where to sign in and how to behave on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(alias = "serverIp", alias = "server_ip")]
    pub server: String,
    #[serde(alias = "serverPort", alias = "server_port")]
    pub port: u16,
    #[serde(alias = "clientName")]
    pub client_name: String,
    /// Delay before retrying a refused sign-in connection.
    #[serde(alias = "reconnectDelayMs")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on a single buffered HTTP response.
    #[serde(alias = "maxResponseBytes")]
    pub max_response_bytes: usize,
    /// Sign in as soon as the app starts.
    pub autoconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_owned(),
            port: DEFAULT_SERVER_PORT,
            client_name: default_client_name(),
            reconnect_delay_ms: 2_000,
            max_response_bytes: 1_048_576,
            autoconnect: true,
        }
    }
}

impl ClientConfig {
    /// Load from the JSON file named by `PEERLINK_CONFIG` (or
    /// `peerlink.json` when present), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PEERLINK_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path_str.clone(), source })?;
        debug!("Loaded config from {}", path_str);
        config.validate()?;
        Ok(config)
    }

    /// Apply `PEERLINK_SERVER`, `PEERLINK_PORT` and `PEERLINK_NAME` from
    /// `lookup` on top of the current values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server) = lookup("PEERLINK_SERVER").filter(|s| !s.is_empty()) {
            self.server = server;
        }
        if let Some(port) = lookup("PEERLINK_PORT") {
            self.port = parse_port(&port)?;
        }
        if let Some(name) = lookup("PEERLINK_NAME").filter(|s| !s.is_empty()) {
            self.client_name = name;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort { value: self.port.to_string() });
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.server.clone(), self.port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort { value: value.to_owned() }),
    }
}

/// `user@host`, falling back to fixed names when either is unavailable.
pub fn default_client_name() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_owned());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "host".to_owned());
    format!("{}@{}", user, host)
}
