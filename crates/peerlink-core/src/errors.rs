use thiserror::Error;

use crate::types::ConnectionState;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Server address must not be empty")]
    EmptyServer,

    #[error("Client name must not be empty")]
    EmptyClientName,

    #[error("Session already active ({state})")]
    AlreadyActive { state: ConnectionState },

    #[error("Not signed in to the signaling server ({state})")]
    NotConnected { state: ConnectionState },

    #[error("A message is already in flight on the command channel")]
    SendInFlight,

    #[error("Address resolution failed for {host}: {reason}")]
    ResolveFailed { host: String, reason: String },

    #[error("Connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("Signaling task has shut down")]
    SessionClosed,
}

/// Failures recognised while framing an HTTP response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("No Content-Length header in response")]
    MissingContentLength,

    #[error("Invalid Content-Length value: {value:?}")]
    InvalidContentLength { value: String },

    #[error("Malformed status line: {line:?}")]
    MalformedStatus { line: String },

    #[error("Server returned status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Missing or invalid Pragma peer id: {value:?}")]
    InvalidPragma { value: Option<String> },

    #[error("Response exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port {value:?}: must be in 1..=65535")]
    InvalidPort { value: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
