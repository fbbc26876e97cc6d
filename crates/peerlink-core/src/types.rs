use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Port used when the caller does not name one (`0`).
pub const DEFAULT_SERVER_PORT: u16 = 8888;

// MARK: - PeerId

/// Server-assigned peer identifier.
///
/// The server is authoritative for these; the client never invents one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(PeerId)
    }
}

// MARK: - Endpoint

/// Host (name or literal IP) and port of the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// A port of `0` selects [`DEFAULT_SERVER_PORT`].
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let port = if port == 0 { DEFAULT_SERVER_PORT } else { port };
        Self { host: host.into(), port }
    }

    /// The literal IP address, if `host` is one (no resolution needed).
    pub fn literal_ip(&self) -> Option<IpAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.parse().ok()
    }

    /// Socket address for a literal-IP endpoint.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.literal_ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

// MARK: - ConnectionState

/// Lifecycle of a signaling session. Exactly one value at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Resolving,
    SigningIn,
    Connected,
    SigningOut,
    /// Sign-out requested while the command channel was busy; it is sent
    /// as soon as the in-flight exchange completes.
    SigningOutPending,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected      => "disconnected",
            Self::Resolving         => "resolving",
            Self::SigningIn         => "signing in",
            Self::Connected         => "connected",
            Self::SigningOut        => "signing out",
            Self::SigningOutPending => "signing out (pending)",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// MARK: - Channel

/// The two sockets a session keeps against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Short-lived: sign-in, relay, sign-out. One request per connection.
    Command,
    /// Long-lived hanging `GET /wait`.
    Notify,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Notify => write!(f, "notify"),
        }
    }
}
