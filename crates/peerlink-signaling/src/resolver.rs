//! Server address resolution.
//!
//! Literal IPs are returned as-is; hostnames go through the system resolver
//! with IPv4 results preferred.

use std::net::SocketAddr;

use peerlink_core::{Endpoint, SignalingError};
use tracing::debug;

pub async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, SignalingError> {
    if let Some(addr) = endpoint.socket_addr() {
        return Ok(addr);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| SignalingError::ResolveFailed {
            host: endpoint.host.clone(),
            reason: e.to_string(),
        })?
        .collect();
    debug!("Resolved {} to {:?}", endpoint, addrs);

    pick_address(&addrs).ok_or_else(|| SignalingError::ResolveFailed {
        host: endpoint.host.clone(),
        reason: "no addresses returned".to_owned(),
    })
}

/// First IPv4 address, else the first address of any family.
pub fn pick_address(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    addrs.iter().find(|a| a.is_ipv4()).or_else(|| addrs.first()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_ipv4() {
        let v6: SocketAddr = "[::1]:8888".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:8888".parse().unwrap();
        assert_eq!(pick_address(&[v6, v4]), Some(v4));
        assert_eq!(pick_address(&[v6]), Some(v6));
        assert_eq!(pick_address(&[]), None);
    }

    #[tokio::test]
    async fn literal_ip_skips_lookup() {
        let addr = resolve(&Endpoint::new("10.1.2.3", 9000)).await.unwrap();
        assert_eq!(addr, "10.1.2.3:9000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let addr = resolve(&Endpoint::new("localhost", 8888)).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8888);
    }
}
