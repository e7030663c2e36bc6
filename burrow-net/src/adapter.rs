//! The tunnel adapter boundary
//!
//! The adapter driver is an external capability: create an adapter, push a
//! configuration, flip its state, query it back. This module defines the
//! trait surface the orchestrator drives, the wire-level [`AdapterConfig`]
//! derived from a resolved [`Config`], and the reflection path that carries
//! live per-peer counters back into a `Config` for display.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use ipnet::IpNet;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use burrow_conf::{Config, Endpoint, Key};

use crate::error::{Error, Result};
use crate::types::InterfaceLuid;

/// The adapter kind passed to the driver when creating tunnels.
pub const TUNNEL_TYPE: &str = "Burrow";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Down,
    Up,
}

/// Peer entry in the driver-facing configuration. Endpoints are literal
/// socket addresses here; resolution happened earlier.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterPeer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpNet>,

    /// Populated only when reflecting a live adapter.
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
}

/// The flattened configuration handed to the driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdapterConfig {
    pub private_key: Key,
    pub listen_port: Option<u16>,
    pub peers: Vec<AdapterPeer>,
}

/// A live tunnel adapter.
pub trait Adapter: Send + Sync {
    fn luid(&self) -> InterfaceLuid;

    fn set_logging(&self, enabled: bool) -> Result<()>;

    fn set_configuration(&self, config: &AdapterConfig) -> Result<()>;

    fn set_state(&self, state: AdapterState) -> Result<()>;

    /// Read back the current configuration including per-peer counters.
    fn configuration(&self) -> Result<AdapterConfig>;

    /// Release the adapter. Idempotent.
    fn close(&self);
}

/// Creates adapters. The orchestrator retries `create` under its own
/// backoff policy at boot.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        tunnel_type: &str,
        requested_guid: Uuid,
    ) -> Result<Arc<dyn Adapter>>;
}

/// Derive a stable adapter identity from the tunnel name, so recreating a
/// tunnel reuses the same interface identity across restarts.
pub fn deterministic_guid(name: &str) -> Uuid {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Flatten a resolved [`Config`] into the driver-facing form.
///
/// Fails if any peer endpoint still names a host: the orchestrator only
/// derives after endpoint resolution, so an unresolved host here is a logic
/// error, not a user error.
pub fn derive_adapter_config(config: &Config) -> Result<AdapterConfig> {
    let mut peers = Vec::with_capacity(config.peers.len());
    for peer in &config.peers {
        let endpoint = match &peer.endpoint {
            Some(endpoint) if !endpoint.host.is_empty() => {
                let addr = endpoint
                    .address()
                    .ok_or_else(|| Error::UnresolvedEndpoint(endpoint.host.clone()))?;
                Some(SocketAddr::new(addr, endpoint.port))
            }
            _ => None,
        };
        peers.push(AdapterPeer {
            public_key: peer.public_key,
            preshared_key: peer.preshared_key,
            endpoint,
            persistent_keepalive: peer.persistent_keepalive,
            allowed_ips: peer.allowed_ips.clone(),
            tx_bytes: 0,
            rx_bytes: 0,
            last_handshake: None,
        });
    }
    Ok(AdapterConfig {
        private_key: config.interface.private_key,
        listen_port: config.interface.listen_port,
        peers,
    })
}

/// Reflect a live adapter configuration back into a [`Config`], keeping the
/// declarative interface settings (addresses, DNS, scripts) from
/// `existing` and taking keys, endpoints, and runtime counters from the
/// adapter.
pub fn reflect_configuration(adapter: &AdapterConfig, existing: &Config) -> Config {
    let mut config = Config {
        name: existing.name.clone(),
        interface: existing.interface.clone(),
        peers: Vec::with_capacity(adapter.peers.len()),
    };
    config.interface.private_key = adapter.private_key;
    config.interface.listen_port = adapter.listen_port;
    for peer in &adapter.peers {
        config.peers.push(burrow_conf::Peer {
            public_key: peer.public_key,
            preshared_key: peer.preshared_key,
            allowed_ips: peer.allowed_ips.clone(),
            endpoint: peer.endpoint.map(|sa| Endpoint {
                host: sa.ip().to_string(),
                port: sa.port(),
            }),
            persistent_keepalive: peer.persistent_keepalive,
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
            last_handshake: peer.last_handshake,
        });
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_conf::{Interface, Peer, KEY_LENGTH};
    use std::net::{IpAddr, Ipv4Addr};

    fn resolved_config() -> Config {
        Config {
            name: "office".into(),
            interface: Interface {
                private_key: Key::new([1; KEY_LENGTH]),
                listen_port: Some(51820),
                ..Default::default()
            },
            peers: vec![Peer {
                public_key: Key::new([2; KEY_LENGTH]),
                endpoint: Some(Endpoint {
                    host: "192.0.2.1".into(),
                    port: 51820,
                }),
                allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
                persistent_keepalive: 25,
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_deterministic_guid_is_stable() {
        assert_eq!(deterministic_guid("office"), deterministic_guid("office"));
        assert_ne!(deterministic_guid("office"), deterministic_guid("home"));
    }

    #[test]
    fn test_derive_adapter_config() {
        let derived = derive_adapter_config(&resolved_config()).unwrap();
        assert_eq!(derived.listen_port, Some(51820));
        assert_eq!(derived.peers.len(), 1);
        assert_eq!(
            derived.peers[0].endpoint,
            Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                51820
            ))
        );
    }

    #[test]
    fn test_derive_rejects_unresolved_endpoint() {
        let mut config = resolved_config();
        config.peers[0].endpoint = Some(Endpoint {
            host: "vpn.example.com".into(),
            port: 51820,
        });
        assert!(matches!(
            derive_adapter_config(&config),
            Err(Error::UnresolvedEndpoint(_))
        ));
    }

    #[test]
    fn test_reflection_carries_counters() {
        let config = resolved_config();
        let mut derived = derive_adapter_config(&config).unwrap();
        derived.peers[0].rx_bytes = 1024;
        derived.peers[0].tx_bytes = 2048;
        derived.peers[0].last_handshake = Some(SystemTime::UNIX_EPOCH);

        let reflected = reflect_configuration(&derived, &config);
        assert_eq!(reflected.name, "office");
        assert_eq!(reflected.peers[0].rx_bytes, 1024);
        assert_eq!(reflected.peers[0].tx_bytes, 2048);
        assert!(reflected.peers[0].last_handshake.is_some());
    }
}
