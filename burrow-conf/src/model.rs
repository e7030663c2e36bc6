//! In-memory representation of a tunnel configuration
//!
//! A [`Config`] holds everything a tunnel declares: the interface section
//! (keys, addresses, DNS, lifecycle scripts) and an ordered list of peers.
//! It is constructed once per orchestration run, either by parsing a
//! configuration text or by reflecting a live adapter, and is only mutated
//! by endpoint resolution and network-entry de-duplication.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ipnet::IpNet;

use crate::error::ParseError;

/// Length in bytes of the tunnel's curve keys.
pub const KEY_LENGTH: usize = 32;

/// Maximum length of a tunnel name. The name doubles as the configuration
/// file stem and the service name, so it is kept short and filesystem-safe.
pub const MAX_TUNNEL_NAME_LENGTH: usize = 32;

/// A 32-byte key in its raw form, displayed and parsed as standard base64.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Key([u8; KEY_LENGTH]);

impl Key {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// An all-zero key marks "not set"; configs with zero keys are rejected.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn from_base64(s: &str) -> Result<Self, ParseError> {
        let bytes = BASE64
            .decode(s)
            .map_err(|_| ParseError::InvalidKey(s.to_string()))?;
        let bytes: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| ParseError::InvalidKeyLength(s.to_string()))?;
        Ok(Key(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_base64())
    }
}

impl FromStr for Key {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_base64(s)
    }
}

/// A peer's remote endpoint: a host (literal address or DNS name) and a
/// UDP port. IPv6 literals are bracket-delimited in the textual form so the
/// port separator stays unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Whether the host is already a literal address (no resolution needed).
    pub fn is_host_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// The literal address of this endpoint, if the host is one.
    pub fn address(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
            // Bracketed form, required for IPv6 literals.
            let end = rest
                .find(']')
                .ok_or_else(|| ParseError::MissingBracket(s.to_string()))?;
            let host = &rest[..end];
            let remainder = &rest[end + 1..];
            let port_str = remainder
                .strip_prefix(':')
                .ok_or_else(|| ParseError::MissingPortSeparator(s.to_string()))?;
            (host, port_str)
        } else {
            // Unbracketed: the last colon separates the port.
            let i = s
                .rfind(':')
                .ok_or_else(|| ParseError::MissingPort(s.to_string()))?;
            let host = &s[..i];
            if host.contains(':') {
                return Err(ParseError::UnbracketedIpv6(s.to_string()));
            }
            (host, &s[i + 1..])
        };
        if host.is_empty() {
            return Err(ParseError::InvalidHost(host.to_string()));
        }
        let port = parse_port(port_str)?;
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

pub(crate) fn parse_port(s: &str) -> Result<u16, ParseError> {
    s.parse::<u16>()
        .map_err(|_| ParseError::InvalidPort(s.to_string()))
}

/// The `[Interface]` section of a tunnel configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Interface {
    pub private_key: Key,
    pub listen_port: Option<u16>,
    /// Manual MTU override; when absent the MTU monitor tracks the default
    /// route instead.
    pub mtu: Option<u16>,
    pub addresses: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub dns_search: Vec<String>,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    /// When true the tunnel's routes are kept out of the host's main
    /// routing table (`Table = off`).
    pub table_off: bool,
}

/// One `[Peer]` section. The byte counters and handshake time are runtime
/// state reflected from a live adapter, never parsed from text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Peer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<Endpoint>,
    /// Keepalive interval in seconds; 0 disables it.
    pub persistent_keepalive: u16,

    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
}

impl Peer {
    /// Whether this peer declares an endpoint that needs resolving or
    /// passing to the adapter.
    pub fn has_endpoint(&self) -> bool {
        self.endpoint.as_ref().is_some_and(|e| !e.host.is_empty())
    }
}

/// A full tunnel declaration: name, interface, and ordered peers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub name: String,
    pub interface: Interface,
    pub peers: Vec<Peer>,
}

/// Whether `name` is acceptable as a tunnel name. The name is reused as the
/// configuration file stem and the service identifier.
pub fn tunnel_name_is_valid(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TUNNEL_NAME_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'=' | b'+' | b'.' | b'-'))
}

fn dedup_preserving_order<T: Clone + Eq + std::hash::Hash>(items: &mut Vec<T>) {
    let mut seen = HashSet::with_capacity(items.len());
    items.retain(|item| seen.insert(item.clone()));
}

impl Config {
    /// Remove redundant addresses, DNS entries, and allowed-IPs while
    /// preserving first-occurrence order.
    pub fn deduplicate_network_entries(&mut self) {
        dedup_preserving_order(&mut self.interface.addresses);
        dedup_preserving_order(&mut self.interface.dns);
        dedup_preserving_order(&mut self.interface.dns_search);
        for peer in &mut self.peers {
            dedup_preserving_order(&mut peer.allowed_ips);
        }
    }

    /// Serialize back into the on-disk text format. Parsing the result
    /// reproduces this config, minus the runtime counters.
    pub fn to_wg_quick(&self) -> String {
        fn join<T: fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }

        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", self.interface.private_key));
        if let Some(port) = self.interface.listen_port {
            out.push_str(&format!("ListenPort = {port}\n"));
        }
        if !self.interface.addresses.is_empty() {
            out.push_str(&format!("Address = {}\n", join(&self.interface.addresses)));
        }
        if !self.interface.dns.is_empty() || !self.interface.dns_search.is_empty() {
            let mut entries: Vec<String> =
                self.interface.dns.iter().map(|a| a.to_string()).collect();
            entries.extend(self.interface.dns_search.iter().cloned());
            out.push_str(&format!("DNS = {}\n", entries.join(", ")));
        }
        if let Some(mtu) = self.interface.mtu {
            out.push_str(&format!("MTU = {mtu}\n"));
        }
        for (key, value) in [
            ("PreUp", &self.interface.pre_up),
            ("PostUp", &self.interface.post_up),
            ("PreDown", &self.interface.pre_down),
            ("PostDown", &self.interface.post_down),
        ] {
            if !value.is_empty() {
                out.push_str(&format!("{key} = {value}\n"));
            }
        }
        if self.interface.table_off {
            out.push_str("Table = off\n");
        }
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if let Some(psk) = &peer.preshared_key {
                out.push_str(&format!("PresharedKey = {psk}\n"));
            }
            if !peer.allowed_ips.is_empty() {
                out.push_str(&format!("AllowedIPs = {}\n", join(&peer.allowed_ips)));
            }
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {endpoint}\n"));
            }
            if peer.persistent_keepalive > 0 {
                out.push_str(&format!(
                    "PersistentKeepalive = {}\n",
                    peer.persistent_keepalive
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_base64_round_trip() {
        let key = Key::new([7u8; KEY_LENGTH]);
        let encoded = key.to_base64();
        assert_eq!(Key::from_base64(&encoded).unwrap(), key);
    }

    #[test]
    fn test_key_rejects_wrong_length() {
        let short = BASE64.encode([1u8; 16]);
        assert_eq!(
            Key::from_base64(&short),
            Err(ParseError::InvalidKeyLength(short.clone()))
        );
    }

    #[test]
    fn test_key_zero_detection() {
        assert!(Key::default().is_zero());
        assert!(!Key::new([1u8; KEY_LENGTH]).is_zero());
    }

    #[test]
    fn test_endpoint_ipv4() {
        let e: Endpoint = "10.0.0.1:51820".parse().unwrap();
        assert_eq!(e.host, "10.0.0.1");
        assert_eq!(e.port, 51820);
        assert!(e.is_host_literal());
    }

    #[test]
    fn test_endpoint_ipv6_bracketed() {
        let e: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(e.host, "2001:db8::1");
        assert_eq!(e.port, 51820);
        assert_eq!(e.to_string(), "[2001:db8::1]:51820");
    }

    #[test]
    fn test_endpoint_ipv6_unbracketed_rejected() {
        let err = "2001:db8::1:51820".parse::<Endpoint>().unwrap_err();
        assert_eq!(err, ParseError::UnbracketedIpv6("2001:db8::1:51820".into()));
    }

    #[test]
    fn test_endpoint_hostname() {
        let e: Endpoint = "vpn.example.com:51820".parse().unwrap();
        assert_eq!(e.host, "vpn.example.com");
        assert!(!e.is_host_literal());
    }

    #[test]
    fn test_endpoint_missing_port() {
        assert_eq!(
            "10.0.0.1".parse::<Endpoint>().unwrap_err(),
            ParseError::MissingPort("10.0.0.1".into())
        );
        assert_eq!(
            "[2001:db8::1]51820".parse::<Endpoint>().unwrap_err(),
            ParseError::MissingPortSeparator("[2001:db8::1]51820".into())
        );
    }

    #[test]
    fn test_tunnel_name_validation() {
        assert!(tunnel_name_is_valid("office"));
        assert!(tunnel_name_is_valid("wg-home.v2"));
        assert!(!tunnel_name_is_valid(""));
        assert!(!tunnel_name_is_valid("has space"));
        assert!(!tunnel_name_is_valid(&"x".repeat(33)));
    }

    #[test]
    fn test_deduplicate_network_entries() {
        let mut config = Config {
            name: "test".into(),
            interface: Interface {
                addresses: vec![
                    "10.0.0.1/24".parse().unwrap(),
                    "10.0.0.1/24".parse().unwrap(),
                    "fd00::1/64".parse().unwrap(),
                ],
                ..Default::default()
            },
            peers: vec![Peer {
                allowed_ips: vec![
                    "0.0.0.0/0".parse().unwrap(),
                    "0.0.0.0/0".parse().unwrap(),
                ],
                ..Default::default()
            }],
        };
        config.deduplicate_network_entries();
        assert_eq!(config.interface.addresses.len(), 2);
        assert_eq!(config.peers[0].allowed_ips.len(), 1);
    }
}
