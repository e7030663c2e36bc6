//! Parser for the wg-quick style configuration text
//!
//! The grammar is a small INI dialect: two case-insensitive section kinds
//! (`[Interface]`, `[Peer]`), `key = value` lines, `#` comments, and
//! comma-separated list values. Unknown keys are hard errors so typos never
//! silently drop settings.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::ParseError;
use crate::model::{parse_port, tunnel_name_is_valid, Config, Endpoint, Interface, Key, Peer};

/// Parse an address or an address/prefix pair; a bare address gets the
/// full-length prefix for its family.
fn parse_ip_cidr(s: &str) -> Result<IpNet, ParseError> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ParseError::InvalidAddress(s.to_string()))
}

fn parse_mtu(s: &str) -> Result<u16, ParseError> {
    let m: u16 = s
        .parse()
        .map_err(|_| ParseError::InvalidMtu(s.to_string()))?;
    if m < 576 {
        return Err(ParseError::InvalidMtu(s.to_string()));
    }
    Ok(m)
}

fn parse_persistent_keepalive(s: &str) -> Result<u16, ParseError> {
    if s == "off" {
        return Ok(0);
    }
    s.parse()
        .map_err(|_| ParseError::InvalidKeepalive(s.to_string()))
}

/// `Table = off` excludes the tunnel's routes from the main routing table;
/// `auto`, `main`, and numeric table ids all mean the default behavior.
fn parse_table_off(s: &str) -> Result<bool, ParseError> {
    match s {
        "off" => Ok(true),
        "auto" | "main" => Ok(false),
        other => other
            .parse::<u32>()
            .map(|_| false)
            .map_err(|_| ParseError::InvalidTable(other.to_string())),
    }
}

/// Split a comma-separated list value; an empty element is an error rather
/// than being silently skipped.
fn split_list(s: &str) -> Result<Vec<&str>, ParseError> {
    let mut out = Vec::new();
    for element in s.split(',') {
        let trimmed = element.trim();
        if trimmed.is_empty() {
            return Err(ParseError::TwoCommasInARow(s.to_string()));
        }
        out.push(trimmed);
    }
    Ok(out)
}

enum Section {
    None,
    Interface,
    Peer(Peer),
}

/// Parse `text` into a [`Config`] named `name`.
///
/// A new `[Peer]` (or `[Interface]`) header finalizes the peer being built.
/// The config is rejected unless the interface has a private key and every
/// peer has a public key.
pub fn from_wg_quick(text: &str, name: &str) -> Result<Config, ParseError> {
    if !tunnel_name_is_valid(name) {
        return Err(ParseError::InvalidTunnelName(name.to_string()));
    }
    let mut config = Config {
        name: name.to_string(),
        interface: Interface::default(),
        peers: Vec::new(),
    };
    let mut section = Section::None;

    for raw_line in text.lines() {
        let line = match raw_line.split_once('#') {
            Some((before, _comment)) => before,
            None => raw_line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        if line.eq_ignore_ascii_case("[interface]") {
            if let Section::Peer(peer) = std::mem::replace(&mut section, Section::Interface) {
                config.peers.push(peer);
            }
            continue;
        }
        if line.eq_ignore_ascii_case("[peer]") {
            if let Section::Peer(peer) = std::mem::replace(&mut section, Section::Peer(Peer::default())) {
                config.peers.push(peer);
            }
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ParseError::MissingEquals(line.to_string()))?;
        let key = key.trim();
        let value = value.trim();
        if value.is_empty() {
            return Err(ParseError::MissingValue(line.to_string()));
        }

        match &mut section {
            Section::None => return Err(ParseError::LineNotInSection(line.to_string())),
            Section::Interface => {
                parse_interface_field(&mut config.interface, key, value)?;
            }
            Section::Peer(peer) => {
                parse_peer_field(peer, key, value)?;
            }
        }
    }
    if let Section::Peer(peer) = section {
        config.peers.push(peer);
    }

    if config.interface.private_key.is_zero() {
        return Err(ParseError::MissingPrivateKey);
    }
    if config.peers.iter().any(|p| p.public_key.is_zero()) {
        return Err(ParseError::MissingPublicKey);
    }
    Ok(config)
}

fn parse_interface_field(
    interface: &mut Interface,
    key: &str,
    value: &str,
) -> Result<(), ParseError> {
    if key.eq_ignore_ascii_case("privatekey") {
        interface.private_key = Key::from_base64(value)?;
    } else if key.eq_ignore_ascii_case("listenport") {
        interface.listen_port = Some(parse_port(value)?);
    } else if key.eq_ignore_ascii_case("mtu") {
        interface.mtu = Some(parse_mtu(value)?);
    } else if key.eq_ignore_ascii_case("address") {
        for element in split_list(value)? {
            interface.addresses.push(parse_ip_cidr(element)?);
        }
    } else if key.eq_ignore_ascii_case("dns") {
        // Literal addresses become DNS servers; anything else is a search
        // domain.
        for element in split_list(value)? {
            match element.parse::<IpAddr>() {
                Ok(addr) => interface.dns.push(addr),
                Err(_) => interface.dns_search.push(element.to_string()),
            }
        }
    } else if key.eq_ignore_ascii_case("preup") {
        interface.pre_up = value.to_string();
    } else if key.eq_ignore_ascii_case("postup") {
        interface.post_up = value.to_string();
    } else if key.eq_ignore_ascii_case("predown") {
        interface.pre_down = value.to_string();
    } else if key.eq_ignore_ascii_case("postdown") {
        interface.post_down = value.to_string();
    } else if key.eq_ignore_ascii_case("table") {
        interface.table_off = parse_table_off(value)?;
    } else {
        return Err(ParseError::InvalidInterfaceKey(key.to_string()));
    }
    Ok(())
}

fn parse_peer_field(peer: &mut Peer, key: &str, value: &str) -> Result<(), ParseError> {
    if key.eq_ignore_ascii_case("publickey") {
        peer.public_key = Key::from_base64(value)?;
    } else if key.eq_ignore_ascii_case("presharedkey") {
        peer.preshared_key = Some(Key::from_base64(value)?);
    } else if key.eq_ignore_ascii_case("allowedips") {
        for element in split_list(value)? {
            peer.allowed_ips.push(parse_ip_cidr(element)?);
        }
    } else if key.eq_ignore_ascii_case("persistentkeepalive") {
        peer.persistent_keepalive = parse_persistent_keepalive(value)?;
    } else if key.eq_ignore_ascii_case("endpoint") {
        peer.endpoint = Some(value.parse::<Endpoint>()?);
    } else {
        return Err(ParseError::InvalidPeerKey(key.to_string()));
    }
    Ok(())
}

/// Parse raw file bytes whose encoding is not known in advance.
///
/// UTF-8 is tried first; if decoding or parsing fails, the same grammar is
/// retried over a fixed sequence of legacy encodings (UTF-16LE, UTF-16BE).
/// The error from the first attempt wins if every attempt fails.
pub fn from_wg_quick_with_unknown_encoding(bytes: &[u8], name: &str) -> Result<Config, ParseError> {
    let first_err = match std::str::from_utf8(bytes) {
        Ok(text) => match from_wg_quick(strip_bom(text), name) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        },
        Err(_) => ParseError::InvalidEncoding,
    };
    for decode in [decode_utf16le, decode_utf16be] {
        if let Some(text) = decode(bytes) {
            if let Ok(config) = from_wg_quick(strip_bom(&text), name) {
                return Ok(config);
            }
        }
    }
    Err(first_err)
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

fn decode_utf16le(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

fn decode_utf16be(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KEY_LENGTH;

    fn test_key(fill: u8) -> String {
        Key::new([fill; KEY_LENGTH]).to_base64()
    }

    fn minimal_config() -> String {
        format!(
            "[Interface]\nPrivateKey = {}\n\n[Peer]\nPublicKey = {}\n",
            test_key(1),
            test_key(2)
        )
    }

    #[test]
    fn test_parse_minimal() {
        let config = from_wg_quick(&minimal_config(), "test").unwrap();
        assert_eq!(config.name, "test");
        assert!(!config.interface.private_key.is_zero());
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_full_interface_section() {
        let text = format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             ListenPort = 51820\n\
             MTU = 1380\n\
             Address = 10.10.0.2/24, fd00::2/64\n\
             DNS = 10.10.0.1, corp.example\n\
             PreUp = echo pre-up\n\
             PostDown = echo post-down\n\
             Table = off\n",
            test_key(1)
        );
        let config = from_wg_quick(&text, "office").unwrap();
        let interface = &config.interface;
        assert_eq!(interface.listen_port, Some(51820));
        assert_eq!(interface.mtu, Some(1380));
        assert_eq!(interface.addresses.len(), 2);
        assert_eq!(interface.dns, vec!["10.10.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(interface.dns_search, vec!["corp.example".to_string()]);
        assert_eq!(interface.pre_up, "echo pre-up");
        assert_eq!(interface.post_down, "echo post-down");
        assert!(interface.table_off);
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let text = format!(
            "[INTERFACE]\nprivatekey = {}\n[peer]\nPUBLICKEY = {}\nallowedips = 0.0.0.0/0\n",
            test_key(1),
            test_key(2)
        );
        let config = from_wg_quick(&text, "test").unwrap();
        assert_eq!(config.peers[0].allowed_ips.len(), 1);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let text = format!(
            "# leading comment\n\n[Interface]\nPrivateKey = {} # trailing comment\n",
            test_key(1)
        );
        let config = from_wg_quick(&text, "test").unwrap();
        assert!(!config.interface.private_key.is_zero());
    }

    #[test]
    fn test_missing_private_key_rejected() {
        let text = format!("[Interface]\nListenPort = 51820\n[Peer]\nPublicKey = {}\n", test_key(2));
        assert_eq!(
            from_wg_quick(&text, "test").unwrap_err(),
            ParseError::MissingPrivateKey
        );
    }

    #[test]
    fn test_peer_without_public_key_rejected() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\n[Peer]\nPersistentKeepalive = 25\n",
            test_key(1)
        );
        assert_eq!(
            from_wg_quick(&text, "test").unwrap_err(),
            ParseError::MissingPublicKey
        );
    }

    #[test]
    fn test_peers_between_repeated_interface_markers() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\n\
             [Peer]\nPublicKey = {}\n\
             [Interface]\nListenPort = 51820\n\
             [Peer]\nPublicKey = {}\n",
            test_key(1),
            test_key(2),
            test_key(3)
        );
        let config = from_wg_quick(&text, "test").unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].public_key, Key::new([2; KEY_LENGTH]));
        assert_eq!(config.peers[1].public_key, Key::new([3; KEY_LENGTH]));
        assert_eq!(config.interface.listen_port, Some(51820));
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        let text = format!("[Interface]\nPrivateKey = {}\nFrobnicate = yes\n", test_key(1));
        assert_eq!(
            from_wg_quick(&text, "test").unwrap_err(),
            ParseError::InvalidInterfaceKey("Frobnicate".into())
        );
    }

    #[test]
    fn test_line_outside_section() {
        let err = from_wg_quick("PrivateKey = whatever\n", "test").unwrap_err();
        assert_eq!(err, ParseError::LineNotInSection("PrivateKey = whatever".into()));
    }

    #[test]
    fn test_missing_equals_and_empty_value() {
        assert_eq!(
            from_wg_quick("[Interface]\nListenPort 51820\n", "test").unwrap_err(),
            ParseError::MissingEquals("ListenPort 51820".into())
        );
        assert!(matches!(
            from_wg_quick("[Interface]\nPrivateKey =\n", "test").unwrap_err(),
            ParseError::MissingValue(_)
        ));
    }

    #[test]
    fn test_double_comma_in_list() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.0/24,,10.0.1.0/24\n",
            test_key(1),
            test_key(2)
        );
        assert_eq!(
            from_wg_quick(&text, "test").unwrap_err(),
            ParseError::TwoCommasInARow("10.0.0.0/24,,10.0.1.0/24".into())
        );
    }

    #[test]
    fn test_endpoint_forms() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\n\
             [Peer]\nPublicKey = {}\nEndpoint = 10.0.0.1:51820\n\
             [Peer]\nPublicKey = {}\nEndpoint = [2001:db8::1]:51820\n",
            test_key(1),
            test_key(2),
            test_key(3)
        );
        let config = from_wg_quick(&text, "test").unwrap();
        let first = config.peers[0].endpoint.as_ref().unwrap();
        assert_eq!((first.host.as_str(), first.port), ("10.0.0.1", 51820));
        let second = config.peers[1].endpoint.as_ref().unwrap();
        assert_eq!((second.host.as_str(), second.port), ("2001:db8::1", 51820));
    }

    #[test]
    fn test_unbracketed_ipv6_endpoint_rejected() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\n[Peer]\nPublicKey = {}\nEndpoint = 2001:db8::1:51820\n",
            test_key(1),
            test_key(2)
        );
        assert_eq!(
            from_wg_quick(&text, "test").unwrap_err(),
            ParseError::UnbracketedIpv6("2001:db8::1:51820".into())
        );
    }

    #[test]
    fn test_mtu_range() {
        let low = format!("[Interface]\nPrivateKey = {}\nMTU = 100\n", test_key(1));
        assert_eq!(
            from_wg_quick(&low, "test").unwrap_err(),
            ParseError::InvalidMtu("100".into())
        );
    }

    #[test]
    fn test_keepalive_off_and_range() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\n[Peer]\nPublicKey = {}\nPersistentKeepalive = off\n",
            test_key(1),
            test_key(2)
        );
        let config = from_wg_quick(&text, "test").unwrap();
        assert_eq!(config.peers[0].persistent_keepalive, 0);

        let bad = format!(
            "[Interface]\nPrivateKey = {}\n[Peer]\nPublicKey = {}\nPersistentKeepalive = 70000\n",
            test_key(1),
            test_key(2)
        );
        assert!(matches!(
            from_wg_quick(&bad, "test").unwrap_err(),
            ParseError::InvalidKeepalive(_)
        ));
    }

    #[test]
    fn test_invalid_tunnel_name() {
        assert_eq!(
            from_wg_quick(&minimal_config(), "bad name").unwrap_err(),
            ParseError::InvalidTunnelName("bad name".into())
        );
    }

    #[test]
    fn test_round_trip() {
        let text = format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             ListenPort = 51820\n\
             Address = 10.10.0.2/24\n\
             DNS = 10.10.0.1\n\
             MTU = 1380\n\
             Table = off\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             PresharedKey = {}\n\
             AllowedIPs = 0.0.0.0/0, ::/0\n\
             Endpoint = vpn.example.com:51820\n\
             PersistentKeepalive = 25\n",
            test_key(1),
            test_key(2),
            test_key(3)
        );
        let config = from_wg_quick(&text, "office").unwrap();
        let reparsed = from_wg_quick(&config.to_wg_quick(), "office").unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_utf16le_fallback() {
        let text = minimal_config();
        let mut bytes = vec![0xff, 0xfe];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let config = from_wg_quick_with_unknown_encoding(&bytes, "test").unwrap();
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_unknown_encoding_returns_first_error() {
        let err = from_wg_quick_with_unknown_encoding(&[0xff, 0x00, 0x01], "test").unwrap_err();
        assert_eq!(err, ParseError::InvalidEncoding);
    }
}
