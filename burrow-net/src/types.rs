//! Row types mirroring the host's routing and interface tables

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

/// IP address family, with the family-specific constants the MTU logic
/// depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Minimum MTU a conforming host must support for this family.
    pub fn min_mtu(self) -> u32 {
        match self {
            AddressFamily::V4 => 576,
            AddressFamily::V6 => 1280,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("IPv4"),
            AddressFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Stable identifier of a network interface (the LUID on Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InterfaceLuid(pub u64);

impl InterfaceLuid {
    pub const UNSPECIFIED: InterfaceLuid = InterfaceLuid(0);

    pub fn is_unspecified(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InterfaceLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One row of the host's forwarding table.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRow {
    pub destination: IpNet,
    pub luid: InterfaceLuid,
    pub interface_index: u32,
    /// Route-specific metric; the effective metric adds the owning
    /// interface's metric.
    pub metric: u32,
}

impl RouteRow {
    /// A default route matches everything (prefix length 0).
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }
}

/// Link-level interface state.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceRow {
    pub luid: InterfaceLuid,
    pub index: u32,
    pub alias: String,
    /// Link MTU as reported by the interface.
    pub mtu: u32,
    pub oper_up: bool,
}

/// Per-family IP interface parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct IpInterfaceRow {
    pub luid: InterfaceLuid,
    pub family: AddressFamily,
    pub metric: u32,
    /// The family-specific MTU actually used for IP traffic; this is the
    /// value the MTU monitor writes.
    pub mtu: u32,
    pub forwarding: bool,
    pub weak_host_send: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_floors() {
        assert_eq!(AddressFamily::V4.min_mtu(), 576);
        assert_eq!(AddressFamily::V6.min_mtu(), 1280);
    }

    #[test]
    fn test_default_route_detection() {
        let default = RouteRow {
            destination: "0.0.0.0/0".parse().unwrap(),
            luid: InterfaceLuid(1),
            interface_index: 1,
            metric: 0,
        };
        let specific = RouteRow {
            destination: "10.0.0.0/8".parse().unwrap(),
            ..default.clone()
        };
        assert!(default.is_default());
        assert!(!specific.is_default());
    }
}
