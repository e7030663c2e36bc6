//! Read/write access to host routing and interface state
//!
//! The service core never talks to the OS directly; it goes through this
//! trait so the MTU monitor and diagnostics run against mocks in tests and
//! against the platform implementation in production.

use crate::error::Result;
use crate::types::{AddressFamily, InterfaceLuid, InterfaceRow, IpInterfaceRow, RouteRow};

pub trait NetworkState: Send + Sync {
    /// Snapshot the forwarding table for one address family.
    fn routes(&self, family: AddressFamily) -> Result<Vec<RouteRow>>;

    /// Link-level state of one interface.
    fn interface(&self, luid: InterfaceLuid) -> Result<InterfaceRow>;

    /// Per-family IP parameters of one interface.
    fn ip_interface(&self, luid: InterfaceLuid, family: AddressFamily) -> Result<IpInterfaceRow>;

    /// Set the family-specific MTU on an interface.
    fn set_interface_mtu(
        &self,
        luid: InterfaceLuid,
        family: AddressFamily,
        mtu: u32,
    ) -> Result<()>;
}
