//! Host network and tunnel adapter boundary for Burrow
//!
//! Everything the service layer needs from the operating system passes
//! through the traits in this crate:
//!
//! - [`NetworkState`]: routing-table and interface queries, MTU writes
//! - [`ChangeNotifier`]: route/interface change notifications, funneled
//!   into a bounded broadcast channel
//! - [`Adapter`] / [`AdapterFactory`]: the tunnel driver capability
//!
//! The `mock` module ships scriptable implementations of all of these so
//! the orchestrator's full lifecycle runs in tests without touching the
//! host. Native Windows implementations live behind `#[cfg(windows)]`.

pub mod adapter;
pub mod error;
pub mod event;
pub mod mock;
pub mod state;
pub mod types;

#[cfg(windows)]
pub mod driver;
#[cfg(windows)]
pub mod windows;

pub use adapter::{
    derive_adapter_config, deterministic_guid, reflect_configuration, Adapter, AdapterConfig,
    AdapterFactory, AdapterPeer, AdapterState, TUNNEL_TYPE,
};
pub use error::{Error, Result};
pub use event::{ChangeNotifier, NetEvent, EVENT_CHANNEL_CAPACITY};
pub use state::NetworkState;
pub use types::{AddressFamily, InterfaceLuid, InterfaceRow, IpInterfaceRow, RouteRow};
