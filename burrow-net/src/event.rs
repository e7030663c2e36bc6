//! Host network change notifications
//!
//! OS notifications arrive on OS-managed threads; implementations funnel
//! them into a bounded broadcast channel so every consumer (the MTU
//! monitors, the interface watcher) reads from its own receiver inside the
//! service's own tasks.

use tokio::sync::broadcast;

/// Capacity of the notification channel. Change storms beyond this are
/// dropped for lagging receivers, which is fine: consumers recompute from
/// current state rather than replaying history.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

use crate::types::AddressFamily;

/// A host network change relevant to the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    /// A forwarding-table entry changed.
    RouteChanged {
        family: AddressFamily,
        /// Whether the changed route is a default route (prefix length 0).
        default_route: bool,
    },
    /// An interface changed.
    InterfaceChanged {
        /// Whether this was a parameter change (as opposed to
        /// arrival/removal).
        param_change: bool,
    },
}

/// Source of [`NetEvent`]s. Each call to `subscribe` yields an independent
/// receiver over the same underlying stream.
pub trait ChangeNotifier: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<NetEvent>;
}
