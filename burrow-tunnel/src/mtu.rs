//! MTU monitoring
//!
//! The tunnel's usable MTU depends on whichever interface currently carries
//! the host's default route. The monitor recomputes on route-table and
//! interface-parameter changes: find the best default route not owned by
//! the tunnel itself, subtract the tunnel overhead from that interface's
//! MTU, clamp to the family floor, and write the result to the tunnel
//! adapter only when it actually changed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use burrow_net::{AddressFamily, InterfaceLuid, NetEvent, NetworkState};

/// Calls within this window of the previous update are dropped; OS change
/// notifications arrive in storms.
pub const UPDATE_THROTTLE: Duration = Duration::from_millis(250);

/// Bytes of tunnel overhead subtracted from the default route's MTU.
pub const TUNNEL_OVERHEAD: u32 = 80;

struct MtuState {
    last_luid: InterfaceLuid,
    last_index: u32,
    last_mtu: u32,
    last_update: Option<Instant>,
    min_mtu: u32,
}

/// Per-family MTU monitor. State is owned exclusively by the monitor and
/// touched only under its lock; `update` is safe to invoke from the startup
/// path and from any number of notification events concurrently.
pub struct MtuMonitor {
    net: Arc<dyn NetworkState>,
    family: AddressFamily,
    tunnel: InterfaceLuid,
    state: Mutex<MtuState>,
}

impl MtuMonitor {
    pub fn new(net: Arc<dyn NetworkState>, family: AddressFamily, tunnel: InterfaceLuid) -> Self {
        MtuMonitor {
            net,
            family,
            tunnel,
            state: Mutex::new(MtuState {
                last_luid: InterfaceLuid::UNSPECIFIED,
                last_index: u32::MAX,
                last_mtu: 0,
                last_update: None,
                min_mtu: family.min_mtu(),
            }),
        }
    }

    /// Locate the current default route for our family, excluding the
    /// tunnel's own interface, picking the lowest combined route+interface
    /// metric among operationally-up interfaces.
    fn find_default(&self, state: &mut MtuState) -> burrow_net::Result<()> {
        let routes = self.net.routes(self.family)?;

        let mut lowest_metric = u32::MAX;
        let mut chosen_luid = InterfaceLuid::UNSPECIFIED;
        let mut chosen_index = 0u32;

        for route in routes
            .iter()
            .filter(|r| r.is_default() && r.luid != self.tunnel)
        {
            let Ok(ifrow) = self.net.interface(route.luid) else {
                continue;
            };
            if !ifrow.oper_up {
                continue;
            }
            let Ok(ip_iface) = self.net.ip_interface(route.luid, self.family) else {
                continue;
            };
            let metric = route.metric + ip_iface.metric;
            if metric < lowest_metric {
                lowest_metric = metric;
                chosen_luid = route.luid;
                chosen_index = route.interface_index;
            }
        }

        if chosen_luid == state.last_luid && chosen_index == state.last_index {
            return Ok(());
        }
        state.last_luid = chosen_luid;
        state.last_index = chosen_index;
        Ok(())
    }

    /// Recompute and, if needed, rewrite the tunnel MTU.
    pub async fn update(&self) -> burrow_net::Result<()> {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        if let Some(last) = state.last_update {
            if now.duration_since(last) < UPDATE_THROTTLE {
                return Ok(());
            }
        }
        state.last_update = Some(now);

        self.find_default(&mut state)?;

        let mut default_mtu = 0;
        if !state.last_luid.is_unspecified() {
            let ifrow = self.net.interface(state.last_luid)?;
            if ifrow.mtu > 0 {
                default_mtu = ifrow.mtu;
            }
        }

        // No default path found: leave the tunnel MTU alone.
        if default_mtu > 0 && state.last_mtu != default_mtu {
            let tunnel_iface = self.net.ip_interface(self.tunnel, self.family)?;
            let new_mtu = (default_mtu - TUNNEL_OVERHEAD).max(state.min_mtu);
            if tunnel_iface.mtu != new_mtu {
                debug!(
                    "setting {} tunnel MTU to {} (default route MTU {})",
                    self.family, new_mtu, default_mtu
                );
                self.net
                    .set_interface_mtu(self.tunnel, self.family, new_mtu)?;
            }
            state.last_mtu = default_mtu;
        }
        Ok(())
    }

    /// Run an initial update, then keep updating on relevant change events
    /// until the notification stream closes.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<NetEvent>) {
        if let Err(err) = self.update().await {
            warn!("initial {} MTU update failed: {}", self.family, err);
        }
        loop {
            match events.recv().await {
                Ok(event) if is_relevant(event) => {
                    if let Err(err) = self.update().await {
                        warn!("{} MTU update failed: {}", self.family, err);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed events; recompute from current state.
                    if let Err(err) = self.update().await {
                        warn!("{} MTU update failed: {}", self.family, err);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn is_relevant(event: NetEvent) -> bool {
    match event {
        NetEvent::RouteChanged { default_route, .. } => default_route,
        NetEvent::InterfaceChanged { param_change } => param_change,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_net::mock::MockNetworkState;
    use burrow_net::ChangeNotifier;
    use burrow_net::{InterfaceRow, IpInterfaceRow, RouteRow};

    const TUNNEL: InterfaceLuid = InterfaceLuid(1);
    const ETHERNET: InterfaceLuid = InterfaceLuid(2);
    const WIFI: InterfaceLuid = InterfaceLuid(3);

    fn interface(luid: InterfaceLuid, mtu: u32, up: bool) -> InterfaceRow {
        InterfaceRow {
            luid,
            index: luid.0 as u32,
            alias: format!("if{}", luid.0),
            mtu,
            oper_up: up,
        }
    }

    fn ip_interface(luid: InterfaceLuid, metric: u32, mtu: u32) -> IpInterfaceRow {
        IpInterfaceRow {
            luid,
            family: AddressFamily::V4,
            metric,
            mtu,
            forwarding: false,
            weak_host_send: false,
        }
    }

    fn default_route(luid: InterfaceLuid, metric: u32) -> RouteRow {
        RouteRow {
            destination: "0.0.0.0/0".parse().unwrap(),
            luid,
            interface_index: luid.0 as u32,
            metric,
        }
    }

    fn network_with_default(default_mtu: u32) -> Arc<MockNetworkState> {
        let net = Arc::new(MockNetworkState::new());
        net.add_route(default_route(ETHERNET, 10));
        net.add_interface(interface(ETHERNET, default_mtu, true));
        net.add_ip_interface(ip_interface(ETHERNET, 5, default_mtu));
        net.add_interface(interface(TUNNEL, 1500, true));
        net.add_ip_interface(ip_interface(TUNNEL, 1, 1500));
        net
    }

    #[tokio::test]
    async fn test_mtu_derived_from_default_route() {
        let net = network_with_default(1500);
        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        assert_eq!(net.mtu_writes(), vec![(TUNNEL, AddressFamily::V4, 1420)]);
    }

    #[tokio::test]
    async fn test_mtu_clamped_to_family_floor() {
        let net = network_with_default(600);
        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        assert_eq!(net.mtu_writes(), vec![(TUNNEL, AddressFamily::V4, 576)]);
    }

    #[tokio::test]
    async fn test_updates_throttled_within_window() {
        let net = network_with_default(1500);
        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        // A different default MTU would produce a second write, but the
        // second call lands inside the throttle window.
        net.add_interface(interface(ETHERNET, 1400, true));
        monitor.update().await.unwrap();
        assert_eq!(net.mtu_writes().len(), 1);
    }

    #[tokio::test]
    async fn test_update_after_throttle_window() {
        let net = network_with_default(1500);
        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        net.add_interface(interface(ETHERNET, 1400, true));
        tokio::time::sleep(UPDATE_THROTTLE + Duration::from_millis(50)).await;
        monitor.update().await.unwrap();
        assert_eq!(
            net.mtu_writes(),
            vec![
                (TUNNEL, AddressFamily::V4, 1420),
                (TUNNEL, AddressFamily::V4, 1320)
            ]
        );
    }

    #[tokio::test]
    async fn test_no_write_when_tunnel_mtu_already_correct() {
        let net = network_with_default(1500);
        net.add_ip_interface(ip_interface(TUNNEL, 1, 1420));
        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        assert!(net.mtu_writes().is_empty());
    }

    #[tokio::test]
    async fn test_ignores_tunnel_own_default_route() {
        let net = Arc::new(MockNetworkState::new());
        net.add_route(default_route(TUNNEL, 0));
        net.add_interface(interface(TUNNEL, 1500, true));
        net.add_ip_interface(ip_interface(TUNNEL, 1, 1500));
        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        assert!(net.mtu_writes().is_empty());
    }

    #[tokio::test]
    async fn test_prefers_lowest_combined_metric() {
        let net = Arc::new(MockNetworkState::new());
        net.add_route(default_route(ETHERNET, 20));
        net.add_route(default_route(WIFI, 10));
        net.add_interface(interface(ETHERNET, 9000, true));
        net.add_ip_interface(ip_interface(ETHERNET, 5, 9000));
        // Route metric is lower but combined metric is higher.
        net.add_interface(interface(WIFI, 1500, true));
        net.add_ip_interface(ip_interface(WIFI, 50, 1500));
        net.add_interface(interface(TUNNEL, 1500, true));
        net.add_ip_interface(ip_interface(TUNNEL, 1, 1500));

        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        assert_eq!(net.mtu_writes(), vec![(TUNNEL, AddressFamily::V4, 8920)]);
    }

    #[tokio::test]
    async fn test_down_interfaces_skipped() {
        let net = Arc::new(MockNetworkState::new());
        net.add_route(default_route(ETHERNET, 10));
        net.add_interface(interface(ETHERNET, 1500, false));
        net.add_ip_interface(ip_interface(ETHERNET, 5, 1500));
        net.add_interface(interface(TUNNEL, 1500, true));
        net.add_ip_interface(ip_interface(TUNNEL, 1, 1500));

        let monitor = MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL);
        monitor.update().await.unwrap();
        assert!(net.mtu_writes().is_empty());
    }

    #[tokio::test]
    async fn test_event_driven_updates() {
        let net = network_with_default(1500);
        let notifier = burrow_net::mock::MockNotifier::new();
        let monitor = Arc::new(MtuMonitor::new(net.clone(), AddressFamily::V4, TUNNEL));
        let task = tokio::spawn(monitor.clone().run(notifier.subscribe()));

        // Give the initial update a moment, then change the default MTU and
        // notify past the throttle window.
        tokio::time::sleep(Duration::from_millis(50)).await;
        net.add_interface(interface(ETHERNET, 1280, true));
        tokio::time::sleep(UPDATE_THROTTLE).await;
        notifier.emit(NetEvent::RouteChanged {
            family: AddressFamily::V4,
            default_route: true,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            net.mtu_writes(),
            vec![
                (TUNNEL, AddressFamily::V4, 1420),
                (TUNNEL, AddressFamily::V4, 1200)
            ]
        );
        notifier.close();
        let _ = task.await;
    }
}
