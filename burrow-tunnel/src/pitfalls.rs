//! Best-effort diagnostics for host conditions that degrade tunnels
//!
//! These checks only ever log warnings. They run off the critical path and
//! swallow every failure: a diagnostic must never take the tunnel down.
//!
//! Static checks (once at startup): a disabled DNS-cache service, and a
//! known-bad version range of the virtio network driver. Dynamic check
//! (once per address family after the adapter is configured): peer
//! endpoints whose best host route bypasses the tunnel through an
//! interface with forwarding or weak-host-send enabled, which produces
//! routing loops.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use burrow_conf::Config;
use burrow_net::{AddressFamily, InterfaceLuid, InterfaceRow, IpInterfaceRow, NetworkState};

/// How long a static probe result stays fresh before being re-queried.
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// First virtio network driver version with the fix.
const VIRTIO_FIXED_VERSION: u64 = 0x6400_5568_0000_5140;
/// Versions below this predate the bug.
const VIRTIO_ANCIENT_VERSION: u64 = 0x2800_0000_0000_0000;

/// Host environment probes used by the static checks. `None` means the
/// probe could not determine an answer, which is treated as "fine".
pub trait HostEnvironment: Send + Sync {
    fn dns_cache_service_disabled(&self) -> Option<bool>;
    fn virtio_driver_version(&self) -> Option<u64>;
}

/// Environment that answers nothing; used on platforms without the
/// relevant services and in tests that want diagnostics quiet.
pub struct NullEnvironment;

impl HostEnvironment for NullEnvironment {
    fn dns_cache_service_disabled(&self) -> Option<bool> {
        None
    }

    fn virtio_driver_version(&self) -> Option<u64> {
        None
    }
}

#[cfg(windows)]
pub use windows_env::WindowsEnvironment;

struct DnsCacheProbe {
    disabled: bool,
    checked_at: Instant,
}

/// Static pitfall checks with a time-bounded probe cache.
pub struct Pitfalls {
    env: Arc<dyn HostEnvironment>,
    dns_probe: Mutex<Option<DnsCacheProbe>>,
}

impl Pitfalls {
    pub fn new(env: Arc<dyn HostEnvironment>) -> Arc<Self> {
        Arc::new(Pitfalls {
            env,
            dns_probe: Mutex::new(None),
        })
    }

    /// Run the static checks in the background; never blocks, never fails.
    pub fn evaluate_static(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.check_dns_cache_service().await;
            this.check_virtio_driver();
        });
    }

    async fn check_dns_cache_service(&self) {
        let mut probe = self.dns_probe.lock().await;
        let stale = probe
            .as_ref()
            .map_or(true, |p| p.checked_at.elapsed() > RECHECK_INTERVAL);
        if stale {
            let Some(disabled) = self.env.dns_cache_service_disabled() else {
                return;
            };
            *probe = Some(DnsCacheProbe {
                disabled,
                checked_at: Instant::now(),
            });
        }
        if probe.as_ref().is_some_and(|p| p.disabled) {
            warn!("the DNS Client (dnscache) service is disabled; please re-enable it");
        }
    }

    fn check_virtio_driver(&self) {
        let Some(version) = self.env.virtio_driver_version() else {
            return;
        };
        if (VIRTIO_ANCIENT_VERSION..VIRTIO_FIXED_VERSION).contains(&version) {
            warn!(
                "the virtio network driver (NetKVM) is out of date and may cause known problems; \
                 please update to v100.85.104.20800 or later"
            );
        }
    }
}

/// Scan the routing table for peer endpoints whose winning route bypasses
/// the tunnel through a loop-prone interface. Returns the aliases of the
/// problematic interfaces; the caller logs them.
///
/// When two candidate routes tie on both prefix length and combined
/// metric, the route seen last in table order wins. That tie-break is an
/// implementation detail, not a contract.
pub fn weak_host_send_scan(
    net: &dyn NetworkState,
    family: AddressFamily,
    config: &Config,
    tunnel: InterfaceLuid,
) -> Vec<String> {
    struct EndpointRoute {
        addr: IpAddr,
        name: String,
        lowest_metric: u32,
        highest_cidr: u8,
        weak_host_send: bool,
        final_is_ours: bool,
    }

    let Ok(routes) = net.routes(family) else {
        return Vec::new();
    };

    let mut endpoints: Vec<EndpointRoute> = config
        .peers
        .iter()
        .filter_map(|peer| {
            let addr = peer.endpoint.as_ref()?.address()?;
            if AddressFamily::of(&addr) != family {
                return None;
            }
            Some(EndpointRoute {
                addr,
                name: String::new(),
                lowest_metric: u32::MAX,
                highest_cidr: 0,
                weak_host_send: false,
                final_is_ours: false,
            })
        })
        .collect();

    // Interface rows are cached per scan so N peers cost one query per
    // interface, not one per (peer, route).
    let mut if_cache: HashMap<InterfaceLuid, Option<InterfaceRow>> = HashMap::new();
    let mut ip_if_cache: HashMap<InterfaceLuid, Option<IpInterfaceRow>> = HashMap::new();

    for route in &routes {
        let matches_any = endpoints.iter().any(|e| {
            route.destination.prefix_len() >= e.highest_cidr
                && route.destination.contains(&e.addr)
        });
        if !matches_any {
            continue;
        }

        let Some(ifrow) = if_cache
            .entry(route.luid)
            .or_insert_with(|| net.interface(route.luid).ok())
            .clone()
        else {
            continue;
        };
        if !ifrow.oper_up {
            continue;
        }
        let Some(ip_row) = ip_if_cache
            .entry(route.luid)
            .or_insert_with(|| net.ip_interface(route.luid, family).ok())
            .clone()
        else {
            continue;
        };

        for endpoint in &mut endpoints {
            if route.destination.prefix_len() < endpoint.highest_cidr {
                continue;
            }
            if !route.destination.contains(&endpoint.addr) {
                continue;
            }

            let metric = route.metric + ip_row.metric;
            if route.destination.prefix_len() == endpoint.highest_cidr
                && metric > endpoint.lowest_metric
            {
                continue;
            }

            endpoint.lowest_metric = metric;
            endpoint.highest_cidr = route.destination.prefix_len();
            endpoint.final_is_ours = route.luid == tunnel;
            endpoint.name = ifrow.alias.clone();
            endpoint.weak_host_send = ip_row.forwarding || ip_row.weak_host_send;
        }
    }

    let mut problematic: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for endpoint in endpoints {
        if endpoint.weak_host_send && !endpoint.final_is_ours && seen.insert(endpoint.name.clone())
        {
            problematic.push(endpoint.name);
        }
    }
    problematic
}

/// Run the dynamic scan in the background and log its findings.
pub fn evaluate_dynamic(
    net: Arc<dyn NetworkState>,
    family: AddressFamily,
    config: Config,
    tunnel: InterfaceLuid,
) {
    tokio::spawn(async move {
        for name in weak_host_send_scan(net.as_ref(), family, &config, tunnel) {
            warn!(
                "the {:?} interface has Forwarding/WeakHostSend enabled, which will cause \
                 routing loops",
                name
            );
        }
    });
}

#[cfg(windows)]
mod windows_env {
    use super::HostEnvironment;

    /// Probes backed by the Windows service manager and driver store.
    pub struct WindowsEnvironment;

    impl HostEnvironment for WindowsEnvironment {
        fn dns_cache_service_disabled(&self) -> Option<bool> {
            use windows_service::service::ServiceAccess;
            use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

            let manager =
                ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT).ok()?;
            let service = manager
                .open_service("dnscache", ServiceAccess::QUERY_CONFIG)
                .ok()?;
            let config = service.query_config().ok()?;
            Some(config.start_type == windows_service::service::ServiceStartType::Disabled)
        }

        fn virtio_driver_version(&self) -> Option<u64> {
            use windows_sys::Win32::Storage::FileSystem::{
                GetFileVersionInfoSizeW, GetFileVersionInfoW, VerQueryValueW, VS_FIXEDFILEINFO,
            };

            let path: Vec<u16> = r"C:\Windows\System32\drivers\netkvm.sys"
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            unsafe {
                let mut handle = 0u32;
                let size = GetFileVersionInfoSizeW(path.as_ptr(), &mut handle);
                if size == 0 {
                    return None;
                }
                let mut buffer = vec![0u8; size as usize];
                if GetFileVersionInfoW(path.as_ptr(), 0, size, buffer.as_mut_ptr() as *mut _) == 0
                {
                    return None;
                }
                let mut info: *mut VS_FIXEDFILEINFO = std::ptr::null_mut();
                let mut len = 0u32;
                let root: Vec<u16> = "\\".encode_utf16().chain(std::iter::once(0)).collect();
                if VerQueryValueW(
                    buffer.as_ptr() as *const _,
                    root.as_ptr(),
                    &mut info as *mut _ as *mut _,
                    &mut len,
                ) == 0
                    || info.is_null()
                {
                    return None;
                }
                Some(((*info).dwFileVersionMS as u64) << 32 | (*info).dwFileVersionLS as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_conf::{Endpoint, Interface, Key, Peer, KEY_LENGTH};
    use burrow_net::mock::MockNetworkState;
    use burrow_net::RouteRow;

    const TUNNEL: InterfaceLuid = InterfaceLuid(1);
    const ETHERNET: InterfaceLuid = InterfaceLuid(2);
    const VIRTUAL: InterfaceLuid = InterfaceLuid(3);

    fn route(dest: &str, luid: InterfaceLuid, metric: u32) -> RouteRow {
        RouteRow {
            destination: dest.parse().unwrap(),
            luid,
            interface_index: luid.0 as u32,
            metric,
        }
    }

    fn interface(luid: InterfaceLuid, alias: &str, up: bool) -> InterfaceRow {
        InterfaceRow {
            luid,
            index: luid.0 as u32,
            alias: alias.into(),
            mtu: 1500,
            oper_up: up,
        }
    }

    fn ip_interface(luid: InterfaceLuid, metric: u32, loopy: bool) -> IpInterfaceRow {
        IpInterfaceRow {
            luid,
            family: AddressFamily::V4,
            metric,
            mtu: 1500,
            forwarding: loopy,
            weak_host_send: false,
        }
    }

    fn config_with_endpoint(host: &str) -> Config {
        Config {
            name: "test".into(),
            interface: Interface::default(),
            peers: vec![Peer {
                public_key: Key::new([2; KEY_LENGTH]),
                endpoint: Some(Endpoint {
                    host: host.into(),
                    port: 51820,
                }),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_winning_route_through_loopy_interface_flagged() {
        let net = MockNetworkState::new();
        net.add_route(route("0.0.0.0/0", ETHERNET, 10));
        net.add_interface(interface(ETHERNET, "Ethernet", true));
        net.add_ip_interface(ip_interface(ETHERNET, 5, true));

        let flagged = weak_host_send_scan(
            &net,
            AddressFamily::V4,
            &config_with_endpoint("203.0.113.5"),
            TUNNEL,
        );
        assert_eq!(flagged, vec!["Ethernet".to_string()]);
    }

    #[test]
    fn test_tunnel_winning_route_not_flagged() {
        let net = MockNetworkState::new();
        net.add_route(route("0.0.0.0/0", ETHERNET, 10));
        net.add_interface(interface(ETHERNET, "Ethernet", true));
        net.add_ip_interface(ip_interface(ETHERNET, 5, true));
        // More specific route through the tunnel wins.
        net.add_route(route("203.0.113.0/24", TUNNEL, 100));
        net.add_interface(interface(TUNNEL, "Burrow", true));
        net.add_ip_interface(ip_interface(TUNNEL, 1, false));

        let flagged = weak_host_send_scan(
            &net,
            AddressFamily::V4,
            &config_with_endpoint("203.0.113.5"),
            TUNNEL,
        );
        assert!(flagged.is_empty());
    }

    #[test]
    fn test_clean_interface_not_flagged() {
        let net = MockNetworkState::new();
        net.add_route(route("0.0.0.0/0", ETHERNET, 10));
        net.add_interface(interface(ETHERNET, "Ethernet", true));
        net.add_ip_interface(ip_interface(ETHERNET, 5, false));

        let flagged = weak_host_send_scan(
            &net,
            AddressFamily::V4,
            &config_with_endpoint("203.0.113.5"),
            TUNNEL,
        );
        assert!(flagged.is_empty());
    }

    #[test]
    fn test_hostname_endpoints_skipped() {
        let net = MockNetworkState::new();
        net.add_route(route("0.0.0.0/0", ETHERNET, 10));
        net.add_interface(interface(ETHERNET, "Ethernet", true));
        net.add_ip_interface(ip_interface(ETHERNET, 5, true));

        let flagged = weak_host_send_scan(
            &net,
            AddressFamily::V4,
            &config_with_endpoint("vpn.example.com"),
            TUNNEL,
        );
        assert!(flagged.is_empty());
    }

    #[test]
    fn test_equal_prefix_and_metric_last_route_wins() {
        let net = MockNetworkState::new();
        net.add_route(route("0.0.0.0/0", ETHERNET, 10));
        net.add_route(route("0.0.0.0/0", VIRTUAL, 10));
        net.add_interface(interface(ETHERNET, "Ethernet", true));
        net.add_ip_interface(ip_interface(ETHERNET, 5, false));
        net.add_interface(interface(VIRTUAL, "Virtual", true));
        net.add_ip_interface(ip_interface(VIRTUAL, 5, true));

        let flagged = weak_host_send_scan(
            &net,
            AddressFamily::V4,
            &config_with_endpoint("203.0.113.5"),
            TUNNEL,
        );
        assert_eq!(flagged, vec!["Virtual".to_string()]);
    }

    struct ScriptedEnv {
        dns_disabled: Option<bool>,
        virtio: Option<u64>,
    }

    impl HostEnvironment for ScriptedEnv {
        fn dns_cache_service_disabled(&self) -> Option<bool> {
            self.dns_disabled
        }

        fn virtio_driver_version(&self) -> Option<u64> {
            self.virtio
        }
    }

    #[tokio::test]
    async fn test_static_checks_never_fail() {
        let pitfalls = Pitfalls::new(Arc::new(ScriptedEnv {
            dns_disabled: Some(true),
            virtio: Some(VIRTIO_ANCIENT_VERSION + 1),
        }));
        pitfalls.evaluate_static();
        // Nothing to assert beyond "does not panic or block".
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
