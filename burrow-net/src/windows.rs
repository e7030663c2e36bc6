//! Windows implementation of the network boundary via IP Helper
//!
//! Routing and interface rows come from `GetIpForwardTable2` /
//! `GetIfEntry2` / `GetIpInterfaceEntry`; change notifications are
//! registered with `NotifyRouteChange2` and `NotifyIpInterfaceChange` and
//! forwarded into the broadcast channel. Callbacks run on OS threads, so
//! they do nothing but translate and send.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tokio::sync::broadcast;

use windows_sys::Win32::Foundation::{ERROR_SUCCESS, HANDLE};
use windows_sys::Win32::NetworkManagement::IpHelper::{
    CancelMibChangeNotify2, FreeMibTable, GetIfEntry2, GetIpForwardTable2, GetIpInterfaceEntry,
    InitializeIpInterfaceEntry, NotifyIpInterfaceChange, NotifyRouteChange2,
    SetIpInterfaceEntry, MIB_IF_ROW2, MIB_IPFORWARD_ROW2, MIB_IPFORWARD_TABLE2,
    MIB_IPINTERFACE_ROW, MIB_NOTIFICATION_TYPE, MibParameterNotification,
};
use windows_sys::Win32::Networking::WinSock::{AF_INET, AF_INET6, AF_UNSPEC, SOCKADDR_INET};

use crate::error::{Error, Result};
use crate::event::{ChangeNotifier, NetEvent, EVENT_CHANNEL_CAPACITY};
use crate::state::NetworkState;
use crate::types::{AddressFamily, InterfaceLuid, InterfaceRow, IpInterfaceRow, RouteRow};

// NET_IF_OPER_STATUS: operational, per RFC 2863.
const IF_OPER_STATUS_UP: i32 = 1;

fn family_constant(family: AddressFamily) -> u16 {
    match family {
        AddressFamily::V4 => AF_INET,
        AddressFamily::V6 => AF_INET6,
    }
}

unsafe fn prefix_to_ipnet(addr: &SOCKADDR_INET, prefix_len: u8) -> Option<IpNet> {
    match addr.si_family {
        AF_INET => {
            let octets = addr.Ipv4.sin_addr.S_un.S_addr.to_ne_bytes();
            Ipv4Net::new(Ipv4Addr::from(octets), prefix_len)
                .ok()
                .map(IpNet::V4)
        }
        AF_INET6 => {
            let octets = addr.Ipv6.sin6_addr.u.Byte;
            Ipv6Net::new(Ipv6Addr::from(octets), prefix_len)
                .ok()
                .map(IpNet::V6)
        }
        _ => None,
    }
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

/// Host network state backed by the IP Helper API.
pub struct WindowsNetworkState;

impl NetworkState for WindowsNetworkState {
    fn routes(&self, family: AddressFamily) -> Result<Vec<RouteRow>> {
        let mut table: *mut MIB_IPFORWARD_TABLE2 = std::ptr::null_mut();
        let status = unsafe { GetIpForwardTable2(family_constant(family), &mut table) };
        if status != ERROR_SUCCESS {
            return Err(Error::Query(format!(
                "GetIpForwardTable2 failed with {status}"
            )));
        }
        let mut routes = Vec::new();
        unsafe {
            let rows = std::slice::from_raw_parts(
                (*table).Table.as_ptr(),
                (*table).NumEntries as usize,
            );
            for row in rows {
                let Some(destination) = prefix_to_ipnet(
                    &row.DestinationPrefix.Prefix,
                    row.DestinationPrefix.PrefixLength,
                ) else {
                    continue;
                };
                routes.push(RouteRow {
                    destination,
                    luid: InterfaceLuid(row.InterfaceLuid.Value),
                    interface_index: row.InterfaceIndex,
                    metric: row.Metric,
                });
            }
            FreeMibTable(table as *const _);
        }
        Ok(routes)
    }

    fn interface(&self, luid: InterfaceLuid) -> Result<InterfaceRow> {
        let mut row: MIB_IF_ROW2 = unsafe { std::mem::zeroed() };
        row.InterfaceLuid.Value = luid.0;
        let status = unsafe { GetIfEntry2(&mut row) };
        if status != ERROR_SUCCESS {
            return Err(Error::NoSuchInterface(luid.0));
        }
        Ok(InterfaceRow {
            luid,
            index: row.InterfaceIndex,
            alias: wide_to_string(&row.Alias),
            mtu: row.Mtu,
            oper_up: row.OperStatus == IF_OPER_STATUS_UP,
        })
    }

    fn ip_interface(&self, luid: InterfaceLuid, family: AddressFamily) -> Result<IpInterfaceRow> {
        let mut row: MIB_IPINTERFACE_ROW = unsafe { std::mem::zeroed() };
        unsafe { InitializeIpInterfaceEntry(&mut row) };
        row.InterfaceLuid.Value = luid.0;
        row.Family = family_constant(family);
        let status = unsafe { GetIpInterfaceEntry(&mut row) };
        if status != ERROR_SUCCESS {
            return Err(Error::NoSuchInterface(luid.0));
        }
        Ok(IpInterfaceRow {
            luid,
            family,
            metric: row.Metric,
            mtu: row.NlMtu,
            forwarding: row.ForwardingEnabled != 0,
            weak_host_send: row.WeakHostSend != 0,
        })
    }

    fn set_interface_mtu(
        &self,
        luid: InterfaceLuid,
        family: AddressFamily,
        mtu: u32,
    ) -> Result<()> {
        let mut row: MIB_IPINTERFACE_ROW = unsafe { std::mem::zeroed() };
        unsafe { InitializeIpInterfaceEntry(&mut row) };
        row.InterfaceLuid.Value = luid.0;
        row.Family = family_constant(family);
        let status = unsafe { GetIpInterfaceEntry(&mut row) };
        if status != ERROR_SUCCESS {
            return Err(Error::NoSuchInterface(luid.0));
        }
        row.NlMtu = mtu;
        // SitePrefixLength must be zeroed for IPv4 rows before Set.
        row.SitePrefixLength = 0;
        let status = unsafe { SetIpInterfaceEntry(&mut row) };
        if status != ERROR_SUCCESS {
            return Err(Error::Query(format!(
                "SetIpInterfaceEntry failed with {status}"
            )));
        }
        Ok(())
    }
}

struct NotifierContext {
    tx: broadcast::Sender<NetEvent>,
}

unsafe extern "system" fn route_change_callback(
    context: *const core::ffi::c_void,
    row: *const MIB_IPFORWARD_ROW2,
    _notification_type: MIB_NOTIFICATION_TYPE,
) {
    let context = &*(context as *const NotifierContext);
    let (family, default_route) = if row.is_null() {
        (AddressFamily::V4, true)
    } else {
        let family = match (*row).DestinationPrefix.Prefix.si_family {
            AF_INET6 => AddressFamily::V6,
            _ => AddressFamily::V4,
        };
        (family, (*row).DestinationPrefix.PrefixLength == 0)
    };
    let _ = context.tx.send(NetEvent::RouteChanged {
        family,
        default_route,
    });
}

unsafe extern "system" fn interface_change_callback(
    context: *const core::ffi::c_void,
    _row: *const MIB_IPINTERFACE_ROW,
    notification_type: MIB_NOTIFICATION_TYPE,
) {
    let context = &*(context as *const NotifierContext);
    let _ = context.tx.send(NetEvent::InterfaceChanged {
        param_change: notification_type == MibParameterNotification,
    });
}

/// Change-notification source registered with IP Helper.
pub struct WindowsNotifier {
    tx: broadcast::Sender<NetEvent>,
    context: *mut NotifierContext,
    route_handle: HANDLE,
    interface_handle: HANDLE,
}

// The raw handles and context pointer are only touched in new/Drop.
unsafe impl Send for WindowsNotifier {}
unsafe impl Sync for WindowsNotifier {}

impl WindowsNotifier {
    pub fn new() -> Result<Self> {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let context = Box::into_raw(Box::new(NotifierContext { tx: tx.clone() }));

        let mut route_handle: HANDLE = 0;
        let status = unsafe {
            NotifyRouteChange2(
                AF_UNSPEC,
                Some(route_change_callback),
                context as *const _,
                0,
                &mut route_handle,
            )
        };
        if status != ERROR_SUCCESS {
            unsafe { drop(Box::from_raw(context)) };
            return Err(Error::Subscription(format!(
                "NotifyRouteChange2 failed with {status}"
            )));
        }

        let mut interface_handle: HANDLE = 0;
        let status = unsafe {
            NotifyIpInterfaceChange(
                AF_UNSPEC,
                Some(interface_change_callback),
                context as *const _,
                0,
                &mut interface_handle,
            )
        };
        if status != ERROR_SUCCESS {
            unsafe {
                CancelMibChangeNotify2(route_handle);
                drop(Box::from_raw(context));
            }
            return Err(Error::Subscription(format!(
                "NotifyIpInterfaceChange failed with {status}"
            )));
        }

        Ok(WindowsNotifier {
            tx,
            context,
            route_handle,
            interface_handle,
        })
    }
}

impl ChangeNotifier for WindowsNotifier {
    fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.tx.subscribe()
    }
}

impl Drop for WindowsNotifier {
    fn drop(&mut self) {
        unsafe {
            CancelMibChangeNotify2(self.route_handle);
            CancelMibChangeNotify2(self.interface_handle);
            drop(Box::from_raw(self.context));
        }
    }
}
