//! Binding to the tunnel adapter driver DLL on Windows
//!
//! The driver is an opaque external capability with a small C surface:
//! create/close an adapter, push a flattened configuration blob, toggle
//! state and logging. This module loads the DLL at runtime and marshals
//! [`AdapterConfig`] into the driver's wire structures.

use std::ffi::c_void;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use windows_sys::Win32::Foundation::{FreeLibrary, HMODULE};
use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

use crate::adapter::{Adapter, AdapterConfig, AdapterFactory, AdapterPeer, AdapterState};
use crate::error::{Error, Result};
use crate::types::InterfaceLuid;

use burrow_conf::{Key, KEY_LENGTH};

const DRIVER_DLL: &str = "burrow.dll";

// Flag bits in the driver's interface and peer structures.
const INTERFACE_HAS_PRIVATE_KEY: u32 = 1 << 0;
const INTERFACE_HAS_LISTEN_PORT: u32 = 1 << 1;
const PEER_HAS_PUBLIC_KEY: u32 = 1 << 0;
const PEER_HAS_PRESHARED_KEY: u32 = 1 << 1;
const PEER_HAS_KEEPALIVE: u32 = 1 << 2;
const PEER_HAS_ENDPOINT: u32 = 1 << 3;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 23;

// Windows FILETIME epoch offset to Unix time, in 100ns ticks.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

#[repr(C)]
struct RawInterface {
    flags: u32,
    listen_port: u16,
    private_key: [u8; KEY_LENGTH],
    peer_count: u32,
}

#[repr(C)]
struct RawPeer {
    flags: u32,
    _reserved: u32,
    public_key: [u8; KEY_LENGTH],
    preshared_key: [u8; KEY_LENGTH],
    persistent_keepalive: u16,
    endpoint_family: u16,
    endpoint_port: u16,
    endpoint_addr: [u8; 16],
    tx_bytes: u64,
    rx_bytes: u64,
    last_handshake: u64,
    allowed_ips_count: u32,
}

#[repr(C)]
struct RawAllowedIp {
    address: [u8; 16],
    family: u16,
    cidr: u8,
}

type AdapterHandle = *mut c_void;

type CreateFn = unsafe extern "system" fn(*const u16, *const u16, *const Uuid) -> AdapterHandle;
type CloseFn = unsafe extern "system" fn(AdapterHandle);
type GetLuidFn = unsafe extern "system" fn(AdapterHandle, *mut u64);
type SetLoggingFn = unsafe extern "system" fn(AdapterHandle, u32) -> i32;
type SetConfigurationFn = unsafe extern "system" fn(AdapterHandle, *const u8, u32) -> i32;
type GetConfigurationFn = unsafe extern "system" fn(AdapterHandle, *mut u8, *mut u32) -> i32;
type SetStateFn = unsafe extern "system" fn(AdapterHandle, u32) -> i32;

struct DriverApi {
    module: HMODULE,
    create: CreateFn,
    close: CloseFn,
    get_luid: GetLuidFn,
    set_logging: SetLoggingFn,
    set_configuration: SetConfigurationFn,
    get_configuration: GetConfigurationFn,
    set_state: SetStateFn,
}

unsafe impl Send for DriverApi {}
unsafe impl Sync for DriverApi {}

impl Drop for DriverApi {
    fn drop(&mut self) {
        unsafe { FreeLibrary(self.module) };
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

macro_rules! load_symbol {
    ($module:expr, $name:literal, $ty:ty) => {{
        let symbol = unsafe { GetProcAddress($module, concat!($name, "\0").as_ptr()) };
        match symbol {
            Some(symbol) => unsafe { std::mem::transmute::<_, $ty>(symbol) },
            None => {
                return Err(Error::Adapter(format!(
                    "driver is missing entry point {}",
                    $name
                )))
            }
        }
    }};
}

impl DriverApi {
    fn load() -> Result<Self> {
        let name = wide(DRIVER_DLL);
        let module = unsafe { LoadLibraryW(name.as_ptr()) };
        if module == 0 {
            return Err(Error::Adapter(format!("failed to load {DRIVER_DLL}")));
        }
        Ok(DriverApi {
            module,
            create: load_symbol!(module, "BurrowCreateAdapter", CreateFn),
            close: load_symbol!(module, "BurrowCloseAdapter", CloseFn),
            get_luid: load_symbol!(module, "BurrowGetAdapterLUID", GetLuidFn),
            set_logging: load_symbol!(module, "BurrowSetAdapterLogging", SetLoggingFn),
            set_configuration: load_symbol!(module, "BurrowSetConfiguration", SetConfigurationFn),
            get_configuration: load_symbol!(module, "BurrowGetConfiguration", GetConfigurationFn),
            set_state: load_symbol!(module, "BurrowSetAdapterState", SetStateFn),
        })
    }
}

fn push_raw<T>(buffer: &mut Vec<u8>, value: &T) {
    let bytes = unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    };
    buffer.extend_from_slice(bytes);
}

fn marshal_config(config: &AdapterConfig) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut flags = 0;
    if !config.private_key.is_zero() {
        flags |= INTERFACE_HAS_PRIVATE_KEY;
    }
    if config.listen_port.is_some() {
        flags |= INTERFACE_HAS_LISTEN_PORT;
    }
    push_raw(
        &mut buffer,
        &RawInterface {
            flags,
            listen_port: config.listen_port.unwrap_or(0),
            private_key: *config.private_key.as_bytes(),
            peer_count: config.peers.len() as u32,
        },
    );
    for peer in &config.peers {
        let mut flags = PEER_HAS_PUBLIC_KEY;
        let mut endpoint_family = 0;
        let mut endpoint_port = 0;
        let mut endpoint_addr = [0u8; 16];
        if peer.preshared_key.is_some() {
            flags |= PEER_HAS_PRESHARED_KEY;
        }
        if peer.persistent_keepalive > 0 {
            flags |= PEER_HAS_KEEPALIVE;
        }
        if let Some(endpoint) = peer.endpoint {
            flags |= PEER_HAS_ENDPOINT;
            endpoint_port = endpoint.port();
            match endpoint.ip() {
                IpAddr::V4(v4) => {
                    endpoint_family = AF_INET;
                    endpoint_addr[..4].copy_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    endpoint_family = AF_INET6;
                    endpoint_addr.copy_from_slice(&v6.octets());
                }
            }
        }
        push_raw(
            &mut buffer,
            &RawPeer {
                flags,
                _reserved: 0,
                public_key: *peer.public_key.as_bytes(),
                preshared_key: *peer
                    .preshared_key
                    .unwrap_or_default()
                    .as_bytes(),
                persistent_keepalive: peer.persistent_keepalive,
                endpoint_family,
                endpoint_port,
                endpoint_addr,
                tx_bytes: 0,
                rx_bytes: 0,
                last_handshake: 0,
                allowed_ips_count: peer.allowed_ips.len() as u32,
            },
        );
        for allowed in &peer.allowed_ips {
            let mut address = [0u8; 16];
            let family = match allowed {
                ipnet::IpNet::V4(net) => {
                    address[..4].copy_from_slice(&net.addr().octets());
                    AF_INET
                }
                ipnet::IpNet::V6(net) => {
                    address.copy_from_slice(&net.addr().octets());
                    AF_INET6
                }
            };
            push_raw(
                &mut buffer,
                &RawAllowedIp {
                    address,
                    family,
                    cidr: allowed.prefix_len(),
                },
            );
        }
    }
    buffer
}

unsafe fn read_raw<T>(buffer: &[u8], offset: &mut usize) -> Option<T> {
    let size = std::mem::size_of::<T>();
    if buffer.len() < *offset + size {
        return None;
    }
    let value = std::ptr::read_unaligned(buffer[*offset..].as_ptr() as *const T);
    *offset += size;
    Some(value)
}

fn unmarshal_config(buffer: &[u8]) -> Result<AdapterConfig> {
    let mut offset = 0;
    let raw: RawInterface = unsafe { read_raw(buffer, &mut offset) }
        .ok_or_else(|| Error::Adapter("short configuration blob".into()))?;
    let mut config = AdapterConfig {
        private_key: Key::new(raw.private_key),
        listen_port: (raw.flags & INTERFACE_HAS_LISTEN_PORT != 0).then_some(raw.listen_port),
        peers: Vec::with_capacity(raw.peer_count as usize),
    };
    for _ in 0..raw.peer_count {
        let raw_peer: RawPeer = unsafe { read_raw(buffer, &mut offset) }
            .ok_or_else(|| Error::Adapter("short configuration blob".into()))?;
        let endpoint = (raw_peer.flags & PEER_HAS_ENDPOINT != 0)
            .then(|| {
                let ip = match raw_peer.endpoint_family {
                    AF_INET6 => IpAddr::from(raw_peer.endpoint_addr),
                    _ => {
                        let mut v4 = [0u8; 4];
                        v4.copy_from_slice(&raw_peer.endpoint_addr[..4]);
                        IpAddr::from(v4)
                    }
                };
                SocketAddr::new(ip, raw_peer.endpoint_port)
            });
        let mut allowed_ips = Vec::with_capacity(raw_peer.allowed_ips_count as usize);
        for _ in 0..raw_peer.allowed_ips_count {
            let raw_ip: RawAllowedIp = unsafe { read_raw(buffer, &mut offset) }
                .ok_or_else(|| Error::Adapter("short configuration blob".into()))?;
            let net = match raw_ip.family {
                AF_INET6 => ipnet::Ipv6Net::new(raw_ip.address.into(), raw_ip.cidr)
                    .map(ipnet::IpNet::V6),
                _ => {
                    let mut v4 = [0u8; 4];
                    v4.copy_from_slice(&raw_ip.address[..4]);
                    ipnet::Ipv4Net::new(v4.into(), raw_ip.cidr).map(ipnet::IpNet::V4)
                }
            }
            .map_err(|e| Error::Adapter(format!("bad allowed IP in blob: {e}")))?;
            allowed_ips.push(net);
        }
        config.peers.push(AdapterPeer {
            public_key: Key::new(raw_peer.public_key),
            preshared_key: (raw_peer.flags & PEER_HAS_PRESHARED_KEY != 0)
                .then(|| Key::new(raw_peer.preshared_key)),
            endpoint,
            persistent_keepalive: raw_peer.persistent_keepalive,
            allowed_ips,
            tx_bytes: raw_peer.tx_bytes,
            rx_bytes: raw_peer.rx_bytes,
            last_handshake: (raw_peer.last_handshake > FILETIME_UNIX_OFFSET).then(|| {
                SystemTime::UNIX_EPOCH
                    + Duration::from_nanos((raw_peer.last_handshake - FILETIME_UNIX_OFFSET) * 100)
            }),
        });
    }
    Ok(config)
}

/// One live driver adapter.
pub struct DriverAdapter {
    api: Arc<DriverApi>,
    handle: AdapterHandle,
    luid: InterfaceLuid,
    closed: std::sync::atomic::AtomicBool,
}

unsafe impl Send for DriverAdapter {}
unsafe impl Sync for DriverAdapter {}

impl Adapter for DriverAdapter {
    fn luid(&self) -> InterfaceLuid {
        self.luid
    }

    fn set_logging(&self, enabled: bool) -> Result<()> {
        let status = unsafe { (self.api.set_logging)(self.handle, enabled as u32) };
        if status != 0 {
            return Err(Error::Adapter(format!("SetAdapterLogging failed with {status}")));
        }
        Ok(())
    }

    fn set_configuration(&self, config: &AdapterConfig) -> Result<()> {
        let blob = marshal_config(config);
        let status = unsafe {
            (self.api.set_configuration)(self.handle, blob.as_ptr(), blob.len() as u32)
        };
        if status != 0 {
            return Err(Error::Adapter(format!("SetConfiguration failed with {status}")));
        }
        Ok(())
    }

    fn set_state(&self, state: AdapterState) -> Result<()> {
        let raw_state = match state {
            AdapterState::Down => 0,
            AdapterState::Up => 1,
        };
        let status = unsafe { (self.api.set_state)(self.handle, raw_state) };
        if status != 0 {
            return Err(Error::Adapter(format!("SetAdapterState failed with {status}")));
        }
        Ok(())
    }

    fn configuration(&self) -> Result<AdapterConfig> {
        let mut size: u32 = 0;
        unsafe { (self.api.get_configuration)(self.handle, std::ptr::null_mut(), &mut size) };
        let mut buffer = vec![0u8; size as usize];
        let status =
            unsafe { (self.api.get_configuration)(self.handle, buffer.as_mut_ptr(), &mut size) };
        if status != 0 {
            return Err(Error::Adapter(format!("GetConfiguration failed with {status}")));
        }
        unmarshal_config(&buffer[..size as usize])
    }

    fn close(&self) {
        use std::sync::atomic::Ordering;
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe { (self.api.close)(self.handle) };
        }
    }
}

impl Drop for DriverAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Adapter factory backed by the driver DLL. Loads the DLL lazily on the
/// first creation attempt.
pub struct DriverAdapterFactory {
    api: std::sync::OnceLock<Arc<DriverApi>>,
}

impl DriverAdapterFactory {
    pub fn new() -> Self {
        DriverAdapterFactory {
            api: std::sync::OnceLock::new(),
        }
    }

    fn api(&self) -> Result<Arc<DriverApi>> {
        if let Some(api) = self.api.get() {
            return Ok(api.clone());
        }
        let api = Arc::new(DriverApi::load()?);
        Ok(self.api.get_or_init(|| api).clone())
    }
}

impl Default for DriverAdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory for DriverAdapterFactory {
    fn create(
        &self,
        name: &str,
        tunnel_type: &str,
        requested_guid: Uuid,
    ) -> Result<Arc<dyn Adapter>> {
        let api = self.api()?;
        let name_w = wide(name);
        let type_w = wide(tunnel_type);
        let handle = unsafe { (api.create)(name_w.as_ptr(), type_w.as_ptr(), &requested_guid) };
        if handle.is_null() {
            return Err(Error::Adapter(format!("failed to create adapter {name:?}")));
        }
        let mut luid = 0u64;
        unsafe { (api.get_luid)(handle, &mut luid) };
        Ok(Arc::new(DriverAdapter {
            api,
            handle,
            luid: InterfaceLuid(luid),
            closed: std::sync::atomic::AtomicBool::new(false),
        }))
    }
}
