//! Mock implementations of the network and adapter boundary
//!
//! These mocks let the service layer run its full lifecycle in tests with
//! no OS involvement: a scriptable routing/interface table, a manual
//! change-notification source, an adapter that records every call, and a
//! deterministic hostname lookup.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use burrow_conf::{HostLookup, LookupError};

use crate::adapter::{Adapter, AdapterConfig, AdapterFactory, AdapterState};
use crate::error::{Error, Result};
use crate::event::{ChangeNotifier, NetEvent, EVENT_CHANNEL_CAPACITY};
use crate::state::NetworkState;
use crate::types::{AddressFamily, InterfaceLuid, InterfaceRow, IpInterfaceRow, RouteRow};

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Scriptable host network state.
#[derive(Default)]
pub struct MockNetworkState {
    routes: Mutex<Vec<RouteRow>>,
    interfaces: Mutex<HashMap<InterfaceLuid, InterfaceRow>>,
    ip_interfaces: Mutex<HashMap<(InterfaceLuid, AddressFamily), IpInterfaceRow>>,
    mtu_writes: Mutex<Vec<(InterfaceLuid, AddressFamily, u32)>>,
}

impl MockNetworkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, route: RouteRow) {
        lock(&self.routes).push(route);
    }

    pub fn clear_routes(&self) {
        lock(&self.routes).clear();
    }

    pub fn add_interface(&self, row: InterfaceRow) {
        lock(&self.interfaces).insert(row.luid, row);
    }

    pub fn add_ip_interface(&self, row: IpInterfaceRow) {
        lock(&self.ip_interfaces).insert((row.luid, row.family), row);
    }

    /// Every `set_interface_mtu` call observed, in order.
    pub fn mtu_writes(&self) -> Vec<(InterfaceLuid, AddressFamily, u32)> {
        lock(&self.mtu_writes).clone()
    }
}

impl NetworkState for MockNetworkState {
    fn routes(&self, family: AddressFamily) -> Result<Vec<RouteRow>> {
        Ok(lock(&self.routes)
            .iter()
            .filter(|r| {
                matches!(
                    (r.destination, family),
                    (ipnet::IpNet::V4(_), AddressFamily::V4)
                        | (ipnet::IpNet::V6(_), AddressFamily::V6)
                )
            })
            .cloned()
            .collect())
    }

    fn interface(&self, luid: InterfaceLuid) -> Result<InterfaceRow> {
        lock(&self.interfaces)
            .get(&luid)
            .cloned()
            .ok_or(Error::NoSuchInterface(luid.0))
    }

    fn ip_interface(&self, luid: InterfaceLuid, family: AddressFamily) -> Result<IpInterfaceRow> {
        lock(&self.ip_interfaces)
            .get(&(luid, family))
            .cloned()
            .ok_or(Error::NoSuchInterface(luid.0))
    }

    fn set_interface_mtu(
        &self,
        luid: InterfaceLuid,
        family: AddressFamily,
        mtu: u32,
    ) -> Result<()> {
        lock(&self.mtu_writes).push((luid, family, mtu));
        if let Some(row) = lock(&self.ip_interfaces).get_mut(&(luid, family)) {
            row.mtu = mtu;
        }
        Ok(())
    }
}

/// Manually driven change-notification source.
pub struct MockNotifier {
    tx: Mutex<Option<broadcast::Sender<NetEvent>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MockNotifier {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: NetEvent) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Drop the sending side, closing every subscriber's stream. Simulates
    /// the notification source dying underneath the watcher.
    pub fn close(&self) {
        lock(&self.tx).take();
    }
}

impl Default for MockNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier for MockNotifier {
    fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already closed: hand back a receiver whose sender is gone.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }
}

/// Adapter that records every interaction.
pub struct MockAdapter {
    luid: InterfaceLuid,
    logging: AtomicBool,
    state: Mutex<AdapterState>,
    configuration: Mutex<Option<AdapterConfig>>,
    closed: AtomicBool,
    close_delay: Mutex<Option<Duration>>,
}

impl MockAdapter {
    pub fn new(luid: InterfaceLuid) -> Arc<Self> {
        Arc::new(MockAdapter {
            luid,
            logging: AtomicBool::new(false),
            state: Mutex::new(AdapterState::Down),
            configuration: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_delay: Mutex::new(None),
        })
    }

    /// Make `close` block for `delay`, to exercise the shutdown deadline.
    pub fn set_close_delay(&self, delay: Duration) {
        *lock(&self.close_delay) = Some(delay);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn logging_enabled(&self) -> bool {
        self.logging.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> AdapterState {
        *lock(&self.state)
    }

    pub fn pushed_configuration(&self) -> Option<AdapterConfig> {
        lock(&self.configuration).clone()
    }
}

impl Adapter for MockAdapter {
    fn luid(&self) -> InterfaceLuid {
        self.luid
    }

    fn set_logging(&self, enabled: bool) -> Result<()> {
        self.logging.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn set_configuration(&self, config: &AdapterConfig) -> Result<()> {
        *lock(&self.configuration) = Some(config.clone());
        Ok(())
    }

    fn set_state(&self, state: AdapterState) -> Result<()> {
        *lock(&self.state) = state;
        Ok(())
    }

    fn configuration(&self) -> Result<AdapterConfig> {
        lock(&self.configuration)
            .clone()
            .ok_or_else(|| Error::Adapter("no configuration set".into()))
    }

    fn close(&self) {
        let delay = *lock(&self.close_delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out one prepared [`MockAdapter`], optionally failing the
/// first N creation attempts to exercise the retry loop.
pub struct MockAdapterFactory {
    adapter: Arc<MockAdapter>,
    failures_remaining: AtomicUsize,
    create_calls: AtomicUsize,
}

impl MockAdapterFactory {
    pub fn new(adapter: Arc<MockAdapter>) -> Arc<Self> {
        Self::failing_times(adapter, 0)
    }

    pub fn failing_times(adapter: Arc<MockAdapter>, failures: usize) -> Arc<Self> {
        Arc::new(MockAdapterFactory {
            adapter,
            failures_remaining: AtomicUsize::new(failures),
            create_calls: AtomicUsize::new(0),
        })
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn create(
        &self,
        _name: &str,
        _tunnel_type: &str,
        _requested_guid: Uuid,
    ) -> Result<Arc<dyn Adapter>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Adapter("transient creation failure".into()));
        }
        Ok(self.adapter.clone())
    }
}

/// Deterministic hostname lookup returning a fixed table.
#[derive(Default)]
pub struct MockLookup {
    table: Mutex<HashMap<String, IpAddr>>,
    calls: AtomicUsize,
}

impl MockLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, addr: IpAddr) {
        lock(&self.table).insert(host.to_string(), addr);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostLookup for MockLookup {
    async fn lookup(&self, host: &str) -> std::result::Result<Vec<IpAddr>, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.table).get(host) {
            Some(addr) => Ok(vec![*addr]),
            None => Err(LookupError::NotFound),
        }
    }
}
