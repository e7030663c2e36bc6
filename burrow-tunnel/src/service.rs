//! The tunnel service state machine
//!
//! One [`TunnelService`] run owns the whole lifecycle of one tunnel:
//!
//! ```text
//! StartPending ── startup sequence ──▶ Running ── stop/shutdown ──▶ StopPending ──▶ Stopped
//!        │                                │
//!        └── any failure ────────────────┴──▶ StopPending (classified failure)
//! ```
//!
//! Startup is strictly sequential; any failure short-circuits to teardown
//! with a [`FailureClass`] that becomes the reported exit code. Teardown
//! fans independent cleanup tasks out in parallel and joins them under a
//! hard deadline: the service may fail, but it must never hang forever.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use burrow_conf::{store, Backoff, Config, DnsCache, HostLookup, Resolver, SystemLookup};
use burrow_net::{
    derive_adapter_config, deterministic_guid, Adapter, AdapterFactory, AdapterState,
    ChangeNotifier, InterfaceLuid, NetworkState, TUNNEL_TYPE,
};

use crate::error::{Error, FailureClass, ServiceFailure};
use crate::logging;
use crate::pitfalls::{HostEnvironment, NullEnvironment, Pitfalls};
use crate::script::ScriptRunner;
use crate::watcher::{InterfaceWatcher, WatcherEvent};

/// Hard upper bound on teardown; exceeded means suspected deadlock.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Adapter creation attempts when started at boot (one otherwise).
pub const ADAPTER_CREATE_ATTEMPTS_AT_BOOT: u32 = 15;

/// Cap on the adapter-creation backoff.
pub const ADAPTER_CREATE_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Externally visible service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    StartPending,
    Running,
    StopPending,
    Stopped,
}

/// Accepted-control bits reported alongside the state. The values match
/// the Windows service manager's accepted-controls mask.
pub const ACCEPT_STOP: u32 = 0x1;
pub const ACCEPT_SHUTDOWN: u32 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub accepts: u32,
}

impl ServiceStatus {
    fn new(state: ServiceState, accepts: u32) -> Self {
        ServiceStatus { state, accepts }
    }
}

/// Where status reports go: the SCM when running as a service, a recorder
/// in tests.
pub trait StatusSink: Send + Sync {
    fn report(&self, status: ServiceStatus);
}

/// Requests delivered over the service control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Stop,
    Shutdown,
    /// Echo the current status through the sink.
    Interrogate,
}

/// Host facilities the orchestrator needs but does not own: privilege
/// dropping and firewall/route isolation enforcement.
pub trait Platform: Send + Sync {
    fn enable_firewall(&self, config: &Config, tunnel: InterfaceLuid) -> std::io::Result<()>;
    fn drop_privileges(&self) -> std::io::Result<()>;
}

/// No-op platform, for tests and hosts where neither facility applies.
pub struct NullPlatform;

impl Platform for NullPlatform {
    fn enable_firewall(&self, _config: &Config, _tunnel: InterfaceLuid) -> std::io::Result<()> {
        Ok(())
    }

    fn drop_privileges(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Per-run options, all injected: nothing here is read ambiently from host
/// state.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Started at system boot: widens retry tolerances for DNS and adapter
    /// creation while the network stack comes up.
    pub boot_mode: bool,
    /// The dangerous-script-execution gate.
    pub allow_scripts: bool,
    /// Teardown deadline.
    pub shutdown_deadline: Duration,
    /// Backoff policy between adapter-creation attempts; tests substitute
    /// a zero-delay policy.
    pub adapter_create_backoff: Backoff,
    /// File log sink; `None` leaves the ambient subscriber in place.
    pub log_file: Option<std::path::PathBuf>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            boot_mode: false,
            allow_scripts: false,
            shutdown_deadline: SHUTDOWN_DEADLINE,
            adapter_create_backoff: Backoff::new(ADAPTER_CREATE_BACKOFF_CAP),
            log_file: None,
        }
    }
}

/// How teardown ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    Clean,
    /// Cleanup missed the deadline; the named tasks never finished. The
    /// process should dump diagnostics and exit immediately.
    DeadlockSuspected { pending: Vec<&'static str> },
}

/// Result of one orchestration run.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: TeardownOutcome,
    pub failure: Option<ServiceFailure>,
}

impl RunReport {
    /// The service-specific exit code to report, if the run failed.
    pub fn exit_code(&self) -> Option<u32> {
        self.failure.as_ref().map(|f| f.exit_code())
    }
}

#[derive(Default)]
struct Session {
    config: Option<Config>,
    adapter: Option<Arc<dyn Adapter>>,
    watcher: Option<InterfaceWatcher>,
    watcher_events: Option<mpsc::Receiver<WatcherEvent>>,
}

/// The orchestrator. All collaborators are injected trait objects.
pub struct TunnelService {
    options: ServiceOptions,
    net: Arc<dyn NetworkState>,
    notifier: Arc<dyn ChangeNotifier>,
    factory: Arc<dyn AdapterFactory>,
    platform: Arc<dyn Platform>,
    environment: Arc<dyn HostEnvironment>,
    lookup: Arc<dyn HostLookup>,
    status: Arc<dyn StatusSink>,
}

impl TunnelService {
    pub fn new(
        net: Arc<dyn NetworkState>,
        notifier: Arc<dyn ChangeNotifier>,
        factory: Arc<dyn AdapterFactory>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        TunnelService {
            options: ServiceOptions::default(),
            net,
            notifier,
            factory,
            platform: Arc::new(NullPlatform),
            environment: Arc::new(NullEnvironment),
            lookup: Arc::new(SystemLookup),
            status,
        }
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_environment(mut self, environment: Arc<dyn HostEnvironment>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn HostLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Run the tunnel declared at `config_path` until a control request or
    /// fatal error ends it. Always tears down before returning.
    pub async fn run(
        &self,
        config_path: &Path,
        mut control: mpsc::Receiver<ControlRequest>,
    ) -> RunReport {
        self.status
            .report(ServiceStatus::new(ServiceState::StartPending, 0));

        let mut session = Session::default();
        let mut failure = self.startup(config_path, &mut session).await.err();

        if failure.is_none() {
            if let Some(events) = session.watcher_events.take() {
                failure = self.control_loop(&mut control, events).await;
            }
        }

        if let Some(failure) = &failure {
            error!("{}", failure);
        }
        self.status
            .report(ServiceStatus::new(ServiceState::StopPending, 0));
        info!("shutting down");

        let outcome = self.teardown(session, failure.is_some()).await;
        if outcome == TeardownOutcome::Clean {
            self.status
                .report(ServiceStatus::new(ServiceState::Stopped, 0));
        }
        RunReport { outcome, failure }
    }

    async fn startup(&self, config_path: &Path, session: &mut Session) -> Result<(), ServiceFailure> {
        if let Some(log_file) = &self.options.log_file {
            logging::init_file(log_file)
                .map_err(|e| ServiceFailure::new(FailureClass::LogSink, Error::Io(e)))?;
        }

        let mut config = store::load_from_path(config_path)
            .map_err(|e| ServiceFailure::new(FailureClass::LoadConfiguration, e))?;
        config.deduplicate_network_entries();
        info!("starting tunnel {:?}", config.name);
        session.config = Some(config.clone());

        Pitfalls::new(self.environment.clone()).evaluate_static();

        info!("watching network interfaces");
        let (watcher, watcher_events) =
            InterfaceWatcher::start(self.net.clone(), self.notifier.clone());
        session.watcher = Some(watcher);
        session.watcher_events = Some(watcher_events);

        info!("resolving DNS names");
        let resolver = Resolver::new(Arc::new(DnsCache::new()), self.lookup.clone())
            .with_boot_mode(self.options.boot_mode);
        resolver
            .resolve_all(&mut config)
            .await
            .map_err(|e| ServiceFailure::new(FailureClass::DnsLookup, e))?;

        info!("creating network adapter");
        let adapter = self
            .create_adapter(&config)
            .await
            .map_err(|e| ServiceFailure::new(FailureClass::CreateAdapter, e))?;
        session.adapter = Some(adapter.clone());

        adapter
            .set_logging(true)
            .map_err(|e| ServiceFailure::new(FailureClass::CreateAdapter, e))?;

        let scripts = ScriptRunner::new(self.options.allow_scripts);
        scripts
            .run(&config.interface.pre_up, &config.name)
            .await
            .map_err(|e| ServiceFailure::new(FailureClass::RunScript, e))?;

        self.platform
            .enable_firewall(&config, adapter.luid())
            .map_err(|e| ServiceFailure::new(FailureClass::Firewall, Error::Io(e)))?;

        info!("dropping privileges");
        self.platform
            .drop_privileges()
            .map_err(|e| ServiceFailure::new(FailureClass::DropPrivileges, Error::Io(e)))?;

        info!("setting interface configuration");
        let adapter_config = derive_adapter_config(&config)
            .map_err(|e| ServiceFailure::new(FailureClass::SetConfiguration, e))?;
        adapter
            .set_configuration(&adapter_config)
            .map_err(|e| ServiceFailure::new(FailureClass::SetConfiguration, e))?;

        info!("bringing adapter up");
        adapter
            .set_state(AdapterState::Up)
            .map_err(|e| ServiceFailure::new(FailureClass::BringUp, e))?;

        if let Some(watcher) = session.watcher.as_mut() {
            watcher.configure(&config, adapter.luid());
        }

        scripts
            .run(&config.interface.post_up, &config.name)
            .await
            .map_err(|e| ServiceFailure::new(FailureClass::RunScript, e))?;

        Ok(())
    }

    async fn create_adapter(&self, config: &Config) -> Result<Arc<dyn Adapter>, Error> {
        let attempts = if self.options.boot_mode {
            ADAPTER_CREATE_ATTEMPTS_AT_BOOT
        } else {
            1
        };
        let backoff = self.options.adapter_create_backoff;
        let guid = deterministic_guid(&config.name);

        let mut attempt = 0;
        loop {
            match self.factory.create(&config.name, TUNNEL_TYPE, guid) {
                Ok(adapter) => return Ok(adapter),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(err.into());
                    }
                    let delay = backoff.delay(attempt);
                    warn!(
                        "retrying adapter creation (attempt {}, waiting {:?}): {}",
                        attempt + 1,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Service the control channel and watcher events until something ends
    /// the run. Returns the failure when the watcher reported one.
    async fn control_loop(
        &self,
        control: &mut mpsc::Receiver<ControlRequest>,
        mut watcher_events: mpsc::Receiver<WatcherEvent>,
    ) -> Option<ServiceFailure> {
        let mut current =
            ServiceStatus::new(ServiceState::StartPending, ACCEPT_STOP | ACCEPT_SHUTDOWN);
        self.status.report(current);
        let mut started = false;

        loop {
            tokio::select! {
                request = control.recv() => match request {
                    Some(ControlRequest::Stop) | Some(ControlRequest::Shutdown) | None => {
                        return None;
                    }
                    Some(ControlRequest::Interrogate) => self.status.report(current),
                },
                event = watcher_events.recv() => match event {
                    Some(WatcherEvent::Started) => {
                        if !started {
                            started = true;
                            current = ServiceStatus::new(
                                ServiceState::Running,
                                ACCEPT_STOP | ACCEPT_SHUTDOWN,
                            );
                            self.status.report(current);
                            info!("startup complete");
                        }
                    }
                    Some(WatcherEvent::Error(failure)) => return Some(failure),
                    None => return None,
                },
            }
        }
    }

    /// Best-effort parallel teardown under the deadline. Pre/PostDown are
    /// skipped when the adapter never came up or a fatal error occurred.
    async fn teardown(&self, session: Session, had_fatal_error: bool) -> TeardownOutcome {
        let Session {
            config,
            adapter,
            watcher,
            watcher_events: _,
        } = session;

        let run_scripts = !had_fatal_error && adapter.is_some() && config.is_some();
        let mut cleanup: JoinSet<&'static str> = JoinSet::new();
        let mut pending: Vec<&'static str> = Vec::new();

        if run_scripts {
            if let Some(config) = config.clone() {
                let scripts = ScriptRunner::new(self.options.allow_scripts);
                pending.push("pre-down script");
                cleanup.spawn(async move {
                    if let Err(err) = scripts.run(&config.interface.pre_down, &config.name).await {
                        warn!("PreDown script failed: {}", err);
                    }
                    "pre-down script"
                });
            }
        }

        if let Some(watcher) = watcher {
            pending.push("interface watcher");
            cleanup.spawn(async move {
                watcher.destroy().await;
                "interface watcher"
            });
        }

        if let Some(adapter) = adapter {
            pending.push("adapter close");
            cleanup.spawn_blocking(move || {
                adapter.close();
                "adapter close"
            });
        }

        if run_scripts {
            if let Some(config) = config {
                let scripts = ScriptRunner::new(self.options.allow_scripts);
                pending.push("post-down script");
                cleanup.spawn(async move {
                    if let Err(err) = scripts.run(&config.interface.post_down, &config.name).await {
                        warn!("PostDown script failed: {}", err);
                    }
                    "post-down script"
                });
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.shutdown_deadline;
        loop {
            if pending.is_empty() {
                break;
            }
            match tokio::time::timeout_at(deadline, cleanup.join_next()).await {
                Ok(Some(Ok(name))) => pending.retain(|n| *n != name),
                Ok(Some(Err(join_err))) => {
                    warn!("cleanup task failed: {}", join_err);
                }
                Ok(None) => {
                    if !pending.is_empty() {
                        warn!("cleanup finished with unaccounted tasks: {:?}", pending);
                    }
                    break;
                }
                Err(_) => {
                    error!(
                        "failed to shut down after {:?}; cleanup still pending: {:?}; \
                         probably deadlocked",
                        self.options.shutdown_deadline, pending
                    );
                    cleanup.abort_all();
                    return TeardownOutcome::DeadlockSuspected { pending };
                }
            }
        }
        info!("cleanup complete");
        TeardownOutcome::Clean
    }
}
