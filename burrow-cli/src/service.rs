//! Windows service entry for the tunnel
//!
//! The service manager starts the binary with `service-run <config>`; this
//! module registers the control handler, translates SCM controls into
//! [`ControlRequest`]s, and reports orchestrator states back as SCM
//! statuses. Installation and removal of the service registration are
//! handled by the installer, not here.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState as ScmState,
    ServiceStatus as ScmStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::{define_windows_service, service_dispatcher};

use burrow_net::driver::DriverAdapterFactory;
use burrow_net::windows::{WindowsNetworkState, WindowsNotifier};
use burrow_tunnel::pitfalls::WindowsEnvironment;
use burrow_tunnel::service::ServiceStatus;
use burrow_tunnel::{
    ControlRequest, ServiceOptions, ServiceState, StatusSink, TeardownOutcome, TunnelService,
    ACCEPT_SHUTDOWN, ACCEPT_STOP, DEADLOCK_EXIT_CODE,
};

const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;

/// Boot starts are detected by system uptime: a start within the first ten
/// minutes after boot gets the widened retry tolerances.
const BOOT_WINDOW: Duration = Duration::from_secs(10 * 60);

struct ServiceArgs {
    config: PathBuf,
    allow_scripts: bool,
}

static SERVICE_ARGS: OnceLock<ServiceArgs> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

/// Run the current process as the Windows service for `config`.
pub fn run_as_service(config: PathBuf, allow_scripts: bool) -> Result<()> {
    let name = burrow_conf::store::name_from_path(&config)
        .context("config path does not name a tunnel")?;
    let _ = SERVICE_ARGS.set(ServiceArgs {
        config,
        allow_scripts,
    });
    service_dispatcher::start(format!("BurrowTunnel${name}"), ffi_service_main)
        .context("failed to connect to the service control dispatcher")?;
    Ok(())
}

fn started_at_boot() -> bool {
    use windows_sys::Win32::System::SystemInformation::GetTickCount64;

    let uptime = Duration::from_millis(unsafe { GetTickCount64() });
    uptime < BOOT_WINDOW
}

fn service_main(_arguments: Vec<std::ffi::OsString>) {
    let Some(args) = SERVICE_ARGS.get() else {
        return;
    };
    let exit_code = match run_service(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("service failed before the control handler was up: {err:#}");
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code as i32);
    }
}

/// Forwards orchestrator status reports to the SCM.
struct ScmStatusSink {
    handle: Mutex<Option<service_control_handler::ServiceStatusHandle>>,
}

impl ScmStatusSink {
    fn translate(status: ServiceStatus) -> ScmStatus {
        let current_state = match status.state {
            ServiceState::StartPending => ScmState::StartPending,
            ServiceState::Running => ScmState::Running,
            ServiceState::StopPending => ScmState::StopPending,
            ServiceState::Stopped => ScmState::Stopped,
        };
        let mut controls_accepted = ServiceControlAccept::empty();
        if status.accepts & ACCEPT_STOP != 0 {
            controls_accepted |= ServiceControlAccept::STOP;
        }
        if status.accepts & ACCEPT_SHUTDOWN != 0 {
            controls_accepted |= ServiceControlAccept::SHUTDOWN;
        }
        ScmStatus {
            service_type: SERVICE_TYPE,
            current_state,
            controls_accepted,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::from_secs(30),
            process_id: None,
        }
    }
}

impl StatusSink for ScmStatusSink {
    fn report(&self, status: ServiceStatus) {
        if let Ok(guard) = self.handle.lock() {
            if let Some(handle) = guard.as_ref() {
                let _ = handle.set_service_status(Self::translate(status));
            }
        }
    }
}

fn run_service(args: &ServiceArgs) -> Result<u32> {
    let name = burrow_conf::store::name_from_path(&args.config)?;
    let service_name = format!("BurrowTunnel${name}");

    let (control_tx, control_rx) = mpsc::channel(8);
    let handler_tx = control_tx.clone();
    let event_handler = move |control| match control {
        ServiceControl::Stop => {
            let _ = handler_tx.blocking_send(ControlRequest::Stop);
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Shutdown => {
            let _ = handler_tx.blocking_send(ControlRequest::Shutdown);
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Interrogate => {
            let _ = handler_tx.blocking_send(ControlRequest::Interrogate);
            ServiceControlHandlerResult::NoError
        }
        _ => ServiceControlHandlerResult::NotImplemented,
    };

    let sink = Arc::new(ScmStatusSink {
        handle: Mutex::new(None),
    });
    let handle = service_control_handler::register(&service_name, event_handler)
        .context("failed to register service control handler")?;
    if let Ok(mut guard) = sink.handle.lock() {
        *guard = Some(handle);
    }

    let log_file = args.config.with_extension("log");
    let options = ServiceOptions {
        boot_mode: started_at_boot(),
        allow_scripts: args.allow_scripts,
        log_file: Some(log_file),
        ..Default::default()
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let report = runtime.block_on(async {
        let notifier = match WindowsNotifier::new() {
            Ok(notifier) => Arc::new(notifier),
            Err(err) => {
                tracing::error!("failed to subscribe to change notifications: {}", err);
                return None;
            }
        };
        let service = TunnelService::new(
            Arc::new(WindowsNetworkState),
            notifier,
            Arc::new(DriverAdapterFactory::new()),
            sink.clone(),
        )
        .with_environment(Arc::new(WindowsEnvironment))
        .with_options(options);
        Some(service.run(&args.config, control_rx).await)
    });

    let Some(report) = report else {
        report_stopped(&sink, 3);
        return Ok(3);
    };

    if let TeardownOutcome::DeadlockSuspected { pending } = &report.outcome {
        eprintln!("shutdown deadlocked; pending cleanup: {pending:?}");
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        std::process::exit(DEADLOCK_EXIT_CODE);
    }

    let code = report.exit_code().unwrap_or(0);
    if code != 0 {
        report_stopped(&sink, code);
    }
    Ok(code)
}

/// Report a final Stopped status carrying a service-specific exit code.
fn report_stopped(sink: &ScmStatusSink, code: u32) {
    if let Ok(guard) = sink.handle.lock() {
        if let Some(handle) = guard.as_ref() {
            let _ = handle.set_service_status(ScmStatus {
                service_type: SERVICE_TYPE,
                current_state: ScmState::Stopped,
                controls_accepted: ServiceControlAccept::empty(),
                exit_code: ServiceExitCode::ServiceSpecific(code),
                checkpoint: 0,
                wait_hint: Duration::ZERO,
                process_id: None,
            });
        }
    }
}
