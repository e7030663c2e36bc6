//! Burrow tunnel service CLI
//!
//! `burrow run <config>` runs a tunnel in the foreground; `burrow check`
//! validates a configuration file. On Windows the service manager invokes
//! the hidden `service-run` entry instead of `run`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(windows)]
mod service;

/// Burrow - a VPN tunnel endpoint service
#[derive(Parser)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tunnel in the foreground until interrupted
    Run {
        /// Path to the tunnel configuration file
        config: PathBuf,

        /// Allow PreUp/PostUp/PreDown/PostDown scripts to execute
        #[arg(long)]
        allow_scripts: bool,

        /// Treat this start as a boot-time start (widened retry tolerances)
        #[arg(long)]
        boot: bool,
    },

    /// Parse and validate a tunnel configuration file
    Check {
        /// Path to the tunnel configuration file
        config: PathBuf,
    },

    /// Entry point used by the Windows service manager; not for direct use
    #[cfg(windows)]
    #[command(hide = true)]
    ServiceRun {
        /// Path to the tunnel configuration file
        config: PathBuf,

        /// Allow PreUp/PostUp/PreDown/PostDown scripts to execute
        #[arg(long)]
        allow_scripts: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            allow_scripts,
            boot,
        } => {
            init_logging(&cli.log_level);
            run_foreground(config, allow_scripts, boot)
        }
        Commands::Check { config } => {
            init_logging(&cli.log_level);
            check_config(config)
        }
        #[cfg(windows)]
        Commands::ServiceRun {
            config,
            allow_scripts,
        } => service::run_as_service(config, allow_scripts),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn check_config(config_path: PathBuf) -> Result<()> {
    let config = burrow_conf::store::load_from_path(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    println!(
        "{}: OK ({} peer{})",
        config.name,
        config.peers.len(),
        if config.peers.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

#[cfg(windows)]
fn run_foreground(config: PathBuf, allow_scripts: bool, boot: bool) -> Result<()> {
    use std::sync::Arc;

    use burrow_net::driver::DriverAdapterFactory;
    use burrow_net::windows::{WindowsNetworkState, WindowsNotifier};
    use burrow_tunnel::pitfalls::WindowsEnvironment;
    use burrow_tunnel::{ServiceOptions, TunnelService};

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async move {
        let notifier =
            Arc::new(WindowsNotifier::new().context("failed to subscribe to change notifications")?);
        let service = TunnelService::new(
            Arc::new(WindowsNetworkState),
            notifier,
            Arc::new(DriverAdapterFactory::new()),
            Arc::new(LogStatusSink),
        )
        .with_environment(Arc::new(WindowsEnvironment))
        .with_options(ServiceOptions {
            boot_mode: boot,
            allow_scripts,
            ..Default::default()
        });

        run_until_interrupted(service, &config).await
    })
}

#[cfg(not(windows))]
fn run_foreground(_config: PathBuf, _allow_scripts: bool, _boot: bool) -> Result<()> {
    // The adapter driver and network watcher are Windows facilities; other
    // platforms get configuration tooling only.
    anyhow::bail!("the burrow tunnel service only runs on Windows; use `burrow check` here")
}

#[cfg(windows)]
async fn run_until_interrupted(
    service: burrow_tunnel::TunnelService,
    config: &std::path::Path,
) -> Result<()> {
    use burrow_tunnel::{ControlRequest, TeardownOutcome};

    let (control_tx, control_rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            let _ = control_tx.send(ControlRequest::Stop).await;
        }
    });

    let report = service.run(config, control_rx).await;
    if let TeardownOutcome::DeadlockSuspected { pending } = &report.outcome {
        eprintln!("shutdown deadlocked; pending cleanup: {pending:?}");
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        std::process::exit(burrow_tunnel::DEADLOCK_EXIT_CODE);
    }
    if let Some(failure) = report.failure {
        return Err(anyhow::Error::new(failure).context("tunnel failed"));
    }
    Ok(())
}

/// Status sink for foreground runs: states just go to the log.
#[cfg(windows)]
struct LogStatusSink;

#[cfg(windows)]
impl burrow_tunnel::StatusSink for LogStatusSink {
    fn report(&self, status: burrow_tunnel::ServiceStatus) {
        tracing::info!("service state: {:?}", status.state);
    }
}
