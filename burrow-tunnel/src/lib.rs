//! Burrow tunnel service orchestration
//!
//! This crate runs one tunnel from configuration to teardown:
//!
//! - [`service::TunnelService`]: the lifecycle state machine
//!   (`StartPending → Running → StopPending → Stopped`) driven by a
//!   control channel and reporting through a [`service::StatusSink`]
//! - [`mtu::MtuMonitor`]: keeps the tunnel MTU derived from the host's
//!   default route as it changes
//! - [`pitfalls`]: best-effort diagnostics for loop-prone host setups
//! - [`script::ScriptRunner`]: gated, timeout-bounded lifecycle scripts
//! - [`watcher::InterfaceWatcher`]: funnels OS change notifications into
//!   the service's own tasks
//!
//! All OS access goes through the `burrow-net` traits, so the entire
//! lifecycle runs against mocks in tests.

pub mod error;
pub mod logging;
pub mod mtu;
pub mod pitfalls;
pub mod script;
pub mod service;
pub mod watcher;

pub use error::{Error, FailureClass, ServiceFailure, DEADLOCK_EXIT_CODE};
pub use script::{ScriptError, ScriptRunner, SCRIPT_TIMEOUT, TUNNEL_NAME_ENV};
pub use service::{
    ControlRequest, NullPlatform, Platform, RunReport, ServiceOptions, ServiceState,
    ServiceStatus, StatusSink, TeardownOutcome, TunnelService, ACCEPT_SHUTDOWN, ACCEPT_STOP,
    SHUTDOWN_DEADLINE,
};
