//! Service error types and failure classification
//!
//! Every fatal startup failure carries a [`FailureClass`] that determines
//! the service-specific exit code reported to the service manager, so an
//! operator can tell a DNS failure from an adapter failure without reading
//! logs.

use thiserror::Error;

use crate::script::ScriptError;

/// Exit code used when teardown misses its deadline and the process kills
/// itself rather than hang. Deliberately outside the service-specific
/// range so it is recognizable in crash reports.
pub const DEADLOCK_EXIT_CODE: i32 = 777;

/// Errors surfaced by the tunnel service.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load configuration: {0}")]
    LoadConfig(#[from] burrow_conf::StoreError),

    #[error("DNS resolution failed: {0}")]
    Resolve(#[from] burrow_conf::ResolveError),

    #[error("network error: {0}")]
    Net(#[from] burrow_net::Error),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interface watcher failed: {0}")]
    Watcher(String),
}

/// The enumerated failure classes of an orchestration run. The numeric
/// codes are stable: they are reported to the service manager and parsed by
/// tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    LogSink,
    LoadConfiguration,
    NetworkWatch,
    DnsLookup,
    CreateAdapter,
    RunScript,
    Firewall,
    DropPrivileges,
    SetConfiguration,
    BringUp,
}

impl FailureClass {
    /// Service-specific exit code for this class.
    pub fn exit_code(self) -> u32 {
        match self {
            FailureClass::LogSink => 1,
            FailureClass::LoadConfiguration => 2,
            FailureClass::NetworkWatch => 3,
            FailureClass::DnsLookup => 4,
            FailureClass::CreateAdapter => 5,
            FailureClass::RunScript => 6,
            FailureClass::Firewall => 7,
            FailureClass::DropPrivileges => 8,
            FailureClass::SetConfiguration => 9,
            FailureClass::BringUp => 10,
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            FailureClass::LogSink => "unable to open log file",
            FailureClass::LoadConfiguration => "unable to load configuration",
            FailureClass::NetworkWatch => "unable to watch network interfaces",
            FailureClass::DnsLookup => "unable to resolve peer endpoints",
            FailureClass::CreateAdapter => "unable to create network adapter",
            FailureClass::RunScript => "a lifecycle script failed",
            FailureClass::Firewall => "unable to enforce firewall rules",
            FailureClass::DropPrivileges => "unable to drop privileges",
            FailureClass::SetConfiguration => "unable to set adapter configuration",
            FailureClass::BringUp => "unable to bring adapter up",
        };
        f.write_str(description)
    }
}

/// A fatal failure: what went wrong plus which class it falls into.
#[derive(Debug, Error)]
#[error("{class}: {error}")]
pub struct ServiceFailure {
    pub class: FailureClass,
    #[source]
    pub error: Error,
}

impl ServiceFailure {
    pub fn new(class: FailureClass, error: impl Into<Error>) -> Self {
        ServiceFailure {
            class,
            error: error.into(),
        }
    }

    pub fn exit_code(&self) -> u32 {
        self.class.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let classes = [
            FailureClass::LogSink,
            FailureClass::LoadConfiguration,
            FailureClass::NetworkWatch,
            FailureClass::DnsLookup,
            FailureClass::CreateAdapter,
            FailureClass::RunScript,
            FailureClass::Firewall,
            FailureClass::DropPrivileges,
            FailureClass::SetConfiguration,
            FailureClass::BringUp,
        ];
        let mut codes: Vec<u32> = classes.iter().map(|c| c.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), classes.len());
        assert!(!codes.contains(&(DEADLOCK_EXIT_CODE as u32)));
    }
}
