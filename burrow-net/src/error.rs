//! Error types for the network and adapter boundary

use thiserror::Error;

/// Result type alias for network and adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the adapter driver.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Failure querying host routing or interface state.
    #[error("network query error: {0}")]
    Query(String),

    /// An interface row was requested for an unknown interface.
    #[error("no such interface: {0}")]
    NoSuchInterface(u64),

    /// An endpoint still names a host instead of a literal address.
    #[error("endpoint {0:?} has not been resolved to an address")]
    UnresolvedEndpoint(String),

    /// Change-notification subscription failure.
    #[error("notification subscription error: {0}")]
    Subscription(String),
}
