//! Error types for configuration parsing and storage

use thiserror::Error;

/// Errors produced while parsing a tunnel configuration text.
///
/// Every variant carries the offending token so callers can surface a
/// precise message to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("tunnel name is not valid: {0:?}")]
    InvalidTunnelName(String),

    #[error("line must occur in a section: {0:?}")]
    LineNotInSection(String),

    #[error("config key is missing an equals separator: {0:?}")]
    MissingEquals(String),

    #[error("key must have a value: {0:?}")]
    MissingValue(String),

    #[error("invalid key for [Interface] section: {0:?}")]
    InvalidInterfaceKey(String),

    #[error("invalid key for [Peer] section: {0:?}")]
    InvalidPeerKey(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("keys must decode to exactly 32 bytes: {0:?}")]
    InvalidKeyLength(String),

    #[error("invalid IP address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid MTU: {0:?}")]
    InvalidMtu(String),

    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    #[error("invalid persistent keepalive: {0:?}")]
    InvalidKeepalive(String),

    #[error("invalid table value: {0:?}")]
    InvalidTable(String),

    #[error("two commas in a row: {0:?}")]
    TwoCommasInARow(String),

    #[error("missing port from endpoint: {0:?}")]
    MissingPort(String),

    #[error("missing closing bracket in endpoint: {0:?}")]
    MissingBracket(String),

    #[error("missing port separator after IPv6 address: {0:?}")]
    MissingPortSeparator(String),

    #[error("IPv6 addresses must be enclosed in brackets: {0:?}")]
    UnbracketedIpv6(String),

    #[error("invalid endpoint host: {0:?}")]
    InvalidHost(String),

    #[error("invalid character encoding")]
    InvalidEncoding,

    #[error("an interface must have a private key")]
    MissingPrivateKey,

    #[error("all peers must have public keys")]
    MissingPublicKey,
}

/// Errors produced by the on-disk configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("path has no usable file name")]
    InvalidPath,

    #[error("path must end in .conf: {name:?}")]
    BadSuffix { name: String },

    #[error("tunnel name is not valid: {0:?}")]
    InvalidName(String),

    #[error("configuration file not found for tunnel {0:?}")]
    NotFound(String),

    #[error("configuration file already exists: {0}")]
    AlreadyExists(String),
}
