//! Burrow tunnel configuration
//!
//! This crate owns everything about a tunnel's declared state:
//!
//! - The in-memory [`Config`] model (interface + peers) and its invariants
//! - The wg-quick style text parser and serializer
//! - The on-disk configuration store (`<name>.conf` files)
//! - Endpoint resolution with a shared, time-bounded DNS cache
//!
//! The service layer (`burrow-tunnel`) consumes a parsed `Config`, resolves
//! its endpoints, and hands the result to the adapter boundary.

pub mod error;
pub mod model;
pub mod parser;
pub mod resolver;
pub mod store;

pub use error::{ParseError, StoreError};
pub use model::{
    tunnel_name_is_valid, Config, Endpoint, Interface, Key, Peer, KEY_LENGTH,
};
pub use parser::{from_wg_quick, from_wg_quick_with_unknown_encoding};
pub use resolver::{
    Backoff, DnsCache, HostLookup, LookupError, ResolveError, Resolver, SystemLookup,
};
