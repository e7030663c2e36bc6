//! Endpoint resolution with caching and retry/backoff
//!
//! Peer endpoints may name a host rather than a literal address. The
//! [`Resolver`] turns those names into addresses before the adapter is
//! configured, resolving every peer concurrently, caching results for a few
//! minutes, and tolerating transient DNS failures with exponential backoff.
//! At boot the tolerances widen: the network stack and DNS infrastructure
//! may not be up yet when the service starts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::warn;

use crate::model::Config;

/// How long a cached resolution stays valid.
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Per-attempt timeout for the underlying lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry attempts for a single host, normally and when started at boot.
pub const MAX_TRIES: u32 = 5;
pub const MAX_TRIES_AT_BOOT: u32 = 10;

/// Exponential backoff capped at a fixed delay: `delay(n) = min(2^n, cap)`.
///
/// A zero cap produces a zero-delay policy, which tests use to exercise
/// retry ladders without waiting.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    cap: Duration,
}

impl Backoff {
    pub fn new(cap: Duration) -> Self {
        Backoff { cap }
    }

    pub fn none() -> Self {
        Backoff {
            cap: Duration::ZERO,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = 1u64 << attempt.min(62);
        Duration::from_secs(secs).min(self.cap)
    }
}

/// Classified failure from a hostname lookup. The resolver's retry decisions
/// hinge on this distinction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// Transient failure; always worth retrying.
    #[error("temporary failure in name resolution")]
    TryAgain,

    /// The name does not resolve; retried only in boot mode.
    #[error("host not found")]
    NotFound,

    #[error("lookup failed: {0}")]
    Other(String),
}

/// Error returned once the resolver gives up on a host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("host not found: {0:?}")]
    HostNotFound(String),

    #[error("failed to resolve {host:?}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: LookupError,
    },
}

/// The address-family-agnostic hostname lookup. A trait object so tests can
/// substitute deterministic lookups.
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, LookupError>;
}

/// Lookup backed by the operating system resolver.
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        let addrs = tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(classify_lookup_error)?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

fn classify_lookup_error(err: std::io::Error) -> LookupError {
    #[cfg(windows)]
    {
        // WSATRY_AGAIN / WSAHOST_NOT_FOUND
        match err.raw_os_error() {
            Some(11002) => return LookupError::TryAgain,
            Some(11001) => return LookupError::NotFound,
            _ => {}
        }
    }
    if err.kind() == std::io::ErrorKind::NotFound {
        return LookupError::NotFound;
    }
    LookupError::Other(err.to_string())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    address: IpAddr,
    resolved_at: Instant,
}

/// Shared hostname-to-address cache with a fixed time-to-live. Entries are
/// recomputed lazily on the first lookup past expiry.
#[derive(Debug)]
pub struct DnsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_ttl(DNS_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        DnsCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, host: &str) -> Option<IpAddr> {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .get(host)
            .filter(|entry| entry.resolved_at.elapsed() < self.ttl)
            .map(|entry| entry.address)
    }

    pub fn put(&self, host: &str, address: IpAddr) {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(
            host.to_string(),
            CacheEntry {
                address,
                resolved_at: Instant::now(),
            },
        );
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Among returned addresses, the first IPv4 wins; otherwise the first IPv6.
fn preferred_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .copied()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.iter().copied().find(|a| a.is_ipv6()))
}

/// Resolves peer endpoint hosts to literal addresses.
///
/// The cache and the boot-mode flag are injected so orchestration and tests
/// control them explicitly rather than reading process-wide state.
#[derive(Clone)]
pub struct Resolver {
    cache: Arc<DnsCache>,
    lookup: Arc<dyn HostLookup>,
    backoff: Backoff,
    boot_mode: bool,
    try_timeout: Duration,
}

impl Resolver {
    pub fn new(cache: Arc<DnsCache>, lookup: Arc<dyn HostLookup>) -> Self {
        Resolver {
            cache,
            lookup,
            backoff: Backoff::new(Duration::from_secs(8)),
            boot_mode: false,
            try_timeout: LOOKUP_TIMEOUT,
        }
    }

    /// Widen retry counts and tolerate "host not found" while DNS
    /// infrastructure may still be starting.
    pub fn with_boot_mode(mut self, boot_mode: bool) -> Self {
        self.boot_mode = boot_mode;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_try_timeout(mut self, timeout: Duration) -> Self {
        self.try_timeout = timeout;
        self
    }

    fn max_tries(&self) -> u32 {
        if self.boot_mode {
            MAX_TRIES_AT_BOOT
        } else {
            MAX_TRIES
        }
    }

    /// Resolve a single host, consulting the cache first.
    pub async fn resolve_one(&self, host: &str) -> Result<IpAddr, ResolveError> {
        if let Some(address) = self.cache.get(host) {
            return Ok(address);
        }

        let max_tries = self.max_tries();
        for attempt in 0..max_tries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
            }
            let outcome =
                match tokio::time::timeout(self.try_timeout, self.lookup.lookup(host)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            "DNS resolution timeout for {} (attempt {}/{})",
                            host,
                            attempt + 1,
                            max_tries
                        );
                        continue;
                    }
                };
            match outcome {
                Ok(addrs) => match preferred_address(&addrs) {
                    Some(address) => {
                        self.cache.put(host, address);
                        return Ok(address);
                    }
                    // An empty answer behaves like "host not found".
                    None if self.boot_mode => continue,
                    None => return Err(ResolveError::HostNotFound(host.to_string())),
                },
                Err(err) => {
                    warn!(
                        "DNS resolution failed for {}: {} (attempt {}/{})",
                        host,
                        err,
                        attempt + 1,
                        max_tries
                    );
                    match err {
                        LookupError::TryAgain => continue,
                        LookupError::NotFound if self.boot_mode => continue,
                        other => {
                            return Err(ResolveError::Lookup {
                                host: host.to_string(),
                                source: other,
                            })
                        }
                    }
                }
            }
        }
        Err(ResolveError::HostNotFound(host.to_string()))
    }

    /// Resolve every peer endpoint in `config` concurrently, rewriting each
    /// endpoint host to its resolved literal.
    ///
    /// If any peer ultimately fails, the first failure observed is returned;
    /// peers that resolved successfully keep their rewritten endpoints.
    pub async fn resolve_all(&self, config: &mut Config) -> Result<(), ResolveError> {
        let mut tasks = JoinSet::new();
        for (index, peer) in config.peers.iter().enumerate() {
            if !peer.has_endpoint() {
                continue;
            }
            let Some(endpoint) = &peer.endpoint else {
                continue;
            };
            let host = endpoint.host.clone();
            let resolver = self.clone();
            tasks.spawn(async move { (index, resolver.resolve_one(&host).await) });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let Ok((index, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(address) => {
                    if let Some(endpoint) = &mut config.peers[index].endpoint {
                        endpoint.host = address.to_string();
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
