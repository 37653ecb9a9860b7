//! Remote IP deny-list.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use vbalancer_ttl_cache::{CacheError, TtlCache};

use crate::config::BlacklistConfig;

/// How often expired verdicts are swept.
const VERDICT_EVICT_INTERVAL: Duration = Duration::from_secs(1);

/// Static set of denied IPs with an optional verdict cache.
///
/// The cache stores the outcome of a lookup per remote IP, not the list
/// itself, so a cached verdict never disagrees with the list.
#[derive(Debug, Clone)]
pub struct Blacklist {
    remote_ips: Arc<HashSet<String>>,
    verdicts: Option<Arc<TtlCache<String, bool>>>,
}

impl Blacklist {
    /// Build a blacklist. Entries are trimmed; blank entries are dropped.
    /// A `cache_ttl` of zero disables the verdict cache.
    pub fn new<I, S>(remote_ips: I, cache_ttl: Duration) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let remote_ips = remote_ips
            .into_iter()
            .map(|ip| strip_port(ip.as_ref().trim()).to_string())
            .filter(|ip| !ip.is_empty())
            .collect();

        let verdicts = if cache_ttl.is_zero() {
            None
        } else {
            Some(Arc::new(TtlCache::new(VERDICT_EVICT_INTERVAL, cache_ttl)?))
        };

        Ok(Self {
            remote_ips: Arc::new(remote_ips),
            verdicts,
        })
    }

    pub fn from_config(config: &BlacklistConfig) -> Result<Self, CacheError> {
        Self::new(&config.remote_ip, Duration::from_secs(config.cache_ttl_secs))
    }

    pub fn len(&self) -> usize {
        self.remote_ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote_ips.is_empty()
    }

    /// Check a remote address. `remote_addr` may be `ip`, `ip:port` or
    /// `[ipv6]:port`; the port never affects the verdict.
    pub fn is_blacklisted(&self, remote_addr: &str) -> bool {
        if self.remote_ips.is_empty() {
            return false;
        }

        let ip = strip_port(remote_addr.trim());

        if let Some(verdicts) = &self.verdicts {
            if let Some(denied) = verdicts.get(ip) {
                return denied;
            }
            let denied = self.remote_ips.contains(ip);
            verdicts.add(ip.to_string(), denied);
            return denied;
        }

        self.remote_ips.contains(ip)
    }

    /// Number of cached verdicts.
    pub fn cached_verdicts(&self) -> usize {
        self.verdicts.as_ref().map_or(0, |v| v.len())
    }

    /// Start the verdict cache evictor, if the cache is enabled.
    pub fn start_evict(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        self.verdicts.as_ref().map(|v| v.start_evict(shutdown))
    }
}

/// Strip a trailing `:port` from an address.
///
/// Bare IPv4 and IPv6 addresses are returned unchanged; bracketed IPv6
/// addresses lose their brackets.
pub fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(addr, |(host, _)| host);
    }

    match addr.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}
