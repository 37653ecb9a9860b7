//! Short-lived markers for peers that refused a dial.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use vbalancer_ttl_cache::{CacheError, TtlCache};

/// How often expired markers are swept.
pub const BAD_PEER_EVICT_INTERVAL: Duration = Duration::from_secs(1);

/// Peers that recently failed a dial, keyed by address.
///
/// Absence means "assume healthy". Markers expire after the configured
/// time to evict.
#[derive(Debug, Clone)]
pub struct BadPeerCache {
    cache: Arc<TtlCache<String, bool>>,
}

impl BadPeerCache {
    pub fn new(time_to_evict: Duration) -> Result<Self, CacheError> {
        Ok(Self {
            cache: Arc::new(TtlCache::new(BAD_PEER_EVICT_INTERVAL, time_to_evict)?),
        })
    }

    /// Mark a peer address as failed.
    pub fn mark_failed(&self, address: &str) {
        self.cache.add(address.to_string(), true);
    }

    /// Check if a peer address is currently marked as failed.
    pub fn is_failed(&self, address: &str) -> bool {
        self.cache.get(address).unwrap_or(false)
    }

    /// Number of markers currently stored.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Start the background evictor.
    pub fn start_evict(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.cache.start_evict(shutdown)
    }
}
