//! Concurrent key/value cache with per-entry expiry.
//!
//! The balancer uses this cache in two places:
//! - marking peers that recently refused a dial as "bad"
//! - remembering blacklist verdicts for remote addresses
//!
//! Expired entries are never returned: [`TtlCache::get`] checks the deadline
//! itself, and the background evictor started with [`TtlCache::start_evict`]
//! drops expired entries so the map does not grow without bound.
//!
//! Deadlines are measured with [`tokio::time::Instant`], so tests can drive
//! expiry with a paused clock.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Expiry used when `now + time_to_evict` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Cache construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The evictor would spin without a pause.
    #[error("evict interval must be greater than zero")]
    ZeroEvictInterval,

    /// Entries would expire as soon as they are inserted.
    #[error("time to evict must be greater than zero")]
    ZeroTimeToEvict,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A key/value store where every entry expires `time_to_evict` after it was
/// last added.
#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Entry<V>>,
    evict_interval: Duration,
    time_to_evict: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache.
    ///
    /// `evict_interval` is how often the background evictor sweeps,
    /// `time_to_evict` is the lifetime of each entry.
    pub fn new(evict_interval: Duration, time_to_evict: Duration) -> Result<Self, CacheError> {
        if evict_interval.is_zero() {
            return Err(CacheError::ZeroEvictInterval);
        }
        if time_to_evict.is_zero() {
            return Err(CacheError::ZeroTimeToEvict);
        }

        Ok(Self {
            entries: DashMap::new(),
            evict_interval,
            time_to_evict,
        })
    }

    /// Lifetime of each entry.
    pub fn time_to_evict(&self) -> Duration {
        self.time_to_evict
    }

    /// Insert or refresh an entry. The expiry restarts from now.
    pub fn add(&self, key: K, value: V) {
        let expires_at = expiry_after(Instant::now(), self.time_to_evict);
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Look up a live entry.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }

        // The read guard must be released before removing from the same shard.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Remove an entry regardless of its expiry.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Spawn the background evictor.
    ///
    /// The task sweeps every `evict_interval` until `shutdown` turns `true`
    /// or its sender is dropped.
    pub fn start_evict(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }

            let mut ticker = tokio::time::interval(cache.evict_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            debug!(
                                evicted,
                                remaining = cache.len(),
                                "Evicted expired cache entries"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Cache evictor shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// `now + ttl`, saturating to a far-future instant.
fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}
