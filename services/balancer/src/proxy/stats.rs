//! Connection counters shared by the accept loop and the data pipe.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted (blacklisted ones included).
    pub connections_accepted: AtomicU64,
    /// Connections currently dispatched to a handler.
    pub connections_active: AtomicU64,
    /// Connections whose handler finished.
    pub connections_closed: AtomicU64,
    /// Connections dropped by the blacklist.
    pub connections_blacklisted: AtomicU64,
    /// Handlers that panicked.
    pub handler_panics: AtomicU64,
    /// Successful peer dials.
    pub peer_connected: AtomicU64,
    /// Failed peer dials.
    pub peer_failed: AtomicU64,
    /// Diagnostic responses written to clients.
    pub failure_responses: AtomicU64,
    /// Bytes proxied to peers.
    pub bytes_to_peer: AtomicU64,
    /// Bytes proxied from peers.
    pub bytes_from_peer: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
