//! Round-robin peer selection.
//!
//! The selector owns an ordered snapshot of the peers and a shared cursor.
//! Each call advances the cursor by one and scans at most one full ring
//! from there, skipping peers that are not alive or are marked bad. The
//! first eligible index is stored back into the cursor.
//!
//! The cursor advance is a single atomic read-modify-write, so concurrent
//! callers start from distinct indices. No lock is held while peers are
//! inspected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::peer::{BadPeerCache, Peer, SharedPeer};

/// Round-robin selector over a fixed peer list.
#[derive(Debug)]
pub struct PeerSelector {
    peers: Vec<SharedPeer>,
    cursor: AtomicUsize,
    bad_peers: BadPeerCache,
}

impl PeerSelector {
    pub fn new(peers: Vec<SharedPeer>, bad_peers: BadPeerCache) -> Self {
        Self {
            peers,
            cursor: AtomicUsize::new(0),
            bad_peers,
        }
    }

    pub fn peers(&self) -> &[SharedPeer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn bad_peers(&self) -> &BadPeerCache {
        &self.bad_peers
    }

    /// Check if a peer may be handed out.
    pub fn is_eligible(&self, peer: &Peer) -> bool {
        peer.is_alive() && !self.bad_peers.is_failed(peer.address())
    }

    /// Remember that `peer` refused a dial.
    pub fn mark_bad(&self, peer: &Peer) {
        self.bad_peers.mark_failed(peer.address());
    }

    /// Select the next eligible peer, or `None` when the list is empty or no
    /// peer is eligible.
    pub fn next_peer(&self) -> Option<SharedPeer> {
        let len = self.peers.len();
        if len == 0 {
            return None;
        }

        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(start_index(current, len))
            })
            .unwrap_or_else(|current| current);
        let start = start_index(previous, len);

        for offset in 0..len {
            let index = (start + offset) % len;
            let peer = &self.peers[index];

            if !self.is_eligible(peer) {
                continue;
            }

            self.cursor.store(index, Ordering::Release);
            return Some(Arc::clone(peer));
        }

        debug!(peer_count = len, "No eligible peers after full scan");
        None
    }

    #[cfg(test)]
    fn with_cursor(self, cursor: usize) -> Self {
        self.cursor.store(cursor, Ordering::Release);
        self
    }
}

/// Out-of-range cursors restart at zero; otherwise advance by one.
fn start_index(cursor: usize, len: usize) -> usize {
    if cursor >= len {
        0
    } else {
        (cursor + 1) % len
    }
}
