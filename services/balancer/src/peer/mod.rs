//! Backend peers.
//!
//! A [`Peer`] is created once per configured backend and shared (via
//! [`SharedPeer`]) between the selector and the peer's health prober, so a
//! liveness update made by the prober is seen by the next selection.

mod bad_peers;
mod health;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::PeerConfig;

pub use bad_peers::{BadPeerCache, BAD_PEER_EVICT_INTERVAL};
pub use health::{probe, run_health_checks, spawn_health_checker, HealthStatus};

/// Strip an optional `proto://` prefix from a peer uri.
pub fn strip_scheme(uri: &str) -> &str {
    uri.split_once("://").map_or(uri, |(_, rest)| rest)
}

/// A single backend.
#[derive(Debug)]
pub struct Peer {
    name: String,
    proto: String,
    address: String,
    alive: AtomicBool,
}

impl Peer {
    /// Create a peer. `uri` is `host:port` or `proto://host:port`.
    ///
    /// Peers start out alive; the health prober corrects this on its first
    /// probe.
    pub fn new(name: impl Into<String>, proto: impl Into<String>, uri: &str) -> Self {
        Self {
            name: name.into(),
            proto: proto.into(),
            address: strip_scheme(uri.trim()).to_string(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn from_config(config: &PeerConfig) -> Self {
        Self::new(config.name.clone(), config.proto.clone(), &config.uri)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// The `host:port` dialed for this peer. Immutable after construction.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check if the last probe succeeded.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Update liveness. Returns the previous value.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }

    /// Open a connection to this peer.
    pub async fn dial(
        &self,
        dialer: &dyn Dialer,
        connect_timeout: Duration,
    ) -> io::Result<TcpStream> {
        dialer.dial(&self.address, connect_timeout).await
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.name, self.address)
        }
    }
}

/// A thread-safe reference to a Peer.
pub type SharedPeer = Arc<Peer>;

/// Opens outbound connections to peers.
///
/// Production code uses [`TcpDialer`]; tests inject their own.
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    async fn dial(&self, addr: &str, connect_timeout: Duration) -> io::Result<TcpStream>;
}

/// Plain TCP dialer with a connect timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}
