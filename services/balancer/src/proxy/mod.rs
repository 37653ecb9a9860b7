//! L4 TCP proxy implementation.
//!
//! This module provides:
//! - The client-facing listener with admission control
//! - Round-robin peer selection
//! - Peer dialing with bounded retry and bidirectional copy
//! - The diagnostic response sent when no peer can serve a client
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Rules -> Semaphore -> ReverseDataPipe -> PeerSelector -> Peer
//!                                                  |                  |
//!                                          FailureResponse      BadPeerCache
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let selector = Arc::new(PeerSelector::new(peers, BadPeerCache::new(ttl)?));
//! let dialer = Arc::new(TcpDialer);
//! let pipe = Arc::new(ReverseDataPipe::new(selector, dialer, pipe_config, stats.clone()));
//!
//! let listener = Arc::new(Listener::bind(listener_config, pipe, rules, stats).await?);
//! tokio::spawn(Arc::clone(&listener).run(shutdown_rx));
//! ```

mod listener;
mod pipe;
mod response;
mod selector;
mod stats;

pub use listener::{Listener, ListenerConfig};
pub use pipe::{
    copy_bidirectional, CopyOutcome, DirectionOutcome, PipeConfig, ReverseDataPipe, SessionSummary,
};
pub use response::{send_response_to_client, FailureResponse};
pub use selector::PeerSelector;
pub use stats::ListenerStats;
