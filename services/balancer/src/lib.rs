//! vbalancer: a TCP reverse proxy and round-robin load balancer.
//!
//! Clients connecting to the listener are spliced byte-for-byte to one of
//! the configured peers. Peers that fail health probes or refuse a dial are
//! skipped until they recover.

pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod peer;
pub mod proxy;
pub mod result_code;
pub mod rules;

pub use config::Config;
pub use controller::{ProxyController, RunningProxy};
pub use error::{BalancerError, Result};
pub use peer::{Dialer, Peer, SharedPeer, TcpDialer};
pub use proxy::{
    FailureResponse, Listener, ListenerConfig, ListenerStats, PeerSelector, ReverseDataPipe,
};
pub use result_code::ResultCode;
pub use rules::{Blacklist, Rules};
