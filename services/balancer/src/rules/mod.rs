//! Client admission rules applied before a connection takes a slot.

mod blacklist;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use vbalancer_ttl_cache::CacheError;

use crate::config::RulesConfig;

pub use blacklist::{strip_port, Blacklist};

/// Rules evaluated for every accepted connection.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    blacklist: Option<Blacklist>,
}

impl Rules {
    pub fn new(blacklist: Option<Blacklist>) -> Self {
        Self { blacklist }
    }

    pub fn from_config(config: &RulesConfig) -> Result<Self, CacheError> {
        let blacklist = config
            .blacklist
            .as_ref()
            .map(Blacklist::from_config)
            .transpose()?;
        Ok(Self { blacklist })
    }

    pub fn blacklist(&self) -> Option<&Blacklist> {
        self.blacklist.as_ref()
    }

    /// Check if a client from `remote_addr` must be dropped.
    pub fn is_denied(&self, remote_addr: &str) -> bool {
        self.blacklist
            .as_ref()
            .is_some_and(|b| b.is_blacklisted(remote_addr))
    }

    /// Start background tasks owned by the rules.
    pub fn start_evict(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        self.blacklist.as_ref().and_then(|b| b.start_evict(shutdown))
    }
}
