//! Proxy lifecycle.
//!
//! [`ProxyController`] wires configuration into the running components;
//! [`RunningProxy`] owns the background tasks and stops them in order:
//! accept loop first, then in-flight connections, then health probes and
//! cache evictors.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::peer::{spawn_health_checker, BadPeerCache, Dialer, Peer, SharedPeer, TcpDialer};
use crate::proxy::{
    Listener, ListenerConfig, ListenerStats, PeerSelector, PipeConfig, ReverseDataPipe,
};
use crate::rules::Rules;

/// Builds and starts the proxy from a validated configuration.
#[derive(Debug)]
pub struct ProxyController {
    config: Config,
    dialer: Arc<dyn Dialer>,
}

impl ProxyController {
    /// Validate `config` and prepare a controller using plain TCP dials.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            dialer: Arc::new(TcpDialer),
        })
    }

    /// Replace the dialer used for peer connections and health probes.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the listener and start every background task.
    pub async fn start(self) -> Result<RunningProxy> {
        let proxy = &self.config.proxy;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let peers: Vec<SharedPeer> = self
            .config
            .peers
            .iter()
            .map(|p| Arc::new(Peer::from_config(p)))
            .collect();

        let bad_peers = BadPeerCache::new(proxy.time_to_evict_not_response_peers())?;
        let rules = Rules::from_config(&self.config.rules)?;
        let selector = Arc::new(PeerSelector::new(peers.clone(), bad_peers.clone()));
        let stats = Arc::new(ListenerStats::default());

        let pipe = Arc::new(ReverseDataPipe::new(
            Arc::clone(&selector),
            Arc::clone(&self.dialer),
            PipeConfig::from_proxy_config(proxy),
            Arc::clone(&stats),
        ));

        let listener_config = ListenerConfig::from_proxy_config(proxy)?;
        let listener =
            Listener::bind(listener_config, pipe, rules.clone(), Arc::clone(&stats)).await?;
        let listener = Arc::new(listener);
        let local_addr = listener.local_addr()?;

        let mut background = vec![bad_peers.start_evict(shutdown_rx.clone())];
        background.extend(rules.start_evict(shutdown_rx.clone()));

        if proxy.health_check.enabled {
            for peer in &peers {
                background.push(spawn_health_checker(
                    Arc::clone(peer),
                    Arc::clone(&self.dialer),
                    proxy.health_check.timeout(),
                    proxy.health_check.interval(),
                    shutdown_rx.clone(),
                ));
            }
        }

        let accept = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

        info!(
            bind_addr = %local_addr,
            peer_count = peers.len(),
            health_check = proxy.health_check.enabled,
            "Proxy started"
        );

        Ok(RunningProxy {
            local_addr,
            listener,
            selector,
            stats,
            shutdown_tx,
            accept,
            background,
            shutdown_timeout: proxy.shutdown_timeout(),
        })
    }
}

/// Handle to a started proxy.
#[derive(Debug)]
pub struct RunningProxy {
    local_addr: SocketAddr,
    listener: Arc<Listener>,
    selector: Arc<PeerSelector>,
    stats: Arc<ListenerStats>,
    shutdown_tx: watch::Sender<bool>,
    accept: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    shutdown_timeout: std::time::Duration,
}

impl RunningProxy {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    pub fn selector(&self) -> &Arc<PeerSelector> {
        &self.selector
    }

    /// Stop accepting, wait for in-flight connections up to the shutdown
    /// timeout, then stop background tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down proxy");
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.accept.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        let drained = self.listener.drain(self.shutdown_timeout).await;

        for task in self.background {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!(
            accepted = ListenerStats::get(&self.stats.connections_accepted),
            closed = ListenerStats::get(&self.stats.connections_closed),
            "Proxy stopped"
        );
        drained
    }
}
