//! TCP listener and connection handling.
//!
//! The accept loop applies the rules, takes a slot from the connection
//! semaphore, stamps the client deadline and hands the connection to a
//! spawned handler. The slot is the throttle point: once every slot is
//! taken the loop stops accepting until a handler finishes.
//!
//! Handlers catch panics, so the slot, the counters and the client socket
//! are released on every exit path.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

use super::pipe::{deadline_after, ReverseDataPipe};
use super::response::send_response_to_client;
use super::stats::ListenerStats;
use crate::config::ProxyConfig;
use crate::error::{BalancerError, Result};
use crate::rules::Rules;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: u32,
    /// Session deadline of each client socket, from accept.
    pub client_deadline: Duration,
}

impl ListenerConfig {
    pub fn from_proxy_config(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            bind_addr: config.listen_addr()?,
            max_connections: config.max_count_connection,
            client_deadline: config.client_deadline(),
        })
    }
}

/// The client-facing TCP listener.
#[derive(Debug)]
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    pipe: Arc<ReverseDataPipe>,
    rules: Rules,
    /// One permit per in-flight connection.
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(
        config: ListenerConfig,
        pipe: Arc<ReverseDataPipe>,
        rules: Rules,
        stats: Arc<ListenerStats>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| BalancerError::Bind {
                addr: config.bind_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            listener,
            config,
            pipe,
            rules,
            stats,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Connections currently held by a handler.
    pub fn active_connections(&self) -> usize {
        ListenerStats::get(&self.stats.connections_active) as usize
    }

    /// Accept connections until `shutdown` turns `true` or its sender is
    /// dropped. Handlers already running are left to finish; see
    /// [`Listener::drain`].
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(bind_addr = ?self.local_addr().ok(), "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            };

            ListenerStats::incr(&self.stats.connections_accepted);
            let deadline = deadline_after(self.config.client_deadline);

            if self.rules.is_denied(&remote_addr.to_string()) {
                ListenerStats::incr(&self.stats.connections_blacklisted);
                info!(remote_addr = %remote_addr, "Client is blacklisted, closing connection");
                drop(stream);
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.conn_semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!(
                        remote_addr = %remote_addr,
                        "Shutdown while waiting for a connection slot"
                    );
                    break;
                }
            };

            ListenerStats::incr(&self.stats.connections_active);

            let listener = Arc::clone(&self);
            tokio::spawn(
                async move {
                    listener.handle_connection(stream, remote_addr, deadline).await;

                    ListenerStats::decr(&listener.stats.connections_active);
                    ListenerStats::incr(&listener.stats.connections_closed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", remote_addr = %remote_addr)),
            );
        }

        info!("Listener stopped accepting connections");
    }

    /// Proxy one client. On failure a diagnostic response is written to the
    /// client before it is closed.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        remote_addr: SocketAddr,
        deadline: Instant,
    ) {
        debug!(remote_addr = %remote_addr, "Handling connection");

        let result = AssertUnwindSafe(self.pipe.reverse_data(&mut client, deadline))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(summary)) => {
                debug!(
                    peer = %summary.peer,
                    attempts = summary.attempts,
                    bytes_to_peer = summary.bytes_to_peer,
                    bytes_from_peer = summary.bytes_from_peer,
                    "Connection closed"
                );
                None
            }
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                ListenerStats::incr(&self.stats.handler_panics);
                let message = panic_message(panic.as_ref());
                error!(remote_addr = %remote_addr, panic = %message, "Connection handler panicked");
                Some(BalancerError::HandlerPanicked(message))
            }
        };

        if let Some(err) = failure {
            warn!(
                remote_addr = %remote_addr,
                result_code = err.result_code().as_u32(),
                error = %err,
                "Failed to proxy connection"
            );

            match timeout_at(deadline, send_response_to_client(&mut client, &err)).await {
                Ok(Ok(())) => ListenerStats::incr(&self.stats.failure_responses),
                Ok(Err(e)) => debug!(
                    remote_addr = %remote_addr,
                    error = %e,
                    "Could not send failure response"
                ),
                Err(_) => debug!(remote_addr = %remote_addr, "Failure response timed out"),
            }
        }

        // The copy may already have shut the write side down.
        let _ = client.shutdown().await;
    }

    /// Wait for every in-flight handler to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let all = self.conn_semaphore.acquire_many(self.config.max_connections);

        match tokio::time::timeout(timeout, all).await {
            Ok(Ok(_permits)) => {
                self.conn_semaphore.close();
                info!("All connections drained");
                Ok(())
            }
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                let active = self.active_connections();
                warn!(active, "Timed out waiting for connections to drain");
                Err(BalancerError::ShutdownTimeout { active })
            }
        }
    }
}

/// Resolve once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{BadPeerCache, Dialer, Peer, TcpDialer};
    use crate::proxy::pipe::PipeConfig;
    use crate::proxy::selector::PeerSelector;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    #[derive(Debug)]
    struct PanickingDialer;

    #[async_trait]
    impl Dialer for PanickingDialer {
        async fn dial(&self, _addr: &str, _connect_timeout: Duration) -> io::Result<TcpStream> {
            panic!("dialer exploded");
        }
    }

    async fn spawn_listener(dialer: Arc<dyn Dialer>, max_connections: u32) -> Arc<Listener> {
        build_listener("127.0.0.1:9", dialer, max_connections, Duration::from_secs(5)).await
    }

    async fn build_listener(
        peer_addr: &str,
        dialer: Arc<dyn Dialer>,
        max_connections: u32,
        client_deadline: Duration,
    ) -> Arc<Listener> {
        let peers = vec![Arc::new(Peer::new("p0", "tcp", peer_addr))];
        let selector = Arc::new(PeerSelector::new(
            peers,
            BadPeerCache::new(Duration::from_secs(10)).unwrap(),
        ));
        let stats = Arc::new(ListenerStats::default());
        let pipe = Arc::new(ReverseDataPipe::new(
            selector,
            dialer,
            PipeConfig {
                peer_connection_timeout: Duration::from_millis(200),
                peer_host_deadline: client_deadline,
                max_dial_attempts: 3,
                copy_buffer_size: 1024,
            },
            Arc::clone(&stats),
        ));
        let config = ListenerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            client_deadline,
        };

        Arc::new(Listener::bind(config, pipe, Rules::default(), stats).await.unwrap())
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_config_from_proxy_config() {
        let config = ListenerConfig::from_proxy_config(&ProxyConfig::default()).unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.client_deadline, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = spawn_listener(Arc::new(PanickingDialer), 1).await;

        let config = ListenerConfig {
            bind_addr: taken.local_addr().unwrap(),
            max_connections: 1,
            client_deadline: Duration::from_secs(1),
        };
        let pipe = Arc::clone(&listener.pipe);
        let err = Listener::bind(config, pipe, Rules::default(), Arc::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_handler_panic_releases_slot() {
        let listener = spawn_listener(Arc::new(PanickingDialer), 1).await;
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

        // With a single slot, the second client is only served if the
        // panicking handler gave its slot back.
        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            assert!(response.contains(r#""statusCode":11"#), "{response}");
        }

        shutdown_tx.send(true).unwrap();
        accept.await.unwrap();
        listener.drain(Duration::from_secs(1)).await.unwrap();

        assert_eq!(ListenerStats::get(&listener.stats.handler_panics), 2);
        assert_eq!(ListenerStats::get(&listener.stats.failure_responses), 2);
        assert_eq!(listener.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_client_deadline_keeps_accepting() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        let listener = build_listener(&echo_addr, Arc::new(TcpDialer), 4, Duration::MAX).await;
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

        // A deadline past the end of the clock must not take the loop down.
        for message in [&b"first"[..], &b"second"[..]] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(message).await.unwrap();
            client.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).await.unwrap();
            assert_eq!(echoed, message);
        }

        assert!(!accept.is_finished());
        shutdown_tx.send(true).unwrap();
        accept.await.unwrap();
        listener.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ListenerStats::get(&listener.stats.connections_accepted), 2);
    }
}
