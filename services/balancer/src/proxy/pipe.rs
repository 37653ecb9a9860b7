//! Peer connection and bidirectional data copy.
//!
//! For each client the pipe selects a peer, dials it, and on failure marks
//! the peer bad and selects again. The number of dials per client is capped
//! by `max_dial_attempts`; the bad-peer cache usually ends the loop earlier
//! by leaving no eligible peer.
//!
//! Once connected, both copy directions run concurrently and the session
//! ends only when both have finished, so bytes still in flight in one
//! direction are delivered after the other direction closes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::selector::PeerSelector;
use super::stats::ListenerStats;
use crate::config::ProxyConfig;
use crate::error::{BalancerError, Result};
use crate::peer::{Dialer, SharedPeer};

/// Fallback when a configured deadline does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Data path settings.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Bound on establishing a peer connection.
    pub peer_connection_timeout: Duration,
    /// Session deadline of the peer socket, from a successful dial.
    pub peer_host_deadline: Duration,
    /// Maximum peer dials per client connection.
    pub max_dial_attempts: u32,
    /// Chunk size of each copy direction.
    pub copy_buffer_size: usize,
}

impl PipeConfig {
    pub fn from_proxy_config(config: &ProxyConfig) -> Self {
        Self {
            peer_connection_timeout: config.peer_connection_timeout(),
            peer_host_deadline: config.peer_host_deadline(),
            max_dial_attempts: config.count_max_dial_attempts_to_peer,
            copy_buffer_size: config.size_copy_buffer_io,
        }
    }
}

/// Result of one copy direction.
#[derive(Debug, Default)]
pub struct DirectionOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Why the direction stopped, if not a clean EOF.
    pub error: Option<io::Error>,
}

/// Result of a finished session.
#[derive(Debug, Default)]
pub struct CopyOutcome {
    pub client_to_peer: DirectionOutcome,
    pub peer_to_client: DirectionOutcome,
}

/// A finished proxied session.
#[derive(Debug)]
pub struct SessionSummary {
    pub peer: SharedPeer,
    pub attempts: u32,
    pub bytes_to_peer: u64,
    pub bytes_from_peer: u64,
}

/// Connects clients to peers and copies data between them.
#[derive(Debug)]
pub struct ReverseDataPipe {
    selector: Arc<PeerSelector>,
    dialer: Arc<dyn Dialer>,
    config: PipeConfig,
    stats: Arc<ListenerStats>,
}

impl ReverseDataPipe {
    pub fn new(
        selector: Arc<PeerSelector>,
        dialer: Arc<dyn Dialer>,
        config: PipeConfig,
        stats: Arc<ListenerStats>,
    ) -> Self {
        Self {
            selector,
            dialer,
            config,
            stats,
        }
    }

    pub fn selector(&self) -> &Arc<PeerSelector> {
        &self.selector
    }

    /// Proxy one client connection until both directions finish.
    ///
    /// `client_deadline` is the absolute deadline of the client socket.
    pub async fn reverse_data<C>(
        &self,
        client: &mut C,
        client_deadline: Instant,
    ) -> Result<SessionSummary>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let (peer, mut peer_stream, attempts) = self.connect().await?;

        let peer_deadline = deadline_after(self.config.peer_host_deadline);
        let deadline = client_deadline.min(peer_deadline);

        let outcome = copy_bidirectional(
            client,
            &mut peer_stream,
            deadline,
            self.config.copy_buffer_size,
        )
        .await;

        if let Some(e) = &outcome.client_to_peer.error {
            debug!(peer = %peer, error = %e, "Copy from client to peer ended with error");
        }
        if let Some(e) = &outcome.peer_to_client.error {
            debug!(peer = %peer, error = %e, "Copy from peer to client ended with error");
        }

        ListenerStats::add(&self.stats.bytes_to_peer, outcome.client_to_peer.bytes);
        ListenerStats::add(&self.stats.bytes_from_peer, outcome.peer_to_client.bytes);

        Ok(SessionSummary {
            peer,
            attempts,
            bytes_to_peer: outcome.client_to_peer.bytes,
            bytes_from_peer: outcome.peer_to_client.bytes,
        })
    }

    /// Select and dial peers until one connects.
    async fn connect(&self) -> Result<(SharedPeer, TcpStream, u32)> {
        for attempt in 1..=self.config.max_dial_attempts {
            let peer = self.selector.next_peer().ok_or(BalancerError::NoActivePeers)?;

            match peer
                .dial(self.dialer.as_ref(), self.config.peer_connection_timeout)
                .await
            {
                Ok(stream) => {
                    ListenerStats::incr(&self.stats.peer_connected);
                    debug!(peer = %peer, attempt, "Connected to peer");
                    return Ok((peer, stream, attempt));
                }
                Err(source) => {
                    ListenerStats::incr(&self.stats.peer_failed);
                    let err = BalancerError::DialFailed {
                        addr: peer.address().to_string(),
                        source,
                    };
                    warn!(peer = %peer, attempt, error = %err, "Peer connection failed");
                    self.selector.mark_bad(&peer);
                }
            }
        }

        Err(BalancerError::DialAttemptsExhausted {
            attempts: self.config.max_dial_attempts,
        })
    }
}

/// `now + duration`, saturating to a far-future instant.
pub(crate) fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Copy data in both directions until both reach EOF, fail, or hit
/// `deadline`. Each direction shuts down its destination's write side when
/// it stops.
pub async fn copy_bidirectional<A, B>(
    client: &mut A,
    peer: &mut B,
    deadline: Instant,
    buffer_size: usize,
) -> CopyOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut peer_read, mut peer_write) = tokio::io::split(peer);

    let (client_to_peer, peer_to_client) = tokio::join!(
        copy_direction(&mut client_read, &mut peer_write, deadline, buffer_size),
        copy_direction(&mut peer_read, &mut client_write, deadline, buffer_size),
    );

    CopyOutcome {
        client_to_peer,
        peer_to_client,
    }
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    deadline: Instant,
    buffer_size: usize,
) -> DirectionOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut outcome = DirectionOutcome::default();
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = match timeout_at(deadline, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                outcome.error = Some(e);
                break;
            }
            Err(_) => {
                outcome.error = Some(io::Error::new(io::ErrorKind::TimedOut, "session deadline"));
                break;
            }
        };

        match timeout_at(deadline, writer.write_all(&buf[..n])).await {
            Ok(Ok(())) => outcome.bytes += n as u64,
            Ok(Err(e)) => {
                outcome.error = Some(e);
                break;
            }
            Err(_) => {
                outcome.error = Some(io::Error::new(io::ErrorKind::TimedOut, "session deadline"));
                break;
            }
        }
    }

    // Propagate EOF so the other side can finish its own direction.
    if let Ok(Err(e)) = timeout_at(deadline, writer.shutdown()).await {
        if outcome.error.is_none() && e.kind() != io::ErrorKind::NotConnected {
            outcome.error = Some(e);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{BadPeerCache, Peer, TcpDialer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_copy_waits_for_both_directions() {
        let (mut client, mut client_remote) = duplex(64);
        let (mut peer, mut peer_remote) = duplex(64);

        let copy = tokio::spawn(async move {
            copy_bidirectional(&mut client, &mut peer, far_deadline(), 16).await
        });

        // Client sends and closes its write side first.
        client_remote.write_all(b"ping").await.unwrap();
        client_remote.shutdown().await.unwrap();

        // Peer reads to EOF, then answers late.
        let mut received = Vec::new();
        peer_remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer_remote.write_all(b"late answer").await.unwrap();
        peer_remote.shutdown().await.unwrap();

        let mut answer = Vec::new();
        client_remote.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, b"late answer");

        let outcome = copy.await.unwrap();
        assert_eq!(outcome.client_to_peer.bytes, 4);
        assert_eq!(outcome.peer_to_client.bytes, 11);
        assert!(outcome.client_to_peer.error.is_none());
        assert!(outcome.peer_to_client.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(deadline_after(Duration::from_secs(3)), now + Duration::from_secs(3));
        assert!(deadline_after(Duration::MAX) >= now + FAR_FUTURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_stops_at_deadline() {
        let (mut client, _client_remote) = duplex(64);
        let (mut peer, _peer_remote) = duplex(64);

        let deadline = Instant::now() + Duration::from_secs(3);
        let outcome = copy_bidirectional(&mut client, &mut peer, deadline, 16).await;

        let error = outcome.client_to_peer.error.unwrap();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert!(outcome.peer_to_client.error.is_some());
    }

    /// Dialer that redirects every address to a fixed target after a number
    /// of refusals.
    #[derive(Debug)]
    struct FlakyDialer {
        target: String,
        refusals: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        async fn dial(&self, _addr: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.refusals {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            TcpDialer.dial(&self.target, connect_timeout).await
        }
    }

    fn make_pipe(
        peer_count: usize,
        dialer: Arc<dyn Dialer>,
        max_dial_attempts: u32,
    ) -> ReverseDataPipe {
        let peers = (0..peer_count)
            .map(|i| {
                let addr = format!("127.0.0.1:{}", 9100 + i);
                Arc::new(Peer::new(format!("p{i}"), "tcp", &addr))
            })
            .collect();
        let selector = Arc::new(PeerSelector::new(
            peers,
            BadPeerCache::new(Duration::from_secs(10)).unwrap(),
        ));
        let config = PipeConfig {
            peer_connection_timeout: Duration::from_millis(500),
            peer_host_deadline: Duration::from_secs(5),
            max_dial_attempts,
            copy_buffer_size: 1024,
        };
        ReverseDataPipe::new(selector, dialer, config, Arc::new(ListenerStats::default()))
    }

    #[tokio::test]
    async fn test_connect_retries_next_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dialer = Arc::new(FlakyDialer {
            target: listener.local_addr().unwrap().to_string(),
            refusals: 2,
            calls: AtomicU32::new(0),
        });

        let pipe = make_pipe(3, dialer, 5);
        let (peer, _stream, attempts) = pipe.connect().await.unwrap();

        assert_eq!(attempts, 3);
        // The two refusing peers are now skipped.
        assert_eq!(pipe.selector().bad_peers().len(), 2);
        assert!(pipe.selector().is_eligible(&peer));
        assert_eq!(ListenerStats::get(&pipe.stats.peer_failed), 2);
    }

    #[tokio::test]
    async fn test_connect_exhausts_by_cache() {
        let dialer = Arc::new(FlakyDialer {
            target: String::new(),
            refusals: u32::MAX,
            calls: AtomicU32::new(0),
        });

        let pipe = make_pipe(2, Arc::clone(&dialer) as Arc<dyn Dialer>, 30);
        let err = pipe.connect().await.unwrap_err();

        assert!(matches!(err, BalancerError::NoActivePeers));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_exhausts_attempts() {
        let dialer = Arc::new(FlakyDialer {
            target: String::new(),
            refusals: u32::MAX,
            calls: AtomicU32::new(0),
        });

        let pipe = make_pipe(5, Arc::clone(&dialer) as Arc<dyn Dialer>, 2);
        let err = pipe.connect().await.unwrap_err();

        assert!(matches!(err, BalancerError::DialAttemptsExhausted { attempts: 2 }));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reverse_data_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let dialer = Arc::new(FlakyDialer {
            target,
            refusals: 0,
            calls: AtomicU32::new(0),
        });
        let pipe = make_pipe(1, dialer, 3);

        let (mut client, mut client_remote) = duplex(1024);
        let session = tokio::spawn(async move {
            pipe.reverse_data(&mut client, far_deadline()).await
        });

        client_remote.write_all(b"echo me").await.unwrap();
        client_remote.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client_remote.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"echo me");

        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.bytes_to_peer, 7);
        assert_eq!(summary.bytes_from_peer, 7);
    }
}
