//! Active TCP health checks.
//!
//! One probe loop runs per peer. Each iteration dials the peer, records the
//! result in the peer's liveness flag, then sleeps for the configured
//! interval. The selector reads the flag without further coordination, so a
//! peer can still be picked right after a failed probe; the data path's dial
//! retry covers that window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Dialer, SharedPeer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Dial a peer once. The probe connection is closed immediately.
pub async fn probe(
    peer: &SharedPeer,
    dialer: &dyn Dialer,
    check_timeout: Duration,
) -> HealthStatus {
    match peer.dial(dialer, check_timeout).await {
        Ok(_stream) => {
            debug!(peer = %peer, "tcp health check succeeded");
            HealthStatus::Healthy
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "tcp health check failed");
            HealthStatus::Unhealthy
        }
    }
}

/// Probe `peer` until `shutdown` turns `true` or its sender is dropped.
pub async fn run_health_checks(
    peer: SharedPeer,
    dialer: Arc<dyn Dialer>,
    check_timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        peer = %peer,
        timeout_ms = check_timeout.as_millis() as u64,
        interval_ms = interval.as_millis() as u64,
        "starting health check loop"
    );

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let status = probe(&peer, dialer.as_ref(), check_timeout).await;
        let is_healthy = status == HealthStatus::Healthy;
        let was_healthy = peer.set_alive(is_healthy);

        if is_healthy != was_healthy {
            if is_healthy {
                info!(peer = %peer, "Peer became healthy");
            } else {
                warn!(peer = %peer, "Peer became unhealthy");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(peer = %peer, "Health check loop shutting down");
}

/// Spawn [`run_health_checks`] as a background task.
pub fn spawn_health_checker(
    peer: SharedPeer,
    dialer: Arc<dyn Dialer>,
    check_timeout: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_health_checks(peer, dialer, check_timeout, interval, shutdown))
}
