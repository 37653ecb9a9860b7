//! Error types for the balancer.

use std::io;

use thiserror::Error;
use vbalancer_ttl_cache::CacheError;

use crate::result_code::ResultCode;

/// Balancer errors, each mapped to a [`ResultCode`].
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Empty peer list, or every peer is unhealthy or marked bad.
    #[error("can't find active peers")]
    NoActivePeers,

    /// A single peer refused or timed out the dial.
    #[error("failed to dial peer {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Every allowed dial attempt failed.
    #[error("no peer accepted the connection after {attempts} dial attempts")]
    DialAttemptsExhausted { attempts: u32 },

    /// Socket IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Could not serialize the diagnostic response.
    #[error("can't marshal response: {0}")]
    ResponseEncode(#[from] serde_json::Error),

    /// Could not write the diagnostic response to the client.
    #[error("failed to send response to client: {0}")]
    SendResponse(#[source] io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Could not bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// In-flight connections did not drain before the shutdown timeout.
    #[error("shutdown timed out with {active} connections still active")]
    ShutdownTimeout { active: usize },

    /// A connection handler panicked.
    #[error("connection handler panicked: {0}")]
    HandlerPanicked(String),

    /// TTL cache construction failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl BalancerError {
    /// Get the result code reported to clients for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            BalancerError::NoActivePeers => ResultCode::ErrCantFindActivePeers,
            BalancerError::DialFailed { .. } => ResultCode::ErrPeerIsFailed,
            BalancerError::DialAttemptsExhausted { .. } => ResultCode::ErrPeerIsFailed,
            BalancerError::Io(_) => ResultCode::ErrProxy,
            BalancerError::ResponseEncode(_) => ResultCode::ErrCantMarshalJson,
            BalancerError::SendResponse(_) => ResultCode::ErrSendResponseToClient,
            BalancerError::Config(_) => ResultCode::ErrEmptyValue,
            BalancerError::Bind { .. } => ResultCode::ErrProxy,
            BalancerError::ShutdownTimeout { .. } => ResultCode::ErrProxy,
            BalancerError::HandlerPanicked(_) => ResultCode::ErrGotPanic,
            BalancerError::Cache(_) => ResultCode::ErrProxy,
        }
    }
}

pub type Result<T> = std::result::Result<T, BalancerError>;
