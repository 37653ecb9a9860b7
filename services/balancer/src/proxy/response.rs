//! Diagnostic response written to a client whose connection could not be
//! proxied.
//!
//! The balancer does not speak HTTP; the envelope only exists so tooling
//! that expects HTTP framing can read the JSON body.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{BalancerError, Result};
use crate::result_code::ResultCode;

/// JSON body of the diagnostic response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub status_code: ResultCode,
    pub description: String,
}

impl FailureResponse {
    pub fn from_error(err: &BalancerError) -> Self {
        Self {
            status_code: err.result_code(),
            description: err.to_string(),
        }
    }

    /// Encode the full HTTP/1.1 envelope.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;

        let mut message = format!(
            "HTTP/1.1 200 OK\r\n\
             Connection: close\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             \r\n",
            body.len()
        )
        .into_bytes();
        message.extend_from_slice(&body);

        Ok(message)
    }
}

/// Write the diagnostic response for `err` to the client. Not retried.
pub async fn send_response_to_client<W>(client: &mut W, err: &BalancerError) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let message = FailureResponse::from_error(err).encode()?;

    client
        .write_all(&message)
        .await
        .map_err(BalancerError::SendResponse)?;
    client.flush().await.map_err(BalancerError::SendResponse)?;

    Ok(())
}
