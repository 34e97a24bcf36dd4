//! Internal framed channel to worker peers.
//!
//! Tunnels speak length-delimited frames over TCP to the worker peer's
//! relay endpoint. The gateway opens the link with a signed hello frame
//! (HMAC over the canonical hello body with the registration secret) naming
//! the relay it is tunneling for; everything after that is opaque Nostr
//! frame bytes pumped verbatim in both directions.

use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use hypertuna_core::signing::sign_request;

/// Errors from the peer link.
#[derive(Debug, thiserror::Error)]
pub enum PeerLinkError {
    /// TCP connect failed.
    #[error("peer dial to '{endpoint}' failed: {reason}")]
    Dial { endpoint: String, reason: String },

    /// TCP connect did not complete within the dial timeout.
    #[error("peer dial to '{endpoint}' timed out")]
    DialTimeout { endpoint: String },

    /// A frame could not be sent or received.
    #[error("peer link io error: {reason}")]
    Io { reason: String },
}

/// A connected, framed channel to one worker peer.
pub struct PeerLink {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    endpoint: String,
}

impl PeerLink {
    /// Dial a worker peer and send the signed hello frame.
    ///
    /// # Errors
    ///
    /// Returns [`PeerLinkError::DialTimeout`] / [`PeerLinkError::Dial`] on
    /// connect failures and [`PeerLinkError::Io`] if the hello cannot be
    /// written.
    pub async fn connect(
        endpoint: &str,
        relay_key: &str,
        gateway_id: &str,
        registration_secret: &[u8],
        dial_timeout: Duration,
    ) -> Result<Self, PeerLinkError> {
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| PeerLinkError::DialTimeout {
                endpoint: endpoint.to_owned(),
            })?
            .map_err(|e| PeerLinkError::Dial {
                endpoint: endpoint.to_owned(),
                reason: e.to_string(),
            })?;

        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let ts_ms = Utc::now().timestamp_millis();
        let body = json!({ "relayKey": relay_key, "gatewayId": gateway_id });
        let signature = sign_request(registration_secret, gateway_id, &body, ts_ms);
        let hello = json!({
            "type": "hello",
            "relayKey": relay_key,
            "gatewayId": gateway_id,
            "ts": ts_ms,
            "signature": signature,
        });
        let hello_bytes = serde_json::to_vec(&hello).map_err(|e| PeerLinkError::Io {
            reason: format!("hello encode failed: {e}"),
        })?;
        framed
            .send(Bytes::from(hello_bytes))
            .await
            .map_err(|e| PeerLinkError::Io {
                reason: format!("hello send failed: {e}"),
            })?;

        debug!(endpoint = %endpoint, relay_key = %relay_key, "peer link opened");
        Ok(Self {
            framed,
            endpoint: endpoint.to_owned(),
        })
    }

    /// Send one opaque frame to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`PeerLinkError::Io`] on write failure.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), PeerLinkError> {
        self.framed.send(frame).await.map_err(|e| PeerLinkError::Io {
            reason: e.to_string(),
        })
    }

    /// Receive the next frame from the peer. `None` means the peer closed.
    pub async fn next_frame(&mut self) -> Option<Result<BytesMut, PeerLinkError>> {
        self.framed.next().await.map(|r| {
            r.map_err(|e| PeerLinkError::Io {
                reason: e.to_string(),
            })
        })
    }

    /// The endpoint this link is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
