//! Relay signaling client
//!
//! Session-setup messages exchanged with the backend relay over plain
//! request/response calls, scoped to one channel: start, one-round
//! offer/answer negotiation, best-effort connectivity candidates, stop.
//! The relay performs the multi-destination fan-out on its side; this
//! client only establishes the one uplink session.

use livecast_core::{ChannelId, RelayConfig, SessionError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Signaling-layer errors. Mapped to the session taxonomy at the
/// controller boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("Relay unreachable: {0}")]
    Unreachable(String),

    #[error("Another session is already active for this channel")]
    AlreadyActive,

    #[error("Relay rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unexpected relay response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for SignalError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unreachable(err.to_string())
    }
}

impl From<SignalError> for SessionError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Unreachable(msg) => Self::RelayUnavailable(msg),
            SignalError::AlreadyActive => {
                Self::RelayUnavailable("channel already has an active session".to_string())
            }
            SignalError::Rejected { status, message } => {
                Self::NegotiationRejected(format!("status {status}: {message}"))
            }
            SignalError::Protocol(msg) => Self::NegotiationRejected(msg),
        }
    }
}

/// Offer/answer kind on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One session description, serialized as `{ "type": ..., "sdp": ... }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Protocol-standard connectivity candidate fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NegotiateResponse {
    answer: SessionDescription,
}

/// Session-setup exchange with the backend relay.
///
/// Calls are not retried here; retry and teardown-bounding policy belongs
/// to the caller.
#[async_trait::async_trait]
pub trait RelaySignaling: Send + Sync {
    /// Inform the relay a session is beginning for the channel.
    async fn start(&self, channel: &ChannelId) -> Result<(), SignalError>;

    /// Single-round negotiation: local offer in, relay answer out.
    async fn negotiate(
        &self,
        channel: &ChannelId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError>;

    /// Submit one local connectivity candidate. Best-effort; callers
    /// swallow failures.
    async fn send_candidate(
        &self,
        channel: &ChannelId,
        candidate: CandidateInit,
    ) -> Result<(), SignalError>;

    /// End the session for the channel. Safe to call when no session is
    /// active.
    async fn stop(&self, channel: &ChannelId) -> Result<(), SignalError>;
}

/// HTTP implementation over the relay's channel-scoped endpoints.
pub struct HttpSignalingClient {
    base_url: String,
    client: Client,
}

impl HttpSignalingClient {
    pub fn new(config: &RelayConfig) -> Result<Self, SignalError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, channel: &ChannelId, leaf: &str) -> String {
        format!("{}/api/live/{}/{}", self.base_url, channel, leaf)
    }
}

#[async_trait::async_trait]
impl RelaySignaling for HttpSignalingClient {
    async fn start(&self, channel: &ChannelId) -> Result<(), SignalError> {
        let response = self
            .client
            .post(self.endpoint(channel, "start"))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!(channel = %channel, "relay session started");
                Ok(())
            }
            StatusCode::CONFLICT => Err(SignalError::AlreadyActive),
            status => Err(SignalError::Unreachable(format!(
                "start returned status {status}"
            ))),
        }
    }

    async fn negotiate(
        &self,
        channel: &ChannelId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        let response = self
            .client
            .post(self.endpoint(channel, "offer"))
            .json(&offer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SignalError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| SignalError::Protocol(format!("malformed answer envelope: {e}")))?;

        if envelope.answer.kind != SdpKind::Answer {
            return Err(SignalError::Protocol(
                "negotiate returned a non-answer description".to_string(),
            ));
        }

        debug!(channel = %channel, "relay answered negotiation");
        Ok(envelope.answer)
    }

    async fn send_candidate(
        &self,
        channel: &ChannelId,
        candidate: CandidateInit,
    ) -> Result<(), SignalError> {
        let response = self
            .client
            .post(self.endpoint(channel, "candidate"))
            .json(&candidate)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SignalError::Unreachable(format!(
                "candidate returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn stop(&self, channel: &ChannelId) -> Result<(), SignalError> {
        let response = self
            .client
            .post(self.endpoint(channel, "stop"))
            .send()
            .await?;

        match response.status() {
            // Stopping an already-stopped channel is a relay-side no-op.
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(SignalError::Unreachable(format!(
                "stop returned status {status}"
            ))),
        }
    }
}
