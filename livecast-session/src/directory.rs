//! Destination directory client
//!
//! Read-only collaborator endpoints: the OAuth-connected destinations,
//! the enabled custom relay destinations, and the plan limits for a
//! channel. The controller consumes the three as one immutable snapshot
//! fetched at session start; it never subscribes to live updates, and
//! staleness is corrected by the next user-initiated refresh.

use livecast_core::{ChannelId, Destination, DestinationSnapshot, PlanLimits, RelayConfig};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Directory unreachable: {0}")]
    Unreachable(String),

    #[error("Unexpected directory response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unreachable(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DestinationListResponse {
    destinations: Vec<Destination>,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    max_active_destinations: usize,
}

/// Client for the channel-scoped destination read endpoints.
pub struct DestinationDirectory {
    base_url: String,
    client: Client,
}

impl DestinationDirectory {
    pub fn new(config: &RelayConfig) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, channel: &ChannelId, leaf: &str) -> String {
        format!("{}/api/channels/{}/{}", self.base_url, channel, leaf)
    }

    /// Fetch the complete destination snapshot for a channel.
    pub async fn fetch_snapshot(
        &self,
        channel: &ChannelId,
    ) -> Result<DestinationSnapshot, DirectoryError> {
        let oauth = self.fetch_destinations(channel, "destinations/oauth").await?;
        let relay = self.fetch_destinations(channel, "destinations/custom").await?;
        let limits = self.fetch_limits(channel).await?;

        debug!(
            channel = %channel,
            oauth_count = oauth.len(),
            relay_count = relay.len(),
            max_active = limits.max_active_destinations,
            "fetched destination snapshot"
        );
        Ok(DestinationSnapshot {
            oauth,
            relay,
            limits,
        })
    }

    async fn fetch_destinations(
        &self,
        channel: &ChannelId,
        leaf: &str,
    ) -> Result<Vec<Destination>, DirectoryError> {
        let response = self.client.get(self.endpoint(channel, leaf)).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Unreachable(format!(
                "{leaf} returned status {}",
                response.status()
            )));
        }
        let list: DestinationListResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Protocol(format!("malformed destination list: {e}")))?;
        Ok(list.destinations)
    }

    async fn fetch_limits(&self, channel: &ChannelId) -> Result<PlanLimits, DirectoryError> {
        let response = self
            .client
            .get(self.endpoint(channel, "plan"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Unreachable(format!(
                "plan returned status {}",
                response.status()
            )));
        }
        let plan: PlanResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Protocol(format!("malformed plan response: {e}")))?;
        Ok(PlanLimits {
            max_active_destinations: plan.max_active_destinations,
        })
    }
}
