//! Destination model and capacity guard
//!
//! A destination is a downstream target the relay fans the session out to:
//! either an OAuth-connected platform account or a manually configured
//! relay target. The capacity guard decides whether one more destination
//! may go live under the channel's plan limit. It is advisory: callers in
//! the destination-management flows re-check it at activation time, since
//! other destinations may have gone live concurrently.

use serde::{Deserialize, Serialize};

/// How a destination is wired to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Platform account connected via OAuth
    Oauth,
    /// Manually configured relay target (e.g. an RTMP ingest URL)
    Relay,
}

/// One configured downstream target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Platform name, e.g. "twitch" or "custom-rtmp-1"
    pub platform: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn new(platform: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            platform: platform.into(),
            kind,
        }
    }
}

/// Plan limits for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Maximum number of simultaneously live destinations
    pub max_active_destinations: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_active_destinations: 1,
        }
    }
}

/// Immutable view of a channel's configured destinations and limits,
/// fetched once at session start. Staleness is tolerated; the next
/// user-initiated refresh corrects it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationSnapshot {
    pub oauth: Vec<Destination>,
    pub relay: Vec<Destination>,
    pub limits: PlanLimits,
}

impl DestinationSnapshot {
    /// All destinations of the snapshot, OAuth first.
    #[must_use]
    pub fn all(&self) -> Vec<Destination> {
        self.oauth.iter().chain(self.relay.iter()).cloned().collect()
    }
}

/// Count active destinations per kind: `(oauth, relay)`.
#[must_use]
pub fn active_counts(active: &[Destination]) -> (usize, usize) {
    let oauth = active
        .iter()
        .filter(|d| d.kind == DestinationKind::Oauth)
        .count();
    (oauth, active.len() - oauth)
}

/// Whether `requested` may go live given the currently active destinations
/// and the plan limit.
///
/// A destination that is already active is always permitted, regardless of
/// the limit; re-displaying it must not fail. A new destination is
/// permitted only while the total active count is below the limit.
#[must_use]
pub fn can_activate(requested: &Destination, active: &[Destination], plan_limit: usize) -> bool {
    if active.contains(requested) {
        return true;
    }
    let (oauth, relay) = active_counts(active);
    oauth + relay < plan_limit
}
