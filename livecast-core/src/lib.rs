//! LiveCast core vocabulary
//!
//! Shared building blocks for the LiveCast session controller:
//!
//! - **Identifiers**: [`ChannelId`], [`SessionId`], [`SessionKind`]
//! - **Session states**: [`SessionState`] and the error taxonomy ([`SessionError`])
//! - **Destinations**: destination model and the capacity guard
//! - **Configuration**: file/env-loaded [`Config`]
//! - **Logging**: `tracing` subscriber bootstrap

pub mod config;
pub mod destination;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{CaptureConfig, Config, IceServerConfig, LoggingConfig, RelayConfig, TeardownConfig};
pub use destination::{active_counts, can_activate, Destination, DestinationKind, DestinationSnapshot, PlanLimits};
pub use error::{Result, SessionError};
pub use types::{ChannelId, MediaKind, SessionId, SessionKind, SessionState, TrackSource};
