//! LiveCast session controller
//!
//! Owns the lifecycle of one outgoing broadcast from a client to the
//! backend relay, which fans the stream out to the configured
//! destinations.
//!
//! ## Architecture
//!
//! - **[`StreamSession`]**: the state machine (capture, negotiate, live,
//!   teardown), parametrized by session kind (webcam / screen)
//! - **[`CaptureManager`]**: local media acquisition over a platform
//!   [`CaptureBackend`]
//! - **[`RelaySignaling`] / [`HttpSignalingClient`]**: session-setup
//!   exchange with the relay
//! - **[`Transport`] / [`WebRtcTransport`]**: the peer-to-relay
//!   connection
//! - **[`MinimizedSessions`]**: process-wide registry that lets a live
//!   broadcast survive its UI surface being torn down and recreated
//! - **[`DestinationDirectory`]**: read-only destination/plan snapshot
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livecast_session::{CaptureManager, CaptureOptions, StreamSession, WebRtcTransportFactory};
//!
//! let session = StreamSession::new(
//!     kind,
//!     channel,
//!     snapshot.all(),
//!     CaptureManager::new(backend),
//!     Arc::new(HttpSignalingClient::new(&config.relay)?),
//!     Arc::new(WebRtcTransportFactory::new(config.ice_servers.clone())),
//!     &config.teardown,
//! );
//! session.request_permissions(&CaptureOptions::from_config(&config.capture)).await?;
//! session.go_live().await?;
//! ```

pub mod capture;
pub mod directory;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod timeout;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use capture::{
    CaptureBackend, CaptureError, CaptureManager, CaptureOptions, CaptureRequest, CapturedTrack,
    DeviceInfo, MediaBundle, TrackConstraints,
};
pub use directory::{DestinationDirectory, DirectoryError};
pub use registry::{MinimizedEntry, MinimizedSessions, RegistryEvent, TeardownFn};
pub use session::{SessionEvent, SessionSnapshot, StreamSession};
pub use signaling::{
    CandidateInit, HttpSignalingClient, RelaySignaling, SdpKind, SessionDescription, SignalError,
};
pub use timeout::with_timeout;
pub use transport::{
    ConnectionState, Transport, TransportError, TransportEvent, TransportFactory, WebRtcTransport,
    WebRtcTransportFactory,
};
