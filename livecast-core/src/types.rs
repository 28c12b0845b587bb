//! Common types used throughout the session controller

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a broadcast channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a session captures, which selects the capture policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Camera plus microphone
    Webcam,
    /// Display capture, optional system audio, optional microphone
    Screen,
}

impl SessionKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Webcam => "webcam",
            Self::Screen => "screen",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a session, derived from its kind and channel.
///
/// The derivation is stable: the same kind and channel always produce the
/// same id, so a UI surface can find a minimized session again without
/// holding any state of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id for a session of `kind` on `channel`.
    #[must_use]
    pub fn derive(kind: SessionKind, channel: &ChannelId) -> Self {
        Self(format!("{}:{}", kind.as_str(), channel.as_str()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackSource {
    Camera,
    Display,
    SystemAudio,
    Microphone,
}

impl TrackSource {
    /// The media kind a track from this source carries.
    #[must_use]
    pub const fn media_kind(&self) -> MediaKind {
        match self {
            Self::Camera | Self::Display => MediaKind::Video,
            Self::SystemAudio | Self::Microphone => MediaKind::Audio,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Display => "display",
            Self::SystemAudio => "system-audio",
            Self::Microphone => "microphone",
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No local media, no transport
    Idle,
    /// Capture acquisition in flight
    PermissionRequested,
    /// Local tracks available for preview, not yet broadcasting
    PermissionGranted,
    /// Relay negotiation done, waiting for the transport to connect
    Connecting,
    /// Broadcasting
    Live,
    /// A failure was recorded; transient, the machine settles in `Idle`
    Error,
    /// Force-disconnected, terminal
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PermissionRequested => "permission_requested",
            Self::PermissionGranted => "permission_granted",
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_derivation() {
        let channel = ChannelId::from("chan-42");
        let id = SessionId::derive(SessionKind::Webcam, &channel);
        assert_eq!(id.as_str(), "webcam:chan-42");

        let id = SessionId::derive(SessionKind::Screen, &channel);
        assert_eq!(id.as_str(), "screen:chan-42");
    }

    #[test]
    fn test_session_id_is_stable() {
        let channel = ChannelId::from("chan");
        assert_eq!(
            SessionId::derive(SessionKind::Screen, &channel),
            SessionId::derive(SessionKind::Screen, &channel)
        );
    }

    #[test]
    fn test_track_source_media_kind() {
        assert_eq!(TrackSource::Camera.media_kind(), MediaKind::Video);
        assert_eq!(TrackSource::Display.media_kind(), MediaKind::Video);
        assert_eq!(TrackSource::SystemAudio.media_kind(), MediaKind::Audio);
        assert_eq!(TrackSource::Microphone.media_kind(), MediaKind::Audio);
    }
}
