//! Local media acquisition
//!
//! This module handles:
//! - Device enumeration and track acquisition behind a platform seam
//! - Per-kind capture policy (webcam vs. screen share)
//! - Track replacement without restarting a session
//! - Idempotent release of a whole bundle
//!
//! Platform capture pipelines sit behind [`CaptureBackend`]; the
//! controller only ever sees [`CapturedTrack`]s wrapping the local
//! WebRTC track plus its enable flag and end-of-stream signal.

use livecast_core::{MediaKind, SessionKind, TrackSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Capture-layer errors, mapped onto the session taxonomy at the
/// controller boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Capture unsupported: {0}")]
    Unsupported(String),

    #[error("Constraints cannot be satisfied: {0}")]
    Overconstrained(String),
}

impl From<CaptureError> for livecast_core::SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            CaptureError::DeviceUnavailable(msg) => Self::DeviceUnavailable(msg),
            CaptureError::DeviceBusy(msg) => Self::DeviceBusy(msg),
            CaptureError::Unsupported(msg) => Self::UnsupportedContext(msg),
            // An over-constrained request that survived the relaxed retry
            // means no device can produce the stream.
            CaptureError::Overconstrained(msg) => Self::DeviceUnavailable(msg),
        }
    }
}

/// A capture device visible to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: MediaKind,
}

/// Requested track parameters. Empty fields mean "backend default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackConstraints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub device_id: Option<String>,
}

impl TrackConstraints {
    /// The same request with resolution and frame-rate constraints
    /// dropped, keeping only the device selection.
    #[must_use]
    pub fn relaxed(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            ..Self::default()
        }
    }
}

/// One track acquisition request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub source: TrackSource,
    pub constraints: TrackConstraints,
}

/// Platform capture seam. Implementations own the producer pipeline that
/// feeds samples into the returned track; the session layer never touches
/// raw frames.
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Enumerate capture devices of one media kind.
    async fn list_devices(&self, kind: MediaKind) -> Result<Vec<DeviceInfo>, CaptureError>;

    /// Open one track. The producer keeps running until the returned
    /// track's cancellation token fires or the user stops it natively.
    async fn open(&self, request: CaptureRequest) -> Result<CapturedTrack, CaptureError>;
}

/// An active local track with its capture metadata.
///
/// `ended` flips to `true` when the producer stops on its own, e.g. the
/// display capture's native "stop sharing" control; the controller treats
/// that exactly like an explicit stop command.
#[derive(Debug)]
pub struct CapturedTrack {
    source: TrackSource,
    device_label: String,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    ended: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl CapturedTrack {
    pub fn new(
        source: TrackSource,
        device_label: impl Into<String>,
        track: Arc<TrackLocalStaticSample>,
        ended: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            device_label: device_label.into(),
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            ended,
            cancel,
        }
    }

    #[must_use]
    pub const fn source(&self) -> TrackSource {
        self.source
    }

    #[must_use]
    pub const fn media_kind(&self) -> MediaKind {
        self.source.media_kind()
    }

    #[must_use]
    pub fn device_label(&self) -> &str {
        &self.device_label
    }

    /// The underlying WebRTC track, for attaching to a transport or a
    /// preview sink.
    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// User-level enable flag (mute / video-off). Producers drop samples
    /// while the flag is off; capture itself keeps running.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Whether the producer already stopped on its own.
    #[must_use]
    pub fn has_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Watch for the producer stopping on its own.
    #[must_use]
    pub fn ended_watch(&self) -> watch::Receiver<bool> {
        self.ended.clone()
    }

    /// Stop the producer pipeline. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn enabled_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }
}

/// The ordered set of active local tracks for one session.
#[derive(Debug)]
pub struct MediaBundle {
    tracks: Vec<CapturedTrack>,
}

impl MediaBundle {
    #[must_use]
    pub fn new(tracks: Vec<CapturedTrack>) -> Self {
        Self { tracks }
    }

    #[must_use]
    pub fn tracks(&self) -> &[CapturedTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// The video track, if any (sessions carry at most one).
    #[must_use]
    pub fn video(&self) -> Option<&CapturedTrack> {
        self.tracks
            .iter()
            .find(|t| t.media_kind() == MediaKind::Video)
    }

    #[must_use]
    pub fn find(&self, source: TrackSource) -> Option<&CapturedTrack> {
        self.tracks.iter().find(|t| t.source() == source)
    }

    /// Swap in a replacement for the track with the same source, returning
    /// the old one. The replacement is appended when no track of that
    /// source existed.
    pub fn swap(&mut self, replacement: CapturedTrack) -> Option<CapturedTrack> {
        let source = replacement.source();
        match self.tracks.iter().position(|t| t.source() == source) {
            Some(index) => {
                let old = std::mem::replace(&mut self.tracks[index], replacement);
                Some(old)
            }
            None => {
                self.tracks.push(replacement);
                None
            }
        }
    }

    /// Flip the enable flag on every audio track.
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.media_kind() == MediaKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    /// Flip the enable flag on every video track.
    pub fn set_video_enabled(&self, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.media_kind() == MediaKind::Video) {
            track.set_enabled(enabled);
        }
    }

    /// Stop every producer. Idempotent.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// What to capture alongside the mandatory video track
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub video: TrackConstraints,
    /// Screen sessions only: also capture system audio (best-effort)
    pub capture_system_audio: bool,
    /// Screen sessions only: also capture the microphone (best-effort).
    /// Webcam sessions always capture the microphone.
    pub capture_microphone: bool,
    pub microphone_device: Option<String>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            video: TrackConstraints::default(),
            capture_system_audio: true,
            capture_microphone: true,
            microphone_device: None,
        }
    }
}

impl CaptureOptions {
    /// Seed the video constraints from configuration defaults.
    #[must_use]
    pub fn from_config(config: &livecast_core::CaptureConfig) -> Self {
        Self {
            video: TrackConstraints {
                width: Some(config.video_width),
                height: Some(config.video_height),
                frame_rate: Some(config.frame_rate),
                device_id: None,
            },
            ..Self::default()
        }
    }
}

/// Acquisition policy over any [`CaptureBackend`].
#[derive(Clone)]
pub struct CaptureManager {
    backend: Arc<dyn CaptureBackend>,
}

impl CaptureManager {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self { backend }
    }

    /// Acquire the local tracks for one session kind.
    ///
    /// Webcam: camera and microphone together; fails before prompting if
    /// either device class is absent; an over-constrained camera request
    /// is retried once with relaxed constraints; a microphone failure is
    /// fatal. Screen: display video is mandatory; system audio and the
    /// microphone are each best-effort and dropped with a warning.
    pub async fn acquire(
        &self,
        kind: SessionKind,
        options: &CaptureOptions,
    ) -> Result<MediaBundle, CaptureError> {
        match kind {
            SessionKind::Webcam => self.acquire_webcam(options).await,
            SessionKind::Screen => self.acquire_screen(options).await,
        }
    }

    async fn acquire_webcam(&self, options: &CaptureOptions) -> Result<MediaBundle, CaptureError> {
        // Check both device classes exist before prompting for anything.
        let cameras = self.backend.list_devices(MediaKind::Video).await?;
        if cameras.is_empty() {
            return Err(CaptureError::DeviceUnavailable(
                "no camera device present".to_string(),
            ));
        }
        let microphones = self.backend.list_devices(MediaKind::Audio).await?;
        if microphones.is_empty() {
            return Err(CaptureError::DeviceUnavailable(
                "no microphone device present".to_string(),
            ));
        }

        let camera = self
            .open_video_with_retry(TrackSource::Camera, &options.video)
            .await?;

        let microphone = match self
            .backend
            .open(CaptureRequest {
                source: TrackSource::Microphone,
                constraints: TrackConstraints {
                    device_id: options.microphone_device.clone(),
                    ..TrackConstraints::default()
                },
            })
            .await
        {
            Ok(track) => track,
            Err(err) => {
                // Microphone failure is fatal for webcam capture; do not
                // leave the camera pipeline running.
                camera.stop();
                return Err(err);
            }
        };

        info!(
            camera = %camera.device_label(),
            microphone = %microphone.device_label(),
            "acquired webcam bundle"
        );
        Ok(MediaBundle::new(vec![camera, microphone]))
    }

    async fn acquire_screen(&self, options: &CaptureOptions) -> Result<MediaBundle, CaptureError> {
        let display = self
            .backend
            .open(CaptureRequest {
                source: TrackSource::Display,
                constraints: options.video.clone(),
            })
            .await?;

        let mut tracks = vec![display];

        if options.capture_system_audio {
            match self
                .backend
                .open(CaptureRequest {
                    source: TrackSource::SystemAudio,
                    constraints: TrackConstraints::default(),
                })
                .await
            {
                Ok(track) => tracks.push(track),
                Err(err) => {
                    warn!(error = %err, "system audio capture failed, continuing without it");
                }
            }
        }

        if options.capture_microphone {
            match self
                .backend
                .open(CaptureRequest {
                    source: TrackSource::Microphone,
                    constraints: TrackConstraints {
                        device_id: options.microphone_device.clone(),
                        ..TrackConstraints::default()
                    },
                })
                .await
            {
                Ok(track) => tracks.push(track),
                Err(err) => {
                    warn!(error = %err, "microphone capture failed, continuing without it");
                }
            }
        }

        info!(track_count = tracks.len(), "acquired screen bundle");
        Ok(MediaBundle::new(tracks))
    }

    async fn open_video_with_retry(
        &self,
        source: TrackSource,
        constraints: &TrackConstraints,
    ) -> Result<CapturedTrack, CaptureError> {
        match self
            .backend
            .open(CaptureRequest {
                source,
                constraints: constraints.clone(),
            })
            .await
        {
            Ok(track) => Ok(track),
            Err(CaptureError::Overconstrained(msg)) => {
                debug!(
                    source = %source,
                    reason = %msg,
                    "constrained capture failed, retrying relaxed"
                );
                self.backend
                    .open(CaptureRequest {
                        source,
                        constraints: constraints.relaxed(),
                    })
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Open a replacement track for a device switch. The caller pushes it
    /// into any live transport before the old track is stopped.
    pub async fn open_replacement(
        &self,
        source: TrackSource,
        constraints: TrackConstraints,
    ) -> Result<CapturedTrack, CaptureError> {
        self.backend.open(CaptureRequest { source, constraints }).await
    }

    /// Stop every track in the bundle. Idempotent.
    pub fn release(&self, bundle: &MediaBundle) {
        bundle.stop_all();
    }
}
