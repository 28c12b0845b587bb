//! Peer-to-relay transport session
//!
//! Wraps one WebRTC peer connection: track attachment and replacement,
//! the one-round offer/answer exchange, and an event stream bridging
//! connection-state changes and locally gathered connectivity candidates
//! to the session state machine. The controller subscribes to events; it
//! never polls.

use crate::signaling::{CandidateInit, SdpKind, SessionDescription};
use livecast_core::{IceServerConfig, TrackSource};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Capacity of the per-transport event channel. State changes and
/// candidate gathering are low-volume; a small bound suffices.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid session description: {0}")]
    Sdp(String),

    #[error("No sender attached for {0} track")]
    NoSender(TrackSource),
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether the transport path is lost and the session must tear down.
    #[must_use]
    pub const fn is_lost(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Asynchronous transport events consumed by the session state machine
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Candidate(CandidateInit),
}

/// One peer-to-relay connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Attach a local track for the given source.
    async fn add_track(
        &self,
        source: TrackSource,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), TransportError>;

    /// Substitute the track for an already-attached source without
    /// renegotiating.
    async fn replace_track(
        &self,
        source: TrackSource,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), TransportError>;

    /// Create the local offer and commit it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply the relay's answer.
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;

    /// Take the event receiver. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds one transport per go-live attempt.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Production transport over an `RTCPeerConnection`.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackSource, Arc<RTCRtpSender>>>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl WebRtcTransport {
    pub async fn new(ice_servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..RTCIceServer::default()
                })
                .collect(),
            ..RTCConfiguration::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                debug!(state = %state, "peer connection state changed");
                if state_tx
                    .send(TransportEvent::StateChanged(state.into()))
                    .await
                    .is_err()
                {
                    debug!("transport event receiver dropped");
                }
            })
        }));

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events_tx = events_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let event = TransportEvent::Candidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                        if events_tx.send(event).await.is_err() {
                            debug!("transport event receiver dropped");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize local candidate"),
                }
            })
        }));

        Ok(Self {
            pc,
            senders: Mutex::new(HashMap::new()),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

#[async_trait::async_trait]
impl Transport for WebRtcTransport {
    async fn add_track(
        &self,
        source: TrackSource,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), TransportError> {
        let track: Arc<dyn TrackLocal + Send + Sync> = track;
        let sender = self.pc.add_track(track).await?;
        self.senders.lock().insert(source, sender);
        Ok(())
    }

    async fn replace_track(
        &self,
        source: TrackSource,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), TransportError> {
        let sender = self
            .senders
            .lock()
            .get(&source)
            .cloned()
            .ok_or(TransportError::NoSender(source))?;
        let track: Arc<dyn TrackLocal + Send + Sync> = track;
        sender.replace_track(Some(track)).await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        if answer.kind != SdpKind::Answer {
            return Err(TransportError::Sdp(
                "remote description is not an answer".to_string(),
            ));
        }
        let description = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Factory for production transports, carrying the ICE configuration.
pub struct WebRtcTransportFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcTransportFactory {
    #[must_use]
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait::async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(WebRtcTransport::new(&self.ice_servers).await?))
    }
}
