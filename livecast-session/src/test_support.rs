//! In-tree fakes for the capture, signaling and transport seams.

use crate::capture::{
    CaptureBackend, CaptureError, CaptureManager, CaptureRequest, CapturedTrack, DeviceInfo,
};
use crate::session::StreamSession;
use crate::signaling::{CandidateInit, RelaySignaling, SdpKind, SessionDescription, SignalError};
use crate::transport::{
    ConnectionState, Transport, TransportError, TransportEvent, TransportFactory,
};
use livecast_core::{
    ChannelId, Destination, MediaKind, SessionKind, SessionState, TeardownConfig, TrackSource,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

// ---- capture ----------------------------------------------------------

pub(crate) struct FakeBackend {
    devices: Mutex<Vec<DeviceInfo>>,
    fail_next: Mutex<HashMap<TrackSource, CaptureError>>,
    constrained_rejects: Mutex<HashSet<TrackSource>>,
    opened: Mutex<Vec<CaptureRequest>>,
    ended_txs: Mutex<HashMap<TrackSource, watch::Sender<bool>>>,
    tokens: Mutex<HashMap<TrackSource, Vec<CancellationToken>>>,
    enabled: Mutex<HashMap<TrackSource, Arc<AtomicBool>>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(vec![
                DeviceInfo {
                    id: "cam-1".to_string(),
                    label: "Integrated Camera".to_string(),
                    kind: MediaKind::Video,
                },
                DeviceInfo {
                    id: "mic-1".to_string(),
                    label: "Built-in Microphone".to_string(),
                    kind: MediaKind::Audio,
                },
            ]),
            fail_next: Mutex::new(HashMap::new()),
            constrained_rejects: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
            ended_txs: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            enabled: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn without_devices() -> Arc<Self> {
        let backend = Self::new();
        backend.devices.lock().clear();
        backend
    }

    pub(crate) fn fail_next_open(&self, source: TrackSource, err: CaptureError) {
        self.fail_next.lock().insert(source, err);
    }

    /// Reject constrained requests for `source` with `Overconstrained`
    /// until the constraints are relaxed.
    pub(crate) fn reject_constrained(&self, source: TrackSource) {
        self.constrained_rejects.lock().insert(source);
    }

    pub(crate) fn opened_requests(&self) -> Vec<CaptureRequest> {
        self.opened.lock().clone()
    }

    pub(crate) fn opened_sources(&self) -> Vec<TrackSource> {
        self.opened.lock().iter().map(|r| r.source).collect()
    }

    /// Fire the native end-of-stream signal on the latest track of a
    /// source.
    pub(crate) fn end_track(&self, source: TrackSource) {
        if let Some(tx) = self.ended_txs.lock().get(&source) {
            let _ = tx.send(true);
        }
    }

    /// Whether every pipeline ever opened for `source` was cancelled.
    pub(crate) fn is_cancelled(&self, source: TrackSource) -> bool {
        let tokens = self.tokens.lock();
        tokens
            .get(&source)
            .is_some_and(|list| !list.is_empty() && list.iter().all(CancellationToken::is_cancelled))
    }

    /// Whether the `index`-th pipeline opened for `source` was cancelled.
    pub(crate) fn token_cancelled(&self, source: TrackSource, index: usize) -> bool {
        self.tokens
            .lock()
            .get(&source)
            .and_then(|list| list.get(index))
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Enable flag of the latest track of a source.
    pub(crate) fn track_enabled(&self, source: TrackSource) -> Option<bool> {
        self.enabled
            .lock()
            .get(&source)
            .map(|flag| flag.load(Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl CaptureBackend for FakeBackend {
    async fn list_devices(&self, kind: MediaKind) -> Result<Vec<DeviceInfo>, CaptureError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect())
    }

    async fn open(&self, request: CaptureRequest) -> Result<CapturedTrack, CaptureError> {
        self.opened.lock().push(request.clone());

        if let Some(err) = self.fail_next.lock().remove(&request.source) {
            return Err(err);
        }
        if self.constrained_rejects.lock().contains(&request.source)
            && request.constraints.width.is_some()
        {
            return Err(CaptureError::Overconstrained(
                "requested resolution not supported".to_string(),
            ));
        }

        let mime_type = match request.source.media_kind() {
            MediaKind::Video => MIME_TYPE_VP8,
            MediaKind::Audio => MIME_TYPE_OPUS,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..RTCRtpCodecCapability::default()
            },
            format!("{}-track", request.source),
            "livecast".to_string(),
        ));
        let (ended_tx, ended_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let label = request
            .constraints
            .device_id
            .clone()
            .unwrap_or_else(|| format!("{}-default", request.source));
        let captured = CapturedTrack::new(request.source, label, track, ended_rx, cancel.clone());

        self.ended_txs.lock().insert(request.source, ended_tx);
        self.tokens.lock().entry(request.source).or_default().push(cancel);
        self.enabled
            .lock()
            .insert(request.source, captured.enabled_handle());
        Ok(captured)
    }
}

// ---- signaling --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayCall {
    Start,
    Negotiate,
    Candidate,
    Stop,
}

pub(crate) struct FakeRelay {
    calls: Mutex<Vec<RelayCall>>,
    fail_start: Mutex<Option<SignalError>>,
    fail_negotiate: Mutex<Option<SignalError>>,
    stop_hangs: AtomicBool,
}

impl FakeRelay {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_start: Mutex::new(None),
            fail_negotiate: Mutex::new(None),
            stop_hangs: AtomicBool::new(false),
        })
    }

    pub(crate) fn calls(&self) -> Vec<RelayCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, call: &RelayCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub(crate) fn fail_next_start(&self, err: SignalError) {
        *self.fail_start.lock() = Some(err);
    }

    pub(crate) fn fail_next_negotiate(&self, err: SignalError) {
        *self.fail_negotiate.lock() = Some(err);
    }

    /// Make every subsequent stop call hang forever.
    pub(crate) fn hang_stop(&self) {
        self.stop_hangs.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RelaySignaling for FakeRelay {
    async fn start(&self, _channel: &ChannelId) -> Result<(), SignalError> {
        self.calls.lock().push(RelayCall::Start);
        match self.fail_start.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn negotiate(
        &self,
        _channel: &ChannelId,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        self.calls.lock().push(RelayCall::Negotiate);
        match self.fail_negotiate.lock().take() {
            Some(err) => Err(err),
            None => Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0\r\n".to_string(),
            }),
        }
    }

    async fn send_candidate(
        &self,
        _channel: &ChannelId,
        _candidate: CandidateInit,
    ) -> Result<(), SignalError> {
        self.calls.lock().push(RelayCall::Candidate);
        Ok(())
    }

    async fn stop(&self, _channel: &ChannelId) -> Result<(), SignalError> {
        self.calls.lock().push(RelayCall::Stop);
        if self.stop_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

// ---- transport --------------------------------------------------------

pub(crate) struct FakeTransportState {
    state: Mutex<ConnectionState>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    added: Mutex<Vec<TrackSource>>,
    replaced: Mutex<Vec<TrackSource>>,
    closed: AtomicBool,
    fail_apply_answer: AtomicBool,
}

impl FakeTransportState {
    fn new(fail_apply_answer: bool) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(32);
        Arc::new(Self {
            state: Mutex::new(ConnectionState::New),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            added: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_apply_answer: AtomicBool::new(fail_apply_answer),
        })
    }

    /// Drive the transport to a state and emit the matching event.
    pub(crate) async fn emit_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged(state))
            .await;
    }

    pub(crate) async fn emit_candidate(&self, candidate: CandidateInit) {
        let _ = self.events_tx.send(TransportEvent::Candidate(candidate)).await;
    }

    pub(crate) fn added_sources(&self) -> Vec<TrackSource> {
        self.added.lock().clone()
    }

    pub(crate) fn replaced_sources(&self) -> Vec<TrackSource> {
        self.replaced.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeTransport(Arc<FakeTransportState>);

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn add_track(
        &self,
        source: TrackSource,
        _track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), TransportError> {
        self.0.added.lock().push(source);
        Ok(())
    }

    async fn replace_track(
        &self,
        source: TrackSource,
        _track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), TransportError> {
        if !self.0.added.lock().contains(&source) {
            return Err(TransportError::NoSender(source));
        }
        self.0.replaced.lock().push(source);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\n".to_string(),
        })
    }

    async fn apply_answer(&self, _answer: SessionDescription) -> Result<(), TransportError> {
        if self.0.fail_apply_answer.load(Ordering::SeqCst) {
            return Err(TransportError::Sdp("answer rejected".to_string()));
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.0.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.0.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.0.closed.store(true, Ordering::SeqCst);
        *self.0.state.lock() = ConnectionState::Closed;
        Ok(())
    }
}

pub(crate) struct FakeTransportFactory {
    made: Mutex<Vec<Arc<FakeTransportState>>>,
    fail_next_apply: AtomicBool,
}

impl FakeTransportFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            made: Mutex::new(Vec::new()),
            fail_next_apply: AtomicBool::new(false),
        })
    }

    pub(crate) fn created_count(&self) -> usize {
        self.made.lock().len()
    }

    pub(crate) fn last(&self) -> Arc<FakeTransportState> {
        self.made.lock().last().cloned().expect("no transport created")
    }

    pub(crate) fn fail_next_apply_answer(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        let fail = self.fail_next_apply.swap(false, Ordering::SeqCst);
        let state = FakeTransportState::new(fail);
        self.made.lock().push(Arc::clone(&state));
        Ok(Box::new(FakeTransport(state)))
    }
}

// ---- session fixtures -------------------------------------------------

pub(crate) struct SessionFixture {
    pub session: StreamSession,
    pub backend: Arc<FakeBackend>,
    pub relay: Arc<FakeRelay>,
    pub transports: Arc<FakeTransportFactory>,
}

fn fixture(kind: SessionKind, destinations: Vec<Destination>) -> SessionFixture {
    let backend = FakeBackend::new();
    let relay = FakeRelay::new();
    let transports = FakeTransportFactory::new();
    let session = StreamSession::new(
        kind,
        ChannelId::from("chan-test"),
        destinations,
        CaptureManager::new(backend.clone()),
        relay.clone(),
        transports.clone(),
        &TeardownConfig::default(),
    );
    SessionFixture {
        session,
        backend,
        relay,
        transports,
    }
}

pub(crate) fn webcam_fixture(destinations: Vec<Destination>) -> SessionFixture {
    fixture(SessionKind::Webcam, destinations)
}

pub(crate) fn screen_fixture(destinations: Vec<Destination>) -> SessionFixture {
    fixture(SessionKind::Screen, destinations)
}

/// Block until the session settles in `state` (bounded at five seconds).
pub(crate) async fn wait_for_state(session: &StreamSession, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut rx = session.subscribe_state();
        loop {
            if *rx.borrow_and_update() == state {
                return;
            }
            rx.changed().await.expect("state sender dropped");
        }
    })
    .await
    .expect("timed out waiting for session state");
}
