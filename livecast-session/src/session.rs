//! Session state machine
//!
//! This module owns the lifecycle of one outgoing broadcast:
//! capture → negotiate → live → teardown. All mutations of one session
//! are serialized through a single async mutex, so user commands and
//! asynchronous transport/capture events never race; an event arriving
//! mid-transition waits and is then merged against the settled state.
//!
//! The controller is parametrized by [`SessionKind`]: webcam and screen
//! sessions run the identical state machine and differ only in capture
//! policy.

use crate::capture::{CaptureManager, CaptureOptions, MediaBundle, TrackConstraints};
use crate::signaling::RelaySignaling;
use crate::timeout::with_timeout;
use crate::transport::{ConnectionState, Transport, TransportEvent, TransportFactory};
use livecast_core::{
    ChannelId, Destination, Result, SessionError, SessionId, SessionKind, SessionState,
    TeardownConfig, TrackSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the session event broadcast channel.
const EVENT_BUFFER: usize = 32;

/// Observable session events for UI surfaces.
///
/// The transient `Error` in an `Error → Idle` transition is visible here
/// even though the state watch settles on `Idle`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Errored(SessionError),
}

/// UI-relevant view of a session at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: SessionKind,
    pub state: SessionState,
    pub muted: bool,
    pub video_off: bool,
    pub destinations: Vec<Destination>,
    pub last_error: Option<SessionError>,
    pub connection_state: Option<ConnectionState>,
    pub track_sources: Vec<TrackSource>,
}

struct Core {
    state: SessionState,
    bundle: Option<MediaBundle>,
    transport: Option<Box<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
    muted: bool,
    video_off: bool,
    destinations: Vec<Destination>,
    last_error: Option<SessionError>,
    /// Whether the current attempt issued a successful relay `start`;
    /// makes the teardown `stop` at-most-once per attempt.
    relay_started: bool,
    /// Bumped whenever an attempt is created or torn down so a stale
    /// event pump can never act on a newer attempt's state.
    attempt: u64,
}

struct Inner {
    id: SessionId,
    kind: SessionKind,
    channel: ChannelId,
    stop_timeout: Duration,
    capture: CaptureManager,
    signaling: Arc<dyn RelaySignaling>,
    transports: Arc<dyn TransportFactory>,
    core: Mutex<Core>,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// Handle to one broadcast session.
///
/// Cheap to clone; all clones drive the same underlying session. Exactly
/// one holder (a UI surface or the minimized-session registry) should
/// issue commands at any instant; ownership transfer goes through the
/// registry's take/remove protocol.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<Inner>,
}

impl StreamSession {
    pub fn new(
        kind: SessionKind,
        channel: ChannelId,
        destinations: Vec<Destination>,
        capture: CaptureManager,
        signaling: Arc<dyn RelaySignaling>,
        transports: Arc<dyn TransportFactory>,
        teardown: &TeardownConfig,
    ) -> Self {
        let id = SessionId::derive(kind, &channel);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        info!(session_id = %id, kind = %kind, "session created");

        Self {
            inner: Arc::new(Inner {
                id,
                kind,
                channel,
                stop_timeout: teardown.stop_timeout(),
                capture,
                signaling,
                transports,
                core: Mutex::new(Core {
                    state: SessionState::Idle,
                    bundle: None,
                    transport: None,
                    pump: None,
                    muted: false,
                    video_off: false,
                    destinations,
                    last_error: None,
                    relay_started: false,
                    attempt: 0,
                }),
                state_tx,
                events_tx,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        &self.inner.channel
    }

    /// Current state without locking.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    /// Watch the session state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to state-change and error events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub async fn last_error(&self) -> Option<SessionError> {
        self.inner.core.lock().await.last_error.clone()
    }

    pub async fn destinations(&self) -> Vec<Destination> {
        self.inner.core.lock().await.destinations.clone()
    }

    /// Replace the destination snapshot. The controller never mutates
    /// destination records itself; the owning surface refreshes them.
    pub async fn set_destinations(&self, destinations: Vec<Destination>) {
        self.inner.core.lock().await.destinations = destinations;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let core = self.inner.core.lock().await;
        SessionSnapshot {
            id: self.inner.id.clone(),
            kind: self.inner.kind,
            state: core.state,
            muted: core.muted,
            video_off: core.video_off,
            destinations: core.destinations.clone(),
            last_error: core.last_error.clone(),
            connection_state: core.transport.as_ref().map(|t| t.connection_state()),
            track_sources: core
                .bundle
                .as_ref()
                .map(|b| b.tracks().iter().map(super::capture::CapturedTrack::source).collect())
                .unwrap_or_default(),
        }
    }

    /// Acquire local media for this session's kind.
    ///
    /// `Idle → PermissionRequested → PermissionGranted`, or back to
    /// `Idle` with the failure recorded. A bundle retained from a failed
    /// go-live attempt is reused without prompting again.
    pub async fn request_permissions(&self, options: &CaptureOptions) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        if core.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                op: "request_permissions",
                state: core.state,
            });
        }
        if core.bundle.is_some() {
            core.last_error = None;
            self.set_state(&mut core, SessionState::PermissionGranted);
            return Ok(());
        }
        self.set_state(&mut core, SessionState::PermissionRequested);

        match self.inner.capture.acquire(self.inner.kind, options).await {
            Ok(bundle) => {
                bundle.set_audio_enabled(!core.muted);
                bundle.set_video_enabled(!core.video_off);
                core.bundle = Some(bundle);
                core.last_error = None;
                self.set_state(&mut core, SessionState::PermissionGranted);
                Ok(())
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.note_error(&mut core, err.clone());
                self.set_state(&mut core, SessionState::Idle);
                Err(err)
            }
        }
    }

    /// Start broadcasting: relay `start`, transport build, one-round
    /// negotiation. Returns with the session in `Connecting`; the
    /// transport's `Connected` event drives it to `Live`.
    pub async fn go_live(&self) -> Result<()> {
        let inner = &self.inner;
        let mut core = inner.core.lock().await;
        if core.state != SessionState::PermissionGranted {
            return Err(SessionError::InvalidState {
                op: "go_live",
                state: core.state,
            });
        }
        // Cannot broadcast to nothing: rejected before any relay traffic.
        if core.destinations.is_empty() {
            return Err(SessionError::NoDestinations);
        }

        self.set_state(&mut core, SessionState::Connecting);

        // Defensively end any previous session for this channel.
        if let Err(e) = with_timeout(
            "defensive relay stop",
            inner.stop_timeout,
            inner.signaling.stop(&inner.channel),
            Ok(()),
        )
        .await
        {
            debug!(error = %e, "defensive stop failed, continuing");
        }

        if let Err(e) = inner.signaling.start(&inner.channel).await {
            let err = SessionError::from(e);
            self.abort_attempt(&mut core, None, err.clone()).await;
            return Err(err);
        }
        core.relay_started = true;

        let transport = match inner.transports.create().await {
            Ok(t) => t,
            Err(e) => {
                let err = SessionError::Transport(e.to_string());
                self.abort_attempt(&mut core, None, err.clone()).await;
                return Err(err);
            }
        };

        let tracks: Option<Vec<_>> = core.bundle.as_ref().map(|bundle| {
            bundle
                .tracks()
                .iter()
                .map(|t| (t.source(), t.rtc_track()))
                .collect()
        });
        let Some(tracks) = tracks else {
            let err = SessionError::InvalidState {
                op: "go_live",
                state: core.state,
            };
            self.abort_attempt(&mut core, Some(transport), err.clone())
                .await;
            return Err(err);
        };
        let ended = core
            .bundle
            .as_ref()
            .and_then(MediaBundle::video)
            .map(super::capture::CapturedTrack::ended_watch);

        for (source, track) in tracks {
            if let Err(e) = transport.add_track(source, track).await {
                let err = SessionError::Transport(e.to_string());
                self.abort_attempt(&mut core, Some(transport), err.clone())
                    .await;
                return Err(err);
            }
        }

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                let err = SessionError::Transport(e.to_string());
                self.abort_attempt(&mut core, Some(transport), err.clone())
                    .await;
                return Err(err);
            }
        };

        let answer = match inner.signaling.negotiate(&inner.channel, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                let err = SessionError::from(e);
                self.abort_attempt(&mut core, Some(transport), err.clone())
                    .await;
                return Err(err);
            }
        };

        if let Err(e) = transport.apply_answer(answer).await {
            let err = SessionError::NegotiationRejected(e.to_string());
            self.abort_attempt(&mut core, Some(transport), err.clone())
                .await;
            return Err(err);
        }

        let Some(events) = transport.take_events() else {
            let err = SessionError::Transport("transport events already taken".to_string());
            self.abort_attempt(&mut core, Some(transport), err.clone())
                .await;
            return Err(err);
        };

        core.attempt = core.attempt.wrapping_add(1);
        let attempt = core.attempt;
        core.transport = Some(transport);
        core.pump = Some(tokio::spawn(Self::pump(
            self.clone(),
            events,
            ended,
            attempt,
        )));
        core.last_error = None;
        info!(
            session_id = %inner.id,
            destination_count = core.destinations.len(),
            "negotiation complete, waiting for transport"
        );
        Ok(())
    }

    /// Graceful stop. A no-op in `Idle` and after `Closed`; never fails.
    pub async fn stop(&self) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        match core.state {
            SessionState::Idle | SessionState::Closed => Ok(()),
            _ => {
                info!(session_id = %self.inner.id, state = %core.state, "stopping session");
                self.teardown(&mut core, true, true).await;
                core.last_error = None;
                self.set_state(&mut core, SessionState::Idle);
                Ok(())
            }
        }
    }

    /// Hard teardown: every relay call is raced against the teardown
    /// timeout and local resources are released regardless of the
    /// outcome. Always reaches `Closed`.
    pub async fn force_disconnect(&self) {
        let mut core = self.inner.core.lock().await;
        if core.state == SessionState::Closed {
            return;
        }
        info!(session_id = %self.inner.id, state = %core.state, "force disconnecting session");
        self.teardown(&mut core, true, true).await;
        self.set_state(&mut core, SessionState::Closed);
    }

    /// Swap the capture device behind one track source.
    ///
    /// Permitted in any state except `Idle`/`Closed`. When live, the
    /// replacement is pushed into the transport before the old track is
    /// stopped, so there is never a window with no active track. On
    /// failure the prior track and state are left untouched; only
    /// `last_error` is set.
    pub async fn switch_device(
        &self,
        source: TrackSource,
        constraints: TrackConstraints,
    ) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        if matches!(core.state, SessionState::Idle | SessionState::Closed) {
            return Err(SessionError::InvalidState {
                op: "switch_device",
                state: core.state,
            });
        }
        if core.bundle.is_none() {
            return Err(SessionError::InvalidState {
                op: "switch_device",
                state: core.state,
            });
        }

        let replacement = match self.inner.capture.open_replacement(source, constraints).await {
            Ok(track) => track,
            Err(e) => {
                let err = SessionError::from(e);
                self.note_error(&mut core, err.clone());
                return Err(err);
            }
        };
        replacement.set_enabled(match source.media_kind() {
            livecast_core::MediaKind::Audio => !core.muted,
            livecast_core::MediaKind::Video => !core.video_off,
        });

        if let Some(transport) = core.transport.as_ref() {
            if let Err(e) = transport.replace_track(source, replacement.rtc_track()).await {
                replacement.stop();
                let err = SessionError::Transport(e.to_string());
                self.note_error(&mut core, err.clone());
                return Err(err);
            }
        }

        if let Some(bundle) = core.bundle.as_mut() {
            if let Some(old) = bundle.swap(replacement) {
                old.stop();
            }
        }
        debug!(session_id = %self.inner.id, source = %source, "switched capture device");
        Ok(())
    }

    /// Flip the audio enable flag. Never touches transport or capture
    /// lifecycle.
    pub async fn set_muted(&self, muted: bool) {
        let mut core = self.inner.core.lock().await;
        core.muted = muted;
        if let Some(bundle) = core.bundle.as_ref() {
            bundle.set_audio_enabled(!muted);
        }
    }

    /// Flip the video enable flag. Never touches transport or capture
    /// lifecycle.
    pub async fn set_video_off(&self, video_off: bool) {
        let mut core = self.inner.core.lock().await;
        core.video_off = video_off;
        if let Some(bundle) = core.bundle.as_ref() {
            bundle.set_video_enabled(!video_off);
        }
    }

    // ---- internals -----------------------------------------------------

    fn set_state(&self, core: &mut Core, next: SessionState) {
        if core.state == next {
            return;
        }
        debug!(
            session_id = %self.inner.id,
            from = %core.state,
            to = %next,
            "session state change"
        );
        if next == SessionState::Live {
            debug_assert!(core
                .transport
                .as_ref()
                .is_some_and(|t| t.connection_state() == ConnectionState::Connected));
        }
        core.state = next;
        self.inner.state_tx.send_replace(next);
        let _ = self.inner.events_tx.send(SessionEvent::StateChanged(next));
    }

    fn note_error(&self, core: &mut Core, err: SessionError) {
        warn!(session_id = %self.inner.id, error = %err, "session error");
        core.last_error = Some(err.clone());
        let _ = self.inner.events_tx.send(SessionEvent::Errored(err));
    }

    /// Abort a go-live attempt whose transport was never installed.
    /// Local tracks are kept for an immediate retry.
    async fn abort_attempt(
        &self,
        core: &mut Core,
        transport: Option<Box<dyn Transport>>,
        err: SessionError,
    ) {
        if let Some(transport) = transport {
            let _ = with_timeout(
                "transport close",
                self.inner.stop_timeout,
                transport.close(),
                Ok(()),
            )
            .await;
        }
        if core.relay_started {
            if let Err(e) = with_timeout(
                "relay stop",
                self.inner.stop_timeout,
                self.inner.signaling.stop(&self.inner.channel),
                Ok(()),
            )
            .await
            {
                debug!(error = %e, "relay stop failed after aborted go-live");
            }
            core.relay_started = false;
        }
        self.note_error(core, err);
        self.set_state(core, SessionState::Error);
        self.set_state(core, SessionState::Idle);
    }

    /// Tear down the current attempt: event pump, transport, relay
    /// session, and optionally the local tracks. Every network call is
    /// bounded by the teardown timeout.
    async fn teardown(&self, core: &mut Core, release_tracks: bool, abort_pump: bool) {
        if abort_pump {
            if let Some(pump) = core.pump.take() {
                pump.abort();
            }
        } else {
            // The pump is the caller and exits on its own.
            core.pump = None;
        }

        if let Some(transport) = core.transport.take() {
            let _ = with_timeout(
                "transport close",
                self.inner.stop_timeout,
                transport.close(),
                Ok(()),
            )
            .await;
        }

        if core.relay_started {
            if let Err(e) = with_timeout(
                "relay stop",
                self.inner.stop_timeout,
                self.inner.signaling.stop(&self.inner.channel),
                Ok(()),
            )
            .await
            {
                debug!(error = %e, "relay stop failed during teardown");
            }
            core.relay_started = false;
        }

        if release_tracks {
            if let Some(bundle) = core.bundle.take() {
                self.inner.capture.release(&bundle);
            }
            core.muted = false;
            core.video_off = false;
        }

        // Invalidate any pump that lost the abort race.
        core.attempt = core.attempt.wrapping_add(1);
    }

    /// Event pump for one attempt: merges transport events and the
    /// display capture's end-of-stream signal into the state machine.
    async fn pump(
        session: Self,
        mut events: mpsc::Receiver<TransportEvent>,
        ended: Option<watch::Receiver<bool>>,
        attempt: u64,
    ) {
        let ended_fut = Self::ended_signal(ended);
        tokio::pin!(ended_fut);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(TransportEvent::Candidate(candidate)) => {
                            // Best-effort: candidate failures are swallowed.
                            if let Err(e) = session
                                .inner
                                .signaling
                                .send_candidate(&session.inner.channel, candidate)
                                .await
                            {
                                debug!(error = %e, "dropped connectivity candidate");
                            }
                        }
                        Some(TransportEvent::StateChanged(state)) => {
                            if session.handle_connection_state(state, attempt).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                () = &mut ended_fut => {
                    session.handle_capture_ended(attempt).await;
                    break;
                }
            }
        }
        debug!(session_id = %session.inner.id, attempt, "session event pump stopped");
    }

    /// Resolves when the watched track ends; pends forever otherwise.
    async fn ended_signal(rx: Option<watch::Receiver<bool>>) {
        let Some(mut rx) = rx else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Returns `true` when the attempt was torn down and the pump must
    /// exit.
    async fn handle_connection_state(&self, state: ConnectionState, attempt: u64) -> bool {
        let mut core = self.inner.core.lock().await;
        if core.attempt != attempt {
            return true;
        }
        match state {
            ConnectionState::Connected => {
                if core.state == SessionState::Connecting {
                    core.last_error = None;
                    self.set_state(&mut core, SessionState::Live);
                    info!(session_id = %self.inner.id, "session is live");
                }
                false
            }
            s if s.is_lost() => {
                if matches!(core.state, SessionState::Live | SessionState::Connecting) {
                    // Losses before `Live` keep the tracks: the user can
                    // retry without re-requesting permissions.
                    let release = core.state == SessionState::Live;
                    self.note_error(
                        &mut core,
                        SessionError::ConnectionLost(format!("transport {s}")),
                    );
                    self.set_state(&mut core, SessionState::Error);
                    self.teardown(&mut core, release, false).await;
                    self.set_state(&mut core, SessionState::Idle);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// The display capture's native "stop sharing" control is treated
    /// exactly like an explicit stop.
    async fn handle_capture_ended(&self, attempt: u64) {
        let mut core = self.inner.core.lock().await;
        if core.attempt != attempt {
            return;
        }
        info!(session_id = %self.inner.id, "capture ended natively, stopping session");
        self.teardown(&mut core, true, false).await;
        core.last_error = None;
        self.set_state(&mut core, SessionState::Idle);
    }
}
