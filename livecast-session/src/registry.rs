//! Minimized session registry
//!
//! Process-wide table of sessions detached from their originating UI
//! surface. A surface that is about to be torn down parks its session
//! here; any other surface can later reattach it (or force-terminate it)
//! without the broadcast ever being interrupted.
//!
//! Ownership protocol: `get` only observes; exclusive ownership moves
//! with the entry, via the atomic `take` (or `remove` after copying out
//! of `get`). Two surfaces racing to reattach the same id resolve to
//! exactly one winner.

use crate::session::StreamSession;
use dashmap::DashMap;
use livecast_core::{Destination, SessionId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the registry event channel.
const EVENT_BUFFER: usize = 32;

/// Callback run when a minimized session is force-terminated from
/// outside its owning surface.
pub type TeardownFn = Arc<dyn Fn() + Send + Sync>;

/// A parked session plus its last observed UI-relevant flags.
#[derive(Clone)]
pub struct MinimizedEntry {
    pub session: StreamSession,
    pub muted: bool,
    pub video_off: bool,
    pub destinations: Vec<Destination>,
    pub on_teardown: Option<TeardownFn>,
}

impl MinimizedEntry {
    pub fn new(session: StreamSession, muted: bool, video_off: bool, destinations: Vec<Destination>) -> Self {
        Self {
            session,
            muted,
            video_off,
            destinations,
            on_teardown: None,
        }
    }

    #[must_use]
    pub fn with_teardown(mut self, on_teardown: TeardownFn) -> Self {
        self.on_teardown = Some(on_teardown);
        self
    }
}

/// Registry change notifications, so a minimized-sessions list can update
/// when an entry is removed from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Inserted(SessionId),
    Removed(SessionId),
}

/// Process-wide minimized-session table.
pub struct MinimizedSessions {
    entries: DashMap<SessionId, MinimizedEntry>,
    events_tx: broadcast::Sender<RegistryEvent>,
}

impl Default for MinimizedSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl MinimizedSessions {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: DashMap::new(),
            events_tx,
        }
    }

    /// Park a session. Upsert: an existing entry with the same id has its
    /// flags and callback merged, never duplicated; the session handle of
    /// the first insert is kept (both handles drive the same session).
    pub fn put(&self, entry: MinimizedEntry) {
        let id = entry.session.id().clone();
        match self.entries.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.muted = entry.muted;
                existing.video_off = entry.video_off;
                existing.destinations = entry.destinations;
                if entry.on_teardown.is_some() {
                    existing.on_teardown = entry.on_teardown;
                }
                debug!(session_id = %id, "merged minimized session entry");
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                info!(session_id = %id, "session minimized");
            }
        }
        let _ = self.events_tx.send(RegistryEvent::Inserted(id));
    }

    /// Atomically remove and return the entry. Exactly one of any number
    /// of concurrent callers receives it.
    pub fn take(&self, id: &SessionId) -> Option<MinimizedEntry> {
        let taken = self.entries.remove(id).map(|(_, entry)| entry);
        if taken.is_some() {
            info!(session_id = %id, "session taken from registry");
            let _ = self.events_tx.send(RegistryEvent::Removed(id.clone()));
        }
        taken
    }

    /// Release the registry's claim on an entry, completing a
    /// reattachment started with [`get`](Self::get).
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            info!(session_id = %id, "session removed from registry");
            let _ = self.events_tx.send(RegistryEvent::Removed(id.clone()));
        }
        removed
    }

    /// Observe an entry without transferring ownership.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<MinimizedEntry> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all parked sessions.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Subscribe to insert/remove notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    /// Force-terminate a parked session from outside its owning surface:
    /// take the entry, hard-disconnect the session (bounded teardown),
    /// and run its teardown callback.
    pub async fn force_disconnect(&self, id: &SessionId) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };
        entry.session.force_disconnect().await;
        if let Some(on_teardown) = entry.on_teardown {
            on_teardown();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureOptions;
    use crate::test_support::webcam_fixture;
    use livecast_core::{DestinationKind, SessionState};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn destination() -> Vec<Destination> {
        vec![Destination::new("twitch", DestinationKind::Oauth)]
    }

    #[tokio::test]
    async fn test_put_get_take_remove() {
        let registry = MinimizedSessions::new();
        let fixture = webcam_fixture(destination());
        let id = fixture.session.id().clone();

        registry.put(MinimizedEntry::new(
            fixture.session.clone(),
            false,
            false,
            destination(),
        ));
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec![id.clone()]);

        // get observes without removing
        assert!(registry.get(&id).is_some());
        assert!(registry.contains(&id));

        let entry = registry.take(&id).expect("entry present");
        assert_eq!(entry.session.id(), &id);
        assert!(registry.is_empty());
        assert!(registry.take(&id).is_none());
        assert!(!registry.remove(&id));
    }

    #[tokio::test]
    async fn test_put_merges_instead_of_duplicating() {
        let registry = MinimizedSessions::new();
        let fixture = webcam_fixture(destination());

        registry.put(MinimizedEntry::new(
            fixture.session.clone(),
            false,
            false,
            destination(),
        ));
        registry.put(MinimizedEntry::new(
            fixture.session.clone(),
            true,
            true,
            Vec::new(),
        ));

        assert_eq!(registry.len(), 1);
        let entry = registry.get(fixture.session.id()).expect("entry present");
        assert!(entry.muted);
        assert!(entry.video_off);
        assert!(entry.destinations.is_empty());
    }

    #[tokio::test]
    async fn test_take_is_exactly_once_under_races() {
        let registry = Arc::new(MinimizedSessions::new());
        let fixture = webcam_fixture(destination());
        let id = fixture.session.id().clone();
        registry.put(MinimizedEntry::new(
            fixture.session.clone(),
            false,
            false,
            destination(),
        ));

        let first = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.take(&id).is_some() })
        };
        let second = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { registry.take(&id).is_some() })
        };

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        // Exactly one racer wins.
        assert!(first ^ second);
    }

    #[tokio::test]
    async fn test_removal_is_observable() {
        let registry = MinimizedSessions::new();
        let fixture = webcam_fixture(destination());
        let id = fixture.session.id().clone();
        let mut events = registry.subscribe();

        registry.put(MinimizedEntry::new(
            fixture.session.clone(),
            false,
            false,
            destination(),
        ));
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Inserted(id.clone()));

        registry.remove(&id);
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::Removed(id));
    }

    #[tokio::test]
    async fn test_minimize_maximize_round_trip_preserves_observable_state() {
        let registry = MinimizedSessions::new();
        let fixture = webcam_fixture(destination());
        fixture
            .session
            .request_permissions(&CaptureOptions::default())
            .await
            .unwrap();
        fixture.session.set_muted(true).await;

        let before = fixture.session.snapshot().await;

        // Minimize: park the session and drop the surface's handle.
        registry.put(MinimizedEntry::new(
            fixture.session.clone(),
            before.muted,
            before.video_off,
            before.destinations.clone(),
        ));

        // Maximize elsewhere: observe, copy, then release the claim.
        let id = before.id.clone();
        let entry = registry.get(&id).expect("minimized entry");
        let reattached = entry.session.clone();
        assert!(registry.remove(&id));

        let after = reattached.snapshot().await;
        assert_eq!(before, after);
        assert_eq!(after.state, SessionState::PermissionGranted);
        assert!(after.muted);
    }

    #[tokio::test]
    async fn test_force_disconnect_runs_teardown_callback() {
        let registry = MinimizedSessions::new();
        let fixture = webcam_fixture(destination());
        fixture
            .session
            .request_permissions(&CaptureOptions::default())
            .await
            .unwrap();
        let id = fixture.session.id().clone();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        registry.put(
            MinimizedEntry::new(fixture.session.clone(), false, false, destination())
                .with_teardown(Arc::new(move || flag.store(true, Ordering::SeqCst))),
        );

        assert!(registry.force_disconnect(&id).await);
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(fixture.session.state(), SessionState::Closed);
        assert!(registry.is_empty());

        // Unknown id is a no-op.
        assert!(!registry.force_disconnect(&id).await);
    }
}
