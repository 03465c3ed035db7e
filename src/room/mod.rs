//! Interface to the external room/communication layer.
//!
//! The engine never owns session membership or media transport between
//! participants. It consumes a roster with per-participant audio handles,
//! publishes/unpublishes one locally-originated audio source, flips the
//! room-visible microphone flag, and exchanges best-effort broadcast
//! events. Delivery is best-effort and unordered across peers — the state
//! machine must never depend on a broadcast arriving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::audio::{AudioSource, MockAudioSource};
use crate::error::{EngineError, Result};
use crate::session::{OrbState, TurnMode};

/// One participant in the current call.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_local: bool,
}

/// Broadcast payload mirroring local `(mode, orb)` changes to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub mode: TurnMode,
    #[serde(rename = "orbState")]
    pub orb_state: OrbState,
    #[serde(rename = "userId")]
    pub user_id: String,
}

impl StateEvent {
    pub const KIND: &'static str = "translator:state_change";

    pub fn new(mode: TurnMode, orb_state: OrbState, user_id: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            mode,
            orb_state,
            user_id: user_id.into(),
        }
    }
}

/// Handle to an outgoing audio source published into the room.
///
/// At most one exists per session. Samples written to `writer` are heard
/// by remote peers; the handle must be passed back to
/// [`RoomLayer::unpublish`] on session stop.
pub struct PublishedTrack {
    pub id: String,
    pub sample_rate: u32,
    pub writer: mpsc::Sender<Vec<i16>>,
}

/// The external real-time communication layer.
#[async_trait]
pub trait RoomLayer: Send + Sync {
    /// The local participant's identity.
    fn local_participant(&self) -> Participant;

    /// Current roster, including the local participant.
    async fn participants(&self) -> Vec<Participant>;

    /// Audio source handle for one participant's inbound audio.
    async fn participant_audio(&self, participant_id: &str) -> Result<Box<dyn AudioSource>>;

    /// Publish a locally-originated audio source so remote peers hear it.
    async fn publish_audio(&self, sample_rate: u32) -> Result<PublishedTrack>;

    /// Withdraw a previously published source and release its resources.
    async fn unpublish(&self, track: PublishedTrack) -> Result<()>;

    /// Flip the room-visible microphone flag. Must be idempotent.
    async fn set_microphone_enabled(&self, enabled: bool);

    /// Send a broadcast event to every peer, best-effort.
    async fn send_event(&self, event: &StateEvent);

    /// Subscribe to broadcast events (including echoes of local sends,
    /// depending on the room implementation).
    fn subscribe(&self) -> broadcast::Receiver<StateEvent>;
}

/// Find the first non-local participant in the roster.
///
/// Reference behavior kept as-is for >2-party calls: whichever non-local
/// participant the roster lists first is captured for the B direction.
pub async fn first_remote_participant(room: &dyn RoomLayer) -> Option<Participant> {
    room.participants().await.into_iter().find(|p| !p.is_local)
}

/// In-memory room for testing.
///
/// Tracks every microphone flip, published track, and broadcast event so
/// tests can assert on ordering and resource release.
pub struct MockRoom {
    local: Participant,
    remotes: Mutex<Vec<Participant>>,
    events_tx: broadcast::Sender<StateEvent>,
    mic_enabled: AtomicBool,
    mic_history: Mutex<Vec<bool>>,
    sent_events: Mutex<Vec<StateEvent>>,
    published: AtomicUsize,
    unpublished: AtomicUsize,
    published_samples: Arc<Mutex<HashMap<String, Vec<i16>>>>,
    next_track: AtomicUsize,
}

impl MockRoom {
    pub fn new(local_id: &str) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            local: Participant {
                id: local_id.to_string(),
                display_name: local_id.to_string(),
                is_local: true,
            },
            remotes: Mutex::new(Vec::new()),
            events_tx,
            mic_enabled: AtomicBool::new(true),
            mic_history: Mutex::new(Vec::new()),
            sent_events: Mutex::new(Vec::new()),
            published: AtomicUsize::new(0),
            unpublished: AtomicUsize::new(0),
            published_samples: Arc::new(Mutex::new(HashMap::new())),
            next_track: AtomicUsize::new(0),
        }
    }

    pub fn with_remote(self, id: &str) -> Self {
        self.remotes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Participant {
                id: id.to_string(),
                display_name: id.to_string(),
                is_local: false,
            });
        self
    }

    /// Inject an event as if a peer had broadcast it.
    pub fn inject_event(&self, event: StateEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn microphone_enabled(&self) -> bool {
        self.mic_enabled.load(Ordering::SeqCst)
    }

    /// Every microphone flag write, in order.
    pub fn microphone_history(&self) -> Vec<bool> {
        self.mic_history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Every broadcast sent by the engine, in order.
    pub fn sent_events(&self) -> Vec<StateEvent> {
        self.sent_events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn unpublish_count(&self) -> usize {
        self.unpublished.load(Ordering::SeqCst)
    }

    /// Tracks currently published and not yet withdrawn.
    pub fn active_publish_count(&self) -> usize {
        self.publish_count() - self.unpublish_count()
    }

    /// Samples written to a published track so far.
    pub fn published_samples(&self, track_id: &str) -> Vec<i16> {
        self.published_samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(track_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published_track_ids(&self) -> Vec<String> {
        self.published_samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RoomLayer for MockRoom {
    fn local_participant(&self) -> Participant {
        self.local.clone()
    }

    async fn participants(&self) -> Vec<Participant> {
        let mut roster = vec![self.local.clone()];
        roster.extend(
            self.remotes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        roster
    }

    async fn participant_audio(&self, participant_id: &str) -> Result<Box<dyn AudioSource>> {
        let known = self
            .remotes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|p| p.id == participant_id);
        if known {
            Ok(Box::new(MockAudioSource::new().with_samples(vec![3i16; 160])))
        } else {
            Err(EngineError::RemoteAudioUnavailable {
                message: format!("participant '{}' has no audio", participant_id),
            })
        }
    }

    async fn publish_audio(&self, sample_rate: u32) -> Result<PublishedTrack> {
        let id = format!("track-{}", self.next_track.fetch_add(1, Ordering::SeqCst));
        self.published.fetch_add(1, Ordering::SeqCst);

        let (writer, mut rx) = mpsc::channel::<Vec<i16>>(64);
        let sink = Arc::clone(&self.published_samples);
        sink.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.clone(), Vec::new());
        let track_id = id.clone();
        tokio::spawn(async move {
            while let Some(samples) = rx.recv().await {
                if let Ok(mut map) = sink.lock() {
                    if let Some(buffer) = map.get_mut(&track_id) {
                        buffer.extend(samples);
                    }
                }
            }
        });

        Ok(PublishedTrack {
            id,
            sample_rate,
            writer,
        })
    }

    async fn unpublish(&self, _track: PublishedTrack) -> Result<()> {
        self.unpublished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_microphone_enabled(&self, enabled: bool) {
        self.mic_enabled.store(enabled, Ordering::SeqCst);
        self.mic_history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(enabled);
    }

    async fn send_event(&self, event: &StateEvent) {
        self.sent_events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
        // Mirror real rooms: the local send is also delivered to local
        // subscribers, so echo suppression is exercised.
        let _ = self.events_tx.send(event.clone());
    }

    fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_event_wire_shape() {
        let event = StateEvent::new(TurnMode::ASpeak, OrbState::Listening, "user-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "translator:state_change");
        assert_eq!(json["mode"], "A_SPEAK");
        assert_eq!(json["orbState"], "LISTENING");
        assert_eq!(json["userId"], "user-1");

        let back: StateEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_first_remote_participant_picks_first_non_local() {
        let room = MockRoom::new("me").with_remote("alice").with_remote("bob");
        let remote = first_remote_participant(&room).await.expect("remote");
        assert_eq!(remote.id, "alice");
    }

    #[tokio::test]
    async fn test_first_remote_participant_none_when_alone() {
        let room = MockRoom::new("me");
        assert!(first_remote_participant(&room).await.is_none());
    }

    #[tokio::test]
    async fn test_mock_room_publish_records_samples() {
        let room = MockRoom::new("me");
        let track = room.publish_audio(24000).await.unwrap();
        let id = track.id.clone();
        track.writer.send(vec![1, 2, 3]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(room.published_samples(&id), vec![1, 2, 3]);

        room.unpublish(track).await.unwrap();
        assert_eq!(room.active_publish_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_room_microphone_history() {
        let room = MockRoom::new("me");
        room.set_microphone_enabled(false).await;
        room.set_microphone_enabled(true).await;
        assert_eq!(room.microphone_history(), vec![false, true]);
        assert!(room.microphone_enabled());
    }
}
