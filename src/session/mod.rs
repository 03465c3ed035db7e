//! Turn state machine and cross-peer synchronization primitives.

pub mod captions;
pub mod engine;

pub use captions::{CaptionsEngine, CaptionsSnapshot};
pub use engine::{EngineSnapshot, TranslationEngine};

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::captions::{retain_recent, TranscriptSegment};
use crate::room::{RoomLayer, StateEvent};

/// Which translation turn is active locally.
///
/// From `Idle` either speak mode may start; from a speak mode the only
/// transition is back to `Idle`. Switching speakers is an implicit
/// stop-then-start, never a direct speak-to-speak transition — the
/// intermediate idle tick is what peers key their mic state on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnMode {
    Idle,
    ASpeak,
    BSpeak,
}

/// Pipeline activity indicator shown to every participant.
///
/// Broadcast to peers on change; a peer never infers it independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrbState {
    Idle,
    Listening,
    Translating,
}

/// Suppresses consecutive duplicate broadcasts to bound event-channel
/// load. Any value change still goes out, including the reset to idle
/// on teardown.
#[derive(Debug, Default)]
pub struct BroadcastGuard {
    last: Option<(TurnMode, OrbState)>,
}

impl BroadcastGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and approve a send unless it repeats the previous pair.
    pub fn should_send(&mut self, mode: TurnMode, orb: OrbState) -> bool {
        if self.last == Some((mode, orb)) {
            return false;
        }
        self.last = Some((mode, orb));
        true
    }
}

/// Non-blocking events streamed to the embedding UI.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged { mode: TurnMode, orb: OrbState },
    Connecting(bool),
    CurrentText(String),
    TranscriptFinal(TranscriptSegment),
}

#[derive(Debug)]
struct EngineState {
    turn_mode: TurnMode,
    orb_state: OrbState,
    is_connecting: bool,
    transcripts: Vec<TranscriptSegment>,
    current_text: String,
}

/// Shared observable state for one engine.
pub(crate) struct EngineShared {
    state: Mutex<EngineState>,
    guard: Mutex<BroadcastGuard>,
    event_tx: Option<crossbeam_channel::Sender<EngineEvent>>,
}

impl EngineShared {
    pub(crate) fn new(event_tx: Option<crossbeam_channel::Sender<EngineEvent>>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                turn_mode: TurnMode::Idle,
                orb_state: OrbState::Idle,
                is_connecting: false,
                transcripts: Vec::new(),
                current_text: String::new(),
            }),
            guard: Mutex::new(BroadcastGuard::new()),
            event_tx,
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    pub(crate) fn snapshot(&self) -> engine::EngineSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        engine::EngineSnapshot {
            turn_mode: state.turn_mode,
            orb_state: state.orb_state,
            is_connecting: state.is_connecting,
            transcripts: state.transcripts.clone(),
            current_text: state.current_text.clone(),
        }
    }

    pub(crate) fn set_connecting(&self, connecting: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.is_connecting = connecting;
        drop(state);
        self.emit(EngineEvent::Connecting(connecting));
    }

    pub(crate) fn set_mode(&self, mode: TurnMode) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.turn_mode = mode;
        let orb = state.orb_state;
        drop(state);
        self.emit(EngineEvent::StateChanged { mode, orb });
    }

    /// Set the orb state and return the `(mode, orb)` pair to broadcast.
    pub(crate) fn set_orb(&self, orb: OrbState) -> (TurnMode, OrbState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.orb_state = orb;
        let mode = state.turn_mode;
        drop(state);
        self.emit(EngineEvent::StateChanged { mode, orb });
        (mode, orb)
    }

    /// Mirror a peer-advertised orb value without re-broadcasting it.
    pub(crate) fn mirror_orb(&self, orb: OrbState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.orb_state = orb;
        let mode = state.turn_mode;
        drop(state);
        self.emit(EngineEvent::StateChanged { mode, orb });
    }

    /// Append a text delta to the running buffer; returns the new text.
    pub(crate) fn append_delta(&self, delta: &str) -> String {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.current_text.push_str(delta);
        let text = state.current_text.clone();
        drop(state);
        self.emit(EngineEvent::CurrentText(text.clone()));
        text
    }

    /// Take the running buffer, clearing it for the next turn.
    pub(crate) fn take_current_text(&self) -> String {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let text = std::mem::take(&mut state.current_text);
        drop(state);
        if !text.is_empty() {
            self.emit(EngineEvent::CurrentText(String::new()));
        }
        text
    }

    pub(crate) fn push_final(&self, segment: TranscriptSegment, retain: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        retain_recent(&mut state.transcripts, segment.clone(), retain);
        drop(state);
        self.emit(EngineEvent::TranscriptFinal(segment));
    }

    /// Reset to idle: both enumerated states, the connecting flag, and the
    /// running buffer. Retained transcripts survive a stop.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.turn_mode = TurnMode::Idle;
        state.orb_state = OrbState::Idle;
        state.is_connecting = false;
        state.current_text.clear();
        drop(state);
        self.emit(EngineEvent::StateChanged {
            mode: TurnMode::Idle,
            orb: OrbState::Idle,
        });
    }

    fn should_broadcast(&self, mode: TurnMode, orb: OrbState) -> bool {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_send(mode, orb)
    }
}

/// Broadcast a local `(mode, orb)` pair to peers, tagged with the local
/// identity, unless it duplicates the previous broadcast.
pub(crate) async fn broadcast_state(
    room: &Arc<dyn RoomLayer>,
    shared: &EngineShared,
    mode: TurnMode,
    orb: OrbState,
) {
    if !shared.should_broadcast(mode, orb) {
        return;
    }
    let user_id = room.local_participant().id;
    debug!(?mode, ?orb, "broadcasting translator state");
    room.send_event(&StateEvent::new(mode, orb, user_id)).await;
}
