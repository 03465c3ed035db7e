//! Turn-based translation engine.
//!
//! Owns at most one [`TurnSession`] at a time. Starting a new session
//! fully stops the previous one first (capture released, transport
//! closed, any published track withdrawn, microphone re-enabled) before
//! the new acquisition begins. All teardown paths (stop, skip, transport
//! error) converge on the same release routine.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioMix, CapturePump, DeviceSources, PumpControl};
use crate::captions::{CaptionRenderer, RevealTiming, TranscriptSegment};
use crate::config::{Config, TranslationConfig};
use crate::error::{EngineError, Result};
use crate::playback::{decode_audio_payload, PlaybackSink, PublishBack};
use crate::room::{self, RoomLayer};
use crate::session::{broadcast_state, EngineEvent, EngineShared, OrbState, TurnMode};
use crate::store::{persist_best_effort, TranscriptRecord, TranscriptStore};
use crate::transport::{SessionSetup, SpeechBackend, TransportEvent};

/// Name under which the local microphone joins the capture mix.
const MICROPHONE_SOURCE: &str = "microphone";

/// Text stored as the original-content marker of a translated turn; the
/// source side of a turn is spoken audio, not text.
const ORIGINAL_AUDIO_MARKER: &str = "Audio Speech";

/// Read-only observable state exposed to the UI layer.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub turn_mode: TurnMode,
    pub orb_state: OrbState,
    pub is_connecting: bool,
    pub transcripts: Vec<TranscriptSegment>,
    pub current_text: String,
}

/// Signals delivered to a session's consumer loop alongside transport
/// events.
enum SessionSignal {
    PlaybackFinished,
}

/// Resources owned by one active turn.
struct TurnSession {
    pump: Option<CapturePump>,
    closer: Option<oneshot::Sender<()>>,
    cancel: Arc<watch::Sender<bool>>,
    publish: PublishBack,
    consumer: JoinHandle<()>,
}

impl TurnSession {
    /// Release every acquired resource exactly once.
    ///
    /// Resolves only when capture devices are free, so a follow-up session
    /// never races this one for a microphone handle.
    async fn teardown(mut self) {
        self.cancel.send_replace(true);
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.shutdown().await {
                warn!(error = %e, "capture release failed during teardown");
            }
        }
        // Stop the consumer before withdrawing the outgoing track so a
        // queued audio event cannot publish a fresh one mid-teardown.
        self.consumer.abort();
        if let Err(e) = self.publish.close().await {
            warn!(error = %e, "unpublish failed during teardown");
        }
    }
}

/// The turn-based live translation engine.
pub struct TranslationEngine {
    config: Config,
    session_id: String,
    room: Arc<dyn RoomLayer>,
    devices: Arc<dyn DeviceSources>,
    backend: Arc<dyn SpeechBackend>,
    sink: Arc<dyn PlaybackSink>,
    store: Arc<dyn TranscriptStore>,
    shared: Arc<EngineShared>,
    renderer: Arc<StdMutex<CaptionRenderer>>,
    session: Mutex<Option<TurnSession>>,
    peer_task: StdMutex<Option<JoinHandle<()>>>,
    event_tx: Option<crossbeam_channel::Sender<EngineEvent>>,
}

impl TranslationEngine {
    pub fn new(
        config: Config,
        session_id: impl Into<String>,
        room: Arc<dyn RoomLayer>,
        devices: Arc<dyn DeviceSources>,
        backend: Arc<dyn SpeechBackend>,
        sink: Arc<dyn PlaybackSink>,
        store: Arc<dyn TranscriptStore>,
    ) -> Self {
        let window_size = config.captions.window_size;
        Self {
            config,
            session_id: session_id.into(),
            room,
            devices,
            backend,
            sink,
            store,
            shared: Arc::new(EngineShared::new(None)),
            renderer: Arc::new(StdMutex::new(CaptionRenderer::new(
                window_size,
                RevealTiming::default(),
            ))),
            session: Mutex::new(None),
            peer_task: StdMutex::new(None),
            event_tx: None,
        }
    }

    /// Stream engine events to the UI over a non-blocking channel.
    pub fn with_event_sender(mut self, tx: crossbeam_channel::Sender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Finish construction: wire shared state and start listening to peer
    /// broadcasts.
    pub fn launch(mut self) -> Arc<Self> {
        self.shared = Arc::new(EngineShared::new(self.event_tx.clone()));
        let engine = Arc::new(self);

        let task = tokio::spawn(peer_sync_loop(
            engine.room.clone(),
            engine.shared.clone(),
        ));
        *engine
            .peer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        engine
    }

    /// Current observable state.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.shared.snapshot()
    }

    /// Renderer driving the caption overlay for translated text.
    pub fn renderer(&self) -> Arc<StdMutex<CaptionRenderer>> {
        Arc::clone(&self.renderer)
    }

    /// Toggle the A→B direction: stop if active, otherwise start.
    ///
    /// A no-op while a start is in flight.
    pub async fn toggle_a(self: &Arc<Self>) -> Result<()> {
        let snapshot = self.shared.snapshot();
        if snapshot.is_connecting {
            return Ok(());
        }
        if snapshot.turn_mode == TurnMode::ASpeak {
            self.stop().await
        } else {
            self.start(TurnMode::ASpeak).await
        }
    }

    /// Toggle the B→A direction: stop if active, otherwise start.
    ///
    /// A no-op while a start is in flight.
    pub async fn toggle_b(self: &Arc<Self>) -> Result<()> {
        let snapshot = self.shared.snapshot();
        if snapshot.is_connecting {
            return Ok(());
        }
        if snapshot.turn_mode == TurnMode::BSpeak {
            self.stop().await
        } else {
            self.start(TurnMode::BSpeak).await
        }
    }

    /// Stop whatever is active. Idempotent and always safe to call.
    pub async fn stop(&self) -> Result<()> {
        let session = { self.session.lock().await.take() };
        if let Some(session) = session {
            info!("stopping translation session");
            session.teardown().await;
        }

        self.shared.reset();
        broadcast_state(&self.room, &self.shared, TurnMode::Idle, OrbState::Idle).await;
        // Idempotent enable: peers may also have unmuted us already.
        self.room.set_microphone_enabled(true).await;
        Ok(())
    }

    /// Interrupt an overlong translation: cancel playback, return the orb
    /// to listening, resume capture. Only meaningful while translating.
    pub async fn skip_turn(&self) {
        if self.shared.snapshot().orb_state != OrbState::Translating {
            return;
        }
        debug!("skipping current translation turn");
        let guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            session.cancel.send_replace(true);
        }
    }

    async fn start(self: &Arc<Self>, target: TurnMode) -> Result<()> {
        // Concurrent toggles while a start is in flight are no-ops.
        if self.shared.snapshot().is_connecting {
            return Ok(());
        }

        // Stop-then-start, awaited to completion before any acquisition.
        self.stop().await?;
        self.shared.set_connecting(true);
        self.shared.set_mode(target);

        match self.start_session(target).await {
            Ok(session) => {
                *self.session.lock().await = Some(session);
                self.shared.set_connecting(false);
                info!(mode = ?target, "translation session started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to start translation session");
                self.stop().await?;
                Err(e)
            }
        }
    }

    async fn start_session(self: &Arc<Self>, mode: TurnMode) -> Result<TurnSession> {
        // Directional capture: A speaks into the local microphone; B is the
        // first non-local participant's inbound audio.
        let mut mix = AudioMix::new();
        match mode {
            TurnMode::ASpeak => {
                let microphone = self.devices.microphone().await?;
                mix.connect(MICROPHONE_SOURCE, microphone)?;
            }
            TurnMode::BSpeak => {
                let remote = room::first_remote_participant(self.room.as_ref())
                    .await
                    .ok_or_else(|| EngineError::RemoteAudioUnavailable {
                        message: "no non-local participant in the call".to_string(),
                    })?;
                let audio = self.room.participant_audio(&remote.id).await?;
                mix.connect(&format!("remote:{}", remote.id), audio)?;
            }
            TurnMode::Idle => {
                return Err(EngineError::Other(
                    "cannot start a session in idle mode".to_string(),
                ));
            }
        }

        let (mode_now, orb_now) = self.shared.set_orb(OrbState::Listening);
        broadcast_state(&self.room, &self.shared, mode_now, orb_now).await;

        let setup = SessionSetup::translate(&self.config.backend, &self.config.translation);
        let mut connection = match self.backend.connect(setup).await {
            Ok(connection) => connection,
            Err(e) => {
                let _ = mix.release();
                return Err(e);
            }
        };
        let closer = connection.take_closer();

        let interval = Duration::from_millis(self.config.translation.chunk_interval_ms);
        let pump = CapturePump::spawn(mix, interval, connection.chunks.clone());

        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (cancel_tx, _) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);
        let publish = PublishBack::new(self.room.clone());

        let ctx = TurnContext {
            mode,
            engine: Arc::downgrade(self),
            shared: self.shared.clone(),
            renderer: self.renderer.clone(),
            room: self.room.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            pump: pump.control(),
            cancel: cancel.clone(),
            publish: publish.clone(),
            signal_tx,
            session_id: self.session_id.clone(),
            user_name: self.room.local_participant().display_name,
            translation: self.config.translation.clone(),
            output_rate: self.config.audio.output_sample_rate,
        };
        let consumer = tokio::spawn(run_turn_loop(connection.events, signal_rx, ctx));

        Ok(TurnSession {
            pump: Some(pump),
            closer,
            cancel,
            publish,
            consumer,
        })
    }
}

impl Drop for TranslationEngine {
    fn drop(&mut self) {
        if let Some(task) = self
            .peer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Mirrors peer broadcasts onto local state.
///
/// Echo suppression by identity; the advertised orb value alone decides
/// the local microphone: translating mutes it, listening leaves it as-is,
/// anything else re-enables it. Delivery is best-effort — a missed
/// broadcast self-corrects on the peer's next transition.
async fn peer_sync_loop(room: Arc<dyn RoomLayer>, shared: Arc<EngineShared>) {
    let local_id = room.local_participant().id;
    let mut events = room.subscribe();

    loop {
        match events.recv().await {
            Ok(event) => {
                if event.user_id == local_id {
                    continue;
                }
                match event.orb_state {
                    OrbState::Translating => {
                        shared.mirror_orb(OrbState::Translating);
                        room.set_microphone_enabled(false).await;
                    }
                    OrbState::Listening => {
                        shared.mirror_orb(OrbState::Listening);
                    }
                    OrbState::Idle => {
                        shared.mirror_orb(OrbState::Idle);
                        room.set_microphone_enabled(true).await;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "missed peer broadcasts");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Everything a session's consumer loop needs.
struct TurnContext {
    mode: TurnMode,
    engine: Weak<TranslationEngine>,
    shared: Arc<EngineShared>,
    renderer: Arc<StdMutex<CaptionRenderer>>,
    room: Arc<dyn RoomLayer>,
    store: Arc<dyn TranscriptStore>,
    sink: Arc<dyn PlaybackSink>,
    pump: PumpControl,
    cancel: Arc<watch::Sender<bool>>,
    publish: PublishBack,
    signal_tx: mpsc::Sender<SessionSignal>,
    session_id: String,
    user_name: String,
    translation: TranslationConfig,
    output_rate: u32,
}

/// Resolves once the session's cancel flag is raised.
async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// One consumer loop per session: transport events and playback signals
/// are processed here, in arrival order per channel.
async fn run_turn_loop(
    mut events: mpsc::Receiver<TransportEvent>,
    mut signals: mpsc::Receiver<SessionSignal>,
    ctx: TurnContext,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Text(delta)) => ctx.on_text_delta(&delta),
                Some(TransportEvent::Transcript { text, .. }) => ctx.on_text_delta(&text),
                Some(TransportEvent::Audio(bytes)) => ctx.on_audio(bytes).await,
                Some(TransportEvent::Closed { reason }) => {
                    ctx.on_closed(reason);
                    break;
                }
                None => {
                    ctx.on_closed(None);
                    break;
                }
            },
            signal = signals.recv() => match signal {
                Some(SessionSignal::PlaybackFinished) => ctx.on_playback_finished().await,
                None => break,
            }
        }
    }
}

impl TurnContext {
    fn on_text_delta(&self, delta: &str) {
        let current = self.shared.append_delta(delta);
        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&current, false);
    }

    async fn on_audio(&self, bytes: Vec<u8>) {
        // Pause capture before any sound plays so the engine never
        // re-ingests its own synthesized output.
        self.pump.pause().await;
        if self.mode == TurnMode::BSpeak {
            self.room.set_microphone_enabled(false).await;
        }
        let (mode, orb) = self.shared.set_orb(OrbState::Translating);
        broadcast_state(&self.room, &self.shared, mode, orb).await;

        let audio = match decode_audio_payload(&bytes, self.output_rate) {
            Ok(audio) => audio,
            Err(e) => {
                warn!(error = %e, "undecodable audio payload, resuming capture");
                self.resume_listening().await;
                return;
            }
        };

        // Arm cancellation for this playback. A skip that lands before the
        // spawned task first polls is still observed: the watch latches.
        self.cancel.send_replace(false);
        let cancel_rx = self.cancel.subscribe();

        match self.mode {
            TurnMode::ASpeak => {
                // Speak-to-others: render as an outgoing room source so the
                // remote side hears the translation, not the local device.
                if let Err(e) = self.publish.write(&audio).await {
                    warn!(error = %e, "publish-back failed");
                    self.resume_listening().await;
                    return;
                }
                let signal_tx = self.signal_tx.clone();
                let duration = audio.duration();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = wait_cancelled(cancel_rx) => {}
                        _ = tokio::time::sleep(duration) => {}
                    }
                    let _ = signal_tx.send(SessionSignal::PlaybackFinished).await;
                });
            }
            TurnMode::BSpeak | TurnMode::Idle => {
                // Listen-for-others: local output device only.
                let sink = self.sink.clone();
                let signal_tx = self.signal_tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = wait_cancelled(cancel_rx) => {}
                        result = sink.play(audio) => {
                            if let Err(e) = result {
                                warn!(error = %e, "local playback failed");
                            }
                        }
                    }
                    let _ = signal_tx.send(SessionSignal::PlaybackFinished).await;
                });
            }
        }
    }

    /// Resume capture and return the orb to listening without flushing the
    /// text buffer (used when playback never actually started).
    async fn resume_listening(&self) {
        self.pump.resume().await;
        if self.mode == TurnMode::BSpeak {
            self.room.set_microphone_enabled(true).await;
        }
        let (mode, orb) = self.shared.set_orb(OrbState::Listening);
        broadcast_state(&self.room, &self.shared, mode, orb).await;
    }

    async fn on_playback_finished(&self) {
        self.resume_listening().await;

        // Flush the accumulated text for this turn as one finalized record.
        let text = self.shared.take_current_text();
        if text.is_empty() {
            return;
        }

        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&text, true);

        let segment = TranscriptSegment::finalized(text.clone());
        self.shared
            .push_final(segment, self.translation.retained_segments);

        let language_pair = match self.mode {
            TurnMode::ASpeak => self.translation.pair_a_to_b(),
            _ => self.translation.pair_b_to_a(),
        };
        persist_best_effort(
            self.store.clone(),
            TranscriptRecord {
                session_id: self.session_id.clone(),
                user_name: self.user_name.clone(),
                original_text: ORIGINAL_AUDIO_MARKER.to_string(),
                translated_text: text,
                language_pair,
                is_final: true,
            },
        );
    }

    fn on_closed(&self, reason: Option<String>) {
        warn!(?reason, "transport closed, tearing down session");
        // Teardown must run outside this task: stop() awaits the consumer
        // loop's own abort.
        if let Some(engine) = self.engine.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = engine.stop().await {
                    error!(error = %e, "teardown after transport close failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioSource, MockAudioSource};
    use crate::playback::MockPlayback;
    use crate::room::{MockRoom, StateEvent};
    use crate::store::MemoryStore;
    use crate::transport::{MockBackend, MockScript};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Device provider that counts outstanding microphone acquisitions.
    struct CountingDevices {
        acquired: Arc<AtomicUsize>,
        deny: bool,
    }

    impl CountingDevices {
        fn new() -> Self {
            Self {
                acquired: Arc::new(AtomicUsize::new(0)),
                deny: false,
            }
        }

        fn denying() -> Self {
            Self {
                acquired: Arc::new(AtomicUsize::new(0)),
                deny: true,
            }
        }
    }

    /// Microphone handle that decrements the outstanding count on stop.
    struct TrackedSource {
        inner: MockAudioSource,
        acquired: Arc<AtomicUsize>,
        released: bool,
    }

    impl AudioSource for TrackedSource {
        fn start(&mut self) -> crate::error::Result<()> {
            self.inner.start()
        }

        fn stop(&mut self) -> crate::error::Result<()> {
            if !self.released {
                self.released = true;
                self.acquired.fetch_sub(1, Ordering::SeqCst);
            }
            self.inner.stop()
        }

        fn read_samples(&mut self) -> crate::error::Result<Vec<i16>> {
            self.inner.read_samples()
        }
    }

    #[async_trait]
    impl DeviceSources for CountingDevices {
        async fn microphone(&self) -> crate::error::Result<Box<dyn AudioSource>> {
            if self.deny {
                return Err(EngineError::DevicePermissionDenied {
                    message: "denied by test".to_string(),
                });
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TrackedSource {
                inner: MockAudioSource::new().with_samples(vec![9i16; 160]),
                acquired: Arc::clone(&self.acquired),
                released: false,
            }))
        }

        async fn screen_share(&self) -> crate::error::Result<Box<dyn AudioSource>> {
            Err(EngineError::AudioCapture {
                message: "no screen share in tests".to_string(),
            })
        }
    }

    struct Harness {
        engine: Arc<TranslationEngine>,
        room: Arc<MockRoom>,
        backend: Arc<MockBackend>,
        store: Arc<MemoryStore>,
        devices: Arc<CountingDevices>,
        sink: Arc<MockPlayback>,
    }

    fn harness_with(room: MockRoom, devices: CountingDevices) -> Harness {
        let room = Arc::new(room);
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(MemoryStore::new());
        let devices = Arc::new(devices);
        let sink = Arc::new(MockPlayback::new());

        let engine = TranslationEngine::new(
            Config::default(),
            "meeting-1",
            room.clone(),
            devices.clone(),
            backend.clone(),
            sink.clone(),
            store.clone(),
        )
        .launch();

        Harness {
            engine,
            room,
            backend,
            store,
            devices,
            sink,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockRoom::new("me").with_remote("alice"),
            CountingDevices::new(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness();
        h.engine.toggle_a().await.unwrap();
        assert_eq!(h.engine.snapshot().turn_mode, TurnMode::ASpeak);

        h.engine.stop().await.unwrap();
        let first = h.engine.snapshot();
        h.engine.stop().await.unwrap();
        let second = h.engine.snapshot();
        settle().await;

        assert_eq!(first.turn_mode, TurnMode::Idle);
        assert_eq!(first.orb_state, OrbState::Idle);
        assert_eq!(second.turn_mode, TurnMode::Idle);
        assert_eq!(second.orb_state, OrbState::Idle);
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(h.backend.open_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_toggle_a_starts_and_stops() {
        let h = harness();
        h.engine.toggle_a().await.unwrap();
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.turn_mode, TurnMode::ASpeak);
        assert_eq!(snapshot.orb_state, OrbState::Listening);
        assert!(!snapshot.is_connecting);

        h.engine.toggle_a().await.unwrap();
        assert_eq!(h.engine.snapshot().turn_mode, TurnMode::Idle);
    }

    #[tokio::test]
    async fn test_exclusivity_across_toggle_sequences() {
        let h = harness();

        h.engine.toggle_a().await.unwrap();
        h.engine.toggle_b().await.unwrap();
        h.engine.toggle_a().await.unwrap();
        h.engine.toggle_a().await.unwrap();
        h.engine.toggle_b().await.unwrap();
        settle().await;

        // At most one session is ever active: the microphone handle count
        // never exceeds one and old connections are closed before new ones
        // open.
        assert!(h.devices.acquired.load(Ordering::SeqCst) <= 1);
        assert_eq!(h.backend.open_connection_count(), 1);
        assert_eq!(h.engine.snapshot().turn_mode, TurnMode::BSpeak);

        h.engine.stop().await.unwrap();
        settle().await;
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(h.backend.open_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_switch_passes_through_idle() {
        let h = harness();
        h.engine.toggle_a().await.unwrap();
        h.engine.toggle_b().await.unwrap();

        // The stop-then-start switch must broadcast the intermediate idle
        // tick; peers depend on it to unmute.
        let pairs: Vec<(TurnMode, OrbState)> = h
            .room
            .sent_events()
            .into_iter()
            .map(|e| (e.mode, e.orb_state))
            .collect();
        assert!(pairs.contains(&(TurnMode::Idle, OrbState::Idle)));
        let idle_pos = pairs
            .iter()
            .position(|&p| p == (TurnMode::Idle, OrbState::Idle))
            .unwrap();
        let b_pos = pairs
            .iter()
            .position(|&p| p == (TurnMode::BSpeak, OrbState::Listening))
            .unwrap();
        assert!(idle_pos < b_pos, "idle tick must precede the new session");
    }

    #[tokio::test]
    async fn test_b_speak_without_remote_fails() {
        let h = harness_with(MockRoom::new("me"), CountingDevices::new());
        let err = h.engine.toggle_b().await.unwrap_err();
        match err {
            EngineError::RemoteAudioUnavailable { .. } => {}
            other => panic!("expected RemoteAudioUnavailable, got {}", other),
        }
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.turn_mode, TurnMode::Idle);
        assert!(!snapshot.is_connecting);
    }

    #[tokio::test]
    async fn test_permission_denied_aborts_without_transport() {
        let h = harness_with(
            MockRoom::new("me").with_remote("alice"),
            CountingDevices::denying(),
        );
        let err = h.engine.toggle_a().await.unwrap_err();
        match err {
            EngineError::DevicePermissionDenied { .. } => {}
            other => panic!("expected DevicePermissionDenied, got {}", other),
        }
        // Permission denial aborts the attempt before transport starts.
        assert_eq!(h.backend.connect_count(), 0);
        assert_eq!(h.engine.snapshot().turn_mode, TurnMode::Idle);
    }

    #[tokio::test]
    async fn test_broadcast_echo_suppression() {
        let h = harness();
        let before = h.engine.snapshot().orb_state;

        // A broadcast carrying our own identity must never alter local
        // state.
        h.room.inject_event(StateEvent::new(
            TurnMode::BSpeak,
            OrbState::Translating,
            "me",
        ));
        settle().await;

        assert_eq!(h.engine.snapshot().orb_state, before);
        assert!(h.room.microphone_enabled());
    }

    #[tokio::test]
    async fn test_peer_translating_mutes_then_idle_unmutes() {
        let h = harness();

        h.room.inject_event(StateEvent::new(
            TurnMode::ASpeak,
            OrbState::Translating,
            "alice",
        ));
        settle().await;
        assert!(!h.room.microphone_enabled());
        assert_eq!(h.engine.snapshot().orb_state, OrbState::Translating);

        // A listening broadcast in between leaves the mic as-is.
        h.room.inject_event(StateEvent::new(
            TurnMode::ASpeak,
            OrbState::Listening,
            "alice",
        ));
        settle().await;
        assert!(!h.room.microphone_enabled());
        assert_eq!(h.engine.snapshot().orb_state, OrbState::Listening);

        h.room
            .inject_event(StateEvent::new(TurnMode::Idle, OrbState::Idle, "alice"));
        settle().await;
        assert!(h.room.microphone_enabled());
        assert_eq!(h.engine.snapshot().orb_state, OrbState::Idle);
    }

    #[tokio::test]
    async fn test_redundant_broadcasts_suppressed() {
        let h = harness();
        h.engine.toggle_a().await.unwrap();
        h.engine.stop().await.unwrap();
        h.engine.stop().await.unwrap();
        h.engine.stop().await.unwrap();

        // Two idle broadcasts total: the stop-then-start inside toggle_a
        // and the first explicit stop. The two extra stops are suppressed.
        let idle_count = h
            .room
            .sent_events()
            .iter()
            .filter(|e| e.mode == TurnMode::Idle && e.orb_state == OrbState::Idle)
            .count();
        assert_eq!(idle_count, 2, "repeated stops must not re-broadcast idle");
    }

    #[tokio::test]
    async fn test_a_speak_turn_end_to_end() {
        let h = harness();
        h.backend.push_script(MockScript {
            events: vec![
                TransportEvent::Text("Hola".to_string()),
                TransportEvent::Audio(vec![0x01, 0x00, 0x02, 0x00]),
            ],
            emit_after_chunks: 3,
        });

        h.engine.toggle_a().await.unwrap();
        assert_eq!(h.engine.snapshot().orb_state, OrbState::Listening);

        // Capture pump uploads chunks; after the third the backend replies
        // with a text delta and an audio payload.
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(h.backend.sent_chunks().len() >= 3);
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.orb_state, OrbState::Listening, "orb returns to listening");
        assert!(snapshot.transcripts.iter().any(|s| s.text == "Hola"));

        // Speak-to-others renders into the room, not locally.
        assert_eq!(h.room.publish_count(), 1);
        assert!(h.sink.played().is_empty());

        // Orb passed through TRANSLATING on the way.
        let orbs: Vec<OrbState> = h.room.sent_events().iter().map(|e| e.orb_state).collect();
        assert!(orbs.contains(&OrbState::Translating));

        // One persistence write with the A→B pair and the translated text.
        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].language_pair, "en-tl");
        assert_eq!(records[0].translated_text, "Hola");
        assert_eq!(records[0].original_text, "Audio Speech");
        assert_eq!(records[0].user_name, "me");
        assert_eq!(records[0].session_id, "meeting-1");
        assert!(records[0].is_final);

        h.engine.stop().await.unwrap();
        settle().await;
        assert_eq!(h.room.active_publish_count(), 0, "stop must unpublish");
    }

    #[tokio::test]
    async fn test_b_speak_plays_locally_and_mutes_mic() {
        let h = harness();
        h.backend.push_script(MockScript {
            events: vec![
                TransportEvent::Text("Hello".to_string()),
                TransportEvent::Audio(vec![0x01, 0x00]),
            ],
            emit_after_chunks: 1,
        });

        h.engine.toggle_b().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // Listen-for-others renders locally; nothing is published.
        assert_eq!(h.sink.played().len(), 1);
        assert_eq!(h.room.publish_count(), 0);

        // The mic was muted for playback and re-enabled afterwards.
        let history = h.room.microphone_history();
        assert!(history.contains(&false));
        assert_eq!(history.last(), Some(&true));
        assert!(h.room.microphone_enabled());

        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].language_pair, "tl-en");

        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_turn_cancels_playback_and_resumes() {
        let room = Arc::new(MockRoom::new("me").with_remote("alice"));
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(MemoryStore::new());
        let devices = Arc::new(CountingDevices::new());
        // A render long enough that only a skip can end it promptly.
        let sink = Arc::new(MockPlayback::new().with_delay(Duration::from_secs(30)));

        let engine = TranslationEngine::new(
            Config::default(),
            "meeting-1",
            room.clone(),
            devices.clone(),
            backend.clone(),
            sink.clone(),
            store.clone(),
        )
        .launch();

        backend.push_script(MockScript {
            events: vec![
                TransportEvent::Text("lange Übersetzung".to_string()),
                TransportEvent::Audio(vec![0x01, 0x00]),
            ],
            emit_after_chunks: 1,
        });

        engine.toggle_b().await.unwrap();
        // Wait until the orb reports translating.
        for _ in 0..100 {
            if engine.snapshot().orb_state == OrbState::Translating {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.snapshot().orb_state, OrbState::Translating);

        engine.skip_turn().await;
        for _ in 0..100 {
            if engine.snapshot().orb_state == OrbState::Listening {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.snapshot().orb_state, OrbState::Listening);
        assert!(room.microphone_enabled());

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_turn_outside_translating_is_noop() {
        let h = harness();
        h.engine.skip_turn().await;
        assert_eq!(h.engine.snapshot().orb_state, OrbState::Idle);

        h.engine.toggle_a().await.unwrap();
        h.engine.skip_turn().await;
        assert_eq!(h.engine.snapshot().orb_state, OrbState::Listening);
        h.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_close_tears_down_to_idle() {
        let h = harness();
        h.backend.push_script(MockScript {
            events: vec![TransportEvent::Closed { reason: Some("gone".to_string()) }],
            emit_after_chunks: 1,
        });

        h.engine.toggle_a().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.turn_mode, TurnMode::Idle);
        assert_eq!(snapshot.orb_state, OrbState::Idle);
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 0);
        assert!(h.room.microphone_enabled());
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_affect_state() {
        let room = Arc::new(MockRoom::new("me").with_remote("alice"));
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(MemoryStore::failing());
        let devices = Arc::new(CountingDevices::new());
        let sink = Arc::new(MockPlayback::new());

        let engine = TranslationEngine::new(
            Config::default(),
            "meeting-1",
            room.clone(),
            devices,
            backend.clone(),
            sink,
            store.clone(),
        )
        .launch();

        backend.push_script(MockScript {
            events: vec![
                TransportEvent::Text("Hola".to_string()),
                TransportEvent::Audio(vec![0x01, 0x00]),
            ],
            emit_after_chunks: 1,
        });

        engine.toggle_a().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // The failed write is logged and swallowed; the pipeline keeps its
        // state and the turn completed normally.
        assert_eq!(engine.snapshot().orb_state, OrbState::Listening);
        assert!(store.records().is_empty());

        engine.stop().await.unwrap();
    }
}
