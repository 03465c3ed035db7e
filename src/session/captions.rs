//! Live caption sessions (plain transcription).
//!
//! Unlike a translation turn, a caption session mixes every available
//! source (local microphone, each remote participant, and optional
//! screen-share audio) and streams the mix for interim/final text only.
//! There is no playback path; finalized segments are persisted one record
//! at a time.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioMix, CapturePump, DeviceSources};
use crate::captions::{retain_recent, CaptionRenderer, RevealTiming, TranscriptSegment};
use crate::config::Config;
use crate::error::Result;
use crate::room::RoomLayer;
use crate::store::{persist_best_effort, TranscriptRecord, TranscriptStore};
use crate::transport::{SessionSetup, SpeechBackend, TransportEvent};

/// Name under which the local microphone joins the caption mix.
const MICROPHONE_SOURCE: &str = "microphone";

/// Name under which screen-share audio joins the caption mix.
const SCREEN_SOURCE: &str = "screen";

/// Read-only observable caption state.
#[derive(Debug, Clone)]
pub struct CaptionsSnapshot {
    pub is_enabled: bool,
    pub is_connecting: bool,
    pub transcripts: Vec<TranscriptSegment>,
    pub current_text: String,
}

#[derive(Debug, Default)]
struct CaptionsState {
    is_enabled: bool,
    is_connecting: bool,
    transcripts: Vec<TranscriptSegment>,
    current_text: String,
}

/// Resources owned by one caption session.
struct CaptionSession {
    pump: Option<CapturePump>,
    closer: Option<oneshot::Sender<()>>,
    consumer: JoinHandle<()>,
}

impl CaptionSession {
    async fn teardown(mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.shutdown().await {
                warn!(error = %e, "caption capture release failed");
            }
        }
        self.consumer.abort();
    }
}

/// Live caption engine: one toggleable transcription session plus the
/// incremental overlay renderer.
pub struct CaptionsEngine {
    config: Config,
    session_id: String,
    room: Arc<dyn RoomLayer>,
    devices: Arc<dyn DeviceSources>,
    backend: Arc<dyn SpeechBackend>,
    store: Arc<dyn TranscriptStore>,
    renderer: Arc<StdMutex<CaptionRenderer>>,
    state: Arc<StdMutex<CaptionsState>>,
    session: Mutex<Option<CaptionSession>>,
    reveal_task: StdMutex<Option<JoinHandle<()>>>,
}

impl CaptionsEngine {
    pub fn new(
        config: Config,
        session_id: impl Into<String>,
        room: Arc<dyn RoomLayer>,
        devices: Arc<dyn DeviceSources>,
        backend: Arc<dyn SpeechBackend>,
        store: Arc<dyn TranscriptStore>,
    ) -> Self {
        let window_size = config.captions.window_size;
        Self {
            config,
            session_id: session_id.into(),
            room,
            devices,
            backend,
            store,
            renderer: Arc::new(StdMutex::new(CaptionRenderer::new(
                window_size,
                RevealTiming::default(),
            ))),
            state: Arc::new(StdMutex::new(CaptionsState::default())),
            session: Mutex::new(None),
            reveal_task: StdMutex::new(None),
        }
    }

    /// Finish construction and start the reveal driver.
    pub fn launch(self) -> Arc<Self> {
        let engine = Arc::new(self);
        let renderer = engine.renderer.clone();
        let task = tokio::spawn(async move {
            loop {
                let delay = renderer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .tick();
                tokio::time::sleep(delay).await;
            }
        });
        *engine
            .reveal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        engine
    }

    pub fn snapshot(&self) -> CaptionsSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        CaptionsSnapshot {
            is_enabled: state.is_enabled,
            is_connecting: state.is_connecting,
            transcripts: state.transcripts.clone(),
            current_text: state.current_text.clone(),
        }
    }

    /// Renderer driving the caption overlay.
    pub fn renderer(&self) -> Arc<StdMutex<CaptionRenderer>> {
        Arc::clone(&self.renderer)
    }

    /// Show/hide captions: starts or stops the transcription session.
    pub async fn toggle_captions(self: &Arc<Self>) -> Result<()> {
        let enabled = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.is_enabled
        };
        if enabled {
            self.stop().await
        } else {
            self.start().await
        }
    }

    /// Stop the caption session. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let session = { self.session.lock().await.take() };
        if let Some(session) = session {
            info!("stopping caption session");
            session.teardown().await;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.is_enabled = false;
            state.is_connecting = false;
            state.current_text.clear();
        }
        let mut renderer = self.renderer.lock().unwrap_or_else(PoisonError::into_inner);
        renderer.set_visible(false);
        renderer.clear();
        Ok(())
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_enabled || state.is_connecting {
                return Ok(());
            }
            state.is_connecting = true;
        }

        match self.start_session().await {
            Ok(session) => {
                *self.session.lock().await = Some(session);
                {
                    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.is_connecting = false;
                    state.is_enabled = true;
                }
                self.renderer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .set_visible(true);
                info!("caption session started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to start caption session");
                self.stop().await?;
                Err(e)
            }
        }
    }

    async fn start_session(self: &Arc<Self>) -> Result<CaptionSession> {
        // Mix of local mic + all remote participants + optional screen
        // share. Only the microphone is mandatory.
        let mut mix = AudioMix::new();
        let microphone = self.devices.microphone().await?;
        mix.connect(MICROPHONE_SOURCE, microphone)?;

        for participant in self.room.participants().await {
            if participant.is_local {
                continue;
            }
            match self.room.participant_audio(&participant.id).await {
                Ok(audio) => {
                    if let Err(e) = mix.connect(&format!("remote:{}", participant.id), audio) {
                        warn!(participant = %participant.id, error = %e, "skipping remote audio");
                    }
                }
                Err(e) => {
                    warn!(participant = %participant.id, error = %e, "remote audio unavailable");
                }
            }
        }

        match self.devices.screen_share().await {
            Ok(screen) => {
                if let Err(e) = mix.connect(SCREEN_SOURCE, screen) {
                    warn!(error = %e, "skipping screen-share audio");
                }
            }
            Err(e) => {
                warn!(error = %e, "system audio sharing unavailable, captions use voice only");
            }
        }

        let mut connection = match self.backend.connect(SessionSetup::Transcribe).await {
            Ok(connection) => connection,
            Err(e) => {
                let _ = mix.release();
                return Err(e);
            }
        };
        let closer = connection.take_closer();

        let interval = Duration::from_millis(self.config.captions.chunk_interval_ms);
        let pump = CapturePump::spawn(mix, interval, connection.chunks.clone());

        let ctx = CaptionContext {
            engine: Arc::downgrade(self),
            state: self.state.clone(),
            renderer: self.renderer.clone(),
            store: self.store.clone(),
            session_id: self.session_id.clone(),
            user_name: self.room.local_participant().display_name,
            language: self.config.translation.language_a.clone(),
            retained: self.config.captions.retained_segments,
        };
        let consumer = tokio::spawn(run_caption_loop(connection.events, ctx));

        Ok(CaptionSession {
            pump: Some(pump),
            closer,
            consumer,
        })
    }
}

impl Drop for CaptionsEngine {
    fn drop(&mut self) {
        if let Some(task) = self
            .reveal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

struct CaptionContext {
    engine: Weak<CaptionsEngine>,
    state: Arc<StdMutex<CaptionsState>>,
    renderer: Arc<StdMutex<CaptionRenderer>>,
    store: Arc<dyn TranscriptStore>,
    session_id: String,
    user_name: String,
    language: String,
    retained: usize,
}

async fn run_caption_loop(mut events: mpsc::Receiver<TransportEvent>, ctx: CaptionContext) {
    loop {
        match events.recv().await {
            Some(TransportEvent::Transcript { text, is_final }) => {
                if text.trim().is_empty() {
                    continue;
                }
                if is_final {
                    ctx.on_final(text);
                } else {
                    ctx.on_interim(text);
                }
            }
            Some(TransportEvent::Text(text)) => {
                // Some proxies deliver plain deltas; treat them as interim.
                ctx.on_interim(text);
            }
            Some(TransportEvent::Audio(_)) => {
                debug!("ignoring audio payload on caption session");
            }
            Some(TransportEvent::Closed { reason }) => {
                warn!(?reason, "caption transport closed, tearing down");
                if let Some(engine) = ctx.engine.upgrade() {
                    tokio::spawn(async move {
                        if let Err(e) = engine.stop().await {
                            error!(error = %e, "caption teardown failed");
                        }
                    });
                }
                break;
            }
            None => break,
        }
    }
}

impl CaptionContext {
    fn on_interim(&self, text: String) {
        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&text, false);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.current_text = text;
    }

    fn on_final(&self, text: String) {
        self.renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&text, true);

        let segment = TranscriptSegment::finalized(text.clone());
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            retain_recent(&mut state.transcripts, segment, self.retained);
            state.current_text.clear();
        }

        persist_best_effort(
            self.store.clone(),
            TranscriptRecord {
                session_id: self.session_id.clone(),
                user_name: self.user_name.clone(),
                original_text: text,
                translated_text: String::new(),
                language_pair: self.language.clone(),
                is_final: true,
            },
        );
    }
}
