//! Streaming transport to the speech backend.
//!
//! One duplex connection exists per active session. Outgoing audio chunks
//! are forwarded in capture order; inbound messages are decoded and handed
//! to the session's consumer loop in arrival order. Connection close or
//! error triggers full session teardown at the caller — reconnection is a
//! caller-level retry of the whole session, never a transport concern.

pub mod envelope;
pub mod ws;

pub use envelope::{SessionKind, ServerEvent};
pub use ws::WsBackend;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::audio::AudioChunk;
use crate::config::{BackendConfig, TranslationConfig};
use crate::error::Result;
use crate::transport::envelope::translation_instruction;

/// Events surfaced by a transport connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Incremental text delta for the running transcript buffer.
    Text(String),
    /// Decoded synthesized audio for playback.
    Audio(Vec<u8>),
    /// A transcription update with the recognizer's final flag.
    Transcript { text: String, is_final: bool },
    /// The connection closed or errored; the session must tear down.
    Closed { reason: Option<String> },
}

/// Connection setup for one session.
#[derive(Debug, Clone)]
pub enum SessionSetup {
    /// Duplex translation session: JSON setup message, JSON-framed chunks.
    Translate {
        model: String,
        voice: String,
        instruction: String,
    },
    /// Plain transcription session: no setup message, raw-binary chunks.
    Transcribe,
}

impl SessionSetup {
    /// Build the translation setup from configuration.
    pub fn translate(backend: &BackendConfig, translation: &TranslationConfig) -> Self {
        SessionSetup::Translate {
            model: backend.model.clone(),
            voice: backend.voice.clone(),
            instruction: translation_instruction(
                &translation.language_a_name,
                &translation.language_b_name,
            ),
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            SessionSetup::Translate { .. } => SessionKind::Translation,
            SessionSetup::Transcribe => SessionKind::Transcription,
        }
    }
}

/// An open duplex connection to the speech backend.
pub struct TransportConnection {
    /// Outgoing audio chunks, sent in capture order.
    pub chunks: mpsc::Sender<AudioChunk>,
    /// Inbound events, processed in arrival order.
    pub events: mpsc::Receiver<TransportEvent>,
    close: Option<oneshot::Sender<()>>,
}

impl TransportConnection {
    pub fn new(
        chunks: mpsc::Sender<AudioChunk>,
        events: mpsc::Receiver<TransportEvent>,
        close: oneshot::Sender<()>,
    ) -> Self {
        Self {
            chunks,
            events,
            close: Some(close),
        }
    }

    /// Take the close signal so teardown can fire it after the event
    /// receiver has been moved into the consumer loop.
    pub fn take_closer(&mut self) -> Option<oneshot::Sender<()>> {
        self.close.take()
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.close.take() {
            let _ = tx.send(());
        }
    }
}

/// Factory for transport connections.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Open one duplex connection for a session.
    ///
    /// Suspends until the handshake completes.
    async fn connect(&self, setup: SessionSetup) -> Result<TransportConnection>;
}

/// Scripted backend for testing.
///
/// Each connection consumes the next script in the queue: the connection
/// records uploaded chunks and, once `emit_after_chunks` uploads arrived,
/// replays the scripted events in order.
pub struct MockBackend {
    scripts: Mutex<VecDeque<MockScript>>,
    sent: Arc<Mutex<Vec<AudioChunk>>>,
    connects: AtomicUsize,
    open_connections: Arc<AtomicUsize>,
}

/// One scripted connection for [`MockBackend`].
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub events: Vec<TransportEvent>,
    pub emit_after_chunks: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: AtomicUsize::new(0),
            open_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a script for the next connection.
    pub fn push_script(&self, script: MockScript) {
        self.scripts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(script);
    }

    /// All chunks uploaded across every connection, in send order.
    pub fn sent_chunks(&self) -> Vec<AudioChunk> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections whose close signal has not fired yet.
    pub fn open_connection_count(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechBackend for MockBackend {
    async fn connect(&self, _setup: SessionSetup) -> Result<TransportConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_default();

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<AudioChunk>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let sent = Arc::clone(&self.sent);
        let open = Arc::clone(&self.open_connections);
        open.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut uploads = 0usize;
            let mut emitted = script.emit_after_chunks == 0;
            if emitted {
                for event in &script.events {
                    if event_tx.send(event.clone()).await.is_err() {
                        break;
                    }
                }
            }
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    chunk = chunk_rx.recv() => match chunk {
                        Some(chunk) => {
                            uploads += 1;
                            sent.lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .push(chunk);
                            if !emitted && uploads >= script.emit_after_chunks {
                                emitted = true;
                                for event in &script.events {
                                    if event_tx.send(event.clone()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
            open.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(TransportConnection::new(chunk_tx, event_rx, close_tx))
    }
}
