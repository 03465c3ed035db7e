//! WebSocket implementation of the speech transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::audio::AudioChunk;
use crate::config::{AudioConfig, BackendConfig};
use crate::error::{EngineError, Result};
use crate::transport::envelope::{self, ServerEvent, SessionKind};
use crate::transport::{SessionSetup, SpeechBackend, TransportConnection, TransportEvent};

/// Duplex WebSocket client for the speech backend.
///
/// Translation sessions frame chunks as base64 JSON envelopes; caption
/// sessions send unframed binary frames to the transcription proxy.
pub struct WsBackend {
    backend: BackendConfig,
    audio: AudioConfig,
}

impl WsBackend {
    pub fn new(backend: BackendConfig, audio: AudioConfig) -> Self {
        Self { backend, audio }
    }

    fn url_for(&self, setup: &SessionSetup) -> String {
        match setup {
            SessionSetup::Translate { .. } => {
                format!("{}?key={}", self.backend.live_url, self.backend.api_key)
            }
            SessionSetup::Transcribe => {
                format!(
                    "{}?api_key={}",
                    self.backend.captions_url, self.backend.api_key
                )
            }
        }
    }
}

#[async_trait]
impl SpeechBackend for WsBackend {
    async fn connect(&self, setup: SessionSetup) -> Result<TransportConnection> {
        let url = self.url_for(&setup);
        let (stream, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| EngineError::Transport {
                    message: format!("connect failed: {}", e),
                })?;
        debug!(kind = ?setup.kind(), "speech backend connected");

        let (mut write, mut read) = stream.split();

        // The setup message establishes model, voice, and the translation
        // instruction before any audio flows.
        if let SessionSetup::Translate {
            model,
            voice,
            instruction,
        } = &setup
        {
            let setup_json = envelope::setup_message(model, voice, instruction);
            write
                .send(Message::text(setup_json))
                .await
                .map_err(|e| EngineError::Transport {
                    message: format!("setup send failed: {}", e),
                })?;
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<AudioChunk>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let kind = setup.kind();
        let mime = self.audio.chunk_mime.clone();

        // Writer: forwards chunks in capture order until closed.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    chunk = chunk_rx.recv() => match chunk {
                        Some(chunk) => {
                            let message = match kind {
                                SessionKind::Translation => {
                                    Message::text(envelope::realtime_chunk(&mime, &chunk.data))
                                }
                                SessionKind::Transcription => Message::binary(chunk.data),
                            };
                            if let Err(e) = write.send(message).await {
                                debug!(error = %e, "chunk send failed, stopping writer");
                                break;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        });

        // Reader: decodes inbound messages in arrival order. Malformed JSON
        // is logged and skipped; close and errors end the session.
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match envelope::parse_inbound(kind, text.as_str()) {
                        Ok(events) => {
                            for event in events {
                                let event = match event {
                                    ServerEvent::TextDelta(t) => TransportEvent::Text(t),
                                    ServerEvent::Audio(a) => TransportEvent::Audio(a),
                                    ServerEvent::Transcript { text, is_final } => {
                                        TransportEvent::Transcript { text, is_final }
                                    }
                                };
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed backend message");
                        }
                    },
                    Ok(Message::Binary(bytes)) => {
                        // Raw binary frames carry synthesized audio directly.
                        if event_tx
                            .send(TransportEvent::Audio(bytes.to_vec()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = event_tx.send(TransportEvent::Closed { reason }).await;
                        return;
                    }
                    Ok(_) => {} // ping/pong handled by tungstenite
                    Err(e) => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: Some(e.to_string()),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Closed { reason: None }).await;
        });

        Ok(TransportConnection::new(chunk_tx, event_rx, close_tx))
    }
}
