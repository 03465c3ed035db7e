//! Wire envelopes for the speech backend.
//!
//! Two inbound dialects share the transport: the duplex live API used for
//! translation (camelCase `serverContent` envelopes) and the transcription
//! proxy used for captions (snake_case frames with an `is_final` flag).
//! Outbound audio is either base64 inside a `realtime_input` JSON envelope
//! or an unframed binary frame, depending on the session kind.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::error::{EngineError, Result};

/// Which inbound dialect a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Translation,
    Transcription,
}

/// Decoded inbound message content, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Incremental text delta appended to the running transcript buffer.
    TextDelta(String),
    /// Synthesized audio payload, already base64-decoded.
    Audio(Vec<u8>),
    /// A transcription update carrying the recognizer's final flag.
    Transcript { text: String, is_final: bool },
}

/// Build the session setup message sent once after connect.
pub fn setup_message(model: &str, voice: &str, instruction: &str) -> String {
    json!({
        "setup": {
            "model": model,
            "generation_config": {
                "response_modalities": ["AUDIO"],
                "speech_config": {
                    "voice_config": {
                        "prebuilt_voice_config": { "voice_name": voice }
                    }
                }
            },
            "system_instruction": {
                "parts": [{ "text": instruction }]
            }
        }
    })
    .to_string()
}

/// Build the natural-language instruction fixing the translation direction
/// and requiring audio-only output.
pub fn translation_instruction(language_a: &str, language_b: &str) -> String {
    format!(
        "You are a real-time translator. Translate everything you hear between {} and {}. \
         Your output should be ONLY the translation in audio form. Be fast and accurate. \
         Use natural pauses.",
        language_a, language_b
    )
}

/// Wrap one encoded audio chunk in the realtime-input JSON envelope.
pub fn realtime_chunk(mime_type: &str, data: &[u8]) -> String {
    json!({
        "realtime_input": {
            "media_chunks": [{
                "mime_type": mime_type,
                "data": BASE64.encode(data),
            }]
        }
    })
    .to_string()
}

// Inbound shape for the live (translation) dialect.

#[derive(Debug, Deserialize)]
struct LiveMessage {
    #[serde(rename = "serverContent")]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
struct ServerContent {
    #[serde(rename = "modelTurn")]
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "inlineData")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

// Inbound shape for the transcription-proxy dialect.

#[derive(Debug, Deserialize)]
struct TranscriptFrame {
    channel: Option<TranscriptChannel>,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct TranscriptChannel {
    #[serde(default)]
    alternatives: Vec<TranscriptAlternative>,
}

#[derive(Debug, Deserialize)]
struct TranscriptAlternative {
    transcript: Option<String>,
}

/// Parse one inbound text frame into zero or more events.
///
/// A frame with no recognizable content parses to an empty list (ignored);
/// invalid JSON is a `MalformedMessage` the caller logs and skips.
pub fn parse_inbound(kind: SessionKind, text: &str) -> Result<Vec<ServerEvent>> {
    match kind {
        SessionKind::Translation => parse_live(text),
        SessionKind::Transcription => parse_transcript(text),
    }
}

fn parse_live(text: &str) -> Result<Vec<ServerEvent>> {
    let message: LiveMessage =
        serde_json::from_str(text).map_err(|e| EngineError::MalformedMessage {
            message: e.to_string(),
        })?;

    let mut events = Vec::new();
    let parts = message
        .server_content
        .and_then(|c| c.model_turn)
        .map(|t| t.parts)
        .unwrap_or_default();

    for part in parts {
        if let Some(delta) = part.text {
            if !delta.is_empty() {
                events.push(ServerEvent::TextDelta(delta));
            }
        }
        if let Some(inline) = part.inline_data {
            let bytes = BASE64
                .decode(inline.data.as_bytes())
                .map_err(|e| EngineError::MalformedMessage {
                    message: format!("invalid base64 audio payload: {}", e),
                })?;
            events.push(ServerEvent::Audio(bytes));
        }
    }

    Ok(events)
}

fn parse_transcript(text: &str) -> Result<Vec<ServerEvent>> {
    let frame: TranscriptFrame =
        serde_json::from_str(text).map_err(|e| EngineError::MalformedMessage {
            message: e.to_string(),
        })?;

    let transcript = frame
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .and_then(|a| a.transcript);

    match transcript {
        Some(t) if !t.is_empty() => Ok(vec![ServerEvent::Transcript {
            text: t,
            is_final: frame.is_final,
        }]),
        _ => Ok(Vec::new()),
    }
}
