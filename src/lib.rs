//! voicebridge - turn-based live audio translation and captioning engine
//!
//! Captures live audio from call participants, streams it to a remote
//! speech backend over a duplex connection, and routes the replies: text
//! deltas feed the incremental caption renderer, synthesized audio feeds
//! the playback/publish-back path. Turn and orb state are kept consistent
//! across peers through best-effort broadcasts.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod captions;
pub mod config;
pub mod defaults;
pub mod error;
pub mod playback;
pub mod room;
pub mod session;
pub mod store;
pub mod transport;

// Core seams (capture → transport → captions/playback)
pub use audio::{AudioChunk, AudioMix, AudioSource, DeviceSources, MockAudioSource};
pub use playback::{decode_audio_payload, DecodedAudio, MockPlayback, PlaybackSink, PublishBack};
pub use transport::{
    MockBackend, MockScript, SessionSetup, SpeechBackend, TransportConnection, TransportEvent,
    WsBackend,
};

// Engines
pub use session::{
    CaptionsEngine, CaptionsSnapshot, EngineSnapshot, OrbState, TranslationEngine, TurnMode,
};
pub use session::{BroadcastGuard, EngineEvent};

// Captions
pub use captions::{CaptionRenderer, RevealTiming, TranscriptSegment};

// External collaborators
pub use room::{MockRoom, Participant, PublishedTrack, RoomLayer, StateEvent};
pub use store::{MemoryStore, NoopStore, TranscriptRecord, TranscriptStore};

// Error handling
pub use error::{EngineError, Result};

// Config
pub use config::Config;

#[cfg(feature = "cpal-audio")]
pub use audio::capture::{CpalAudioSource, CpalDeviceSources};
#[cfg(feature = "cpal-audio")]
pub use playback::DevicePlayback;
