//! Default configuration constants for voicebridge.
//!
//! This module provides shared constants used across different configuration
//! types to ensure consistency and eliminate duplication.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard for speech recognition and provides a good balance
/// between quality and bandwidth for streamed voice.
pub const SAMPLE_RATE: u32 = 16000;

/// Default output sample rate in Hz for synthesized audio.
///
/// Used when a backend audio payload carries no container header and the
/// rate cannot be read from the payload itself.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Default capture chunk interval in milliseconds for translation sessions.
///
/// Audio is sliced into fixed time slices and uploaded as they are cut.
/// 100ms keeps the backend close to real time without flooding it.
pub const TRANSLATION_CHUNK_INTERVAL_MS: u64 = 100;

/// Default capture chunk interval in milliseconds for caption sessions.
///
/// Captions tolerate more latency than duplex translation; 250ms slices
/// reduce upload overhead.
pub const CAPTION_CHUNK_INTERVAL_MS: u64 = 250;

/// Default speech model requested in the session setup message.
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// Default synthesized voice requested in the session setup message.
pub const DEFAULT_VOICE: &str = "Orus";

/// MIME type advertised for uploaded audio chunks.
pub const DEFAULT_CHUNK_MIME: &str = "audio/pcm;rate=16000";

/// Default language code for side A of a translation turn.
pub const LANGUAGE_A: &str = "en";

/// Default language code for side B of a translation turn.
pub const LANGUAGE_B: &str = "tl";

/// Default display name for side A's language, used in the setup instruction.
pub const LANGUAGE_A_NAME: &str = "English";

/// Default display name for side B's language, used in the setup instruction.
pub const LANGUAGE_B_NAME: &str = "Tagalog";

/// How many finalized transcript segments a translation session retains.
pub const TRANSLATION_RETAINED_SEGMENTS: usize = 10;

/// How many finalized transcript segments a caption session retains.
pub const CAPTION_RETAINED_SEGMENTS: usize = 20;

/// How many finalized segments the caption overlay window shows.
pub const CAPTION_WINDOW_SIZE: usize = 3;

/// Base delay between revealed caption characters, in milliseconds.
pub const REVEAL_BASE_DELAY_MS: u64 = 35;

/// Reveal delay when the unrevealed backlog is large, in milliseconds.
pub const REVEAL_FAST_DELAY_MS: u64 = 12;

/// Backlog size (in characters) above which the fast reveal delay applies.
pub const REVEAL_BACKLOG_THRESHOLD: usize = 24;

/// Pause after a sentence-ending character, in milliseconds.
pub const REVEAL_SENTENCE_PAUSE_MS: u64 = 120;

/// Poll interval while the renderer has nothing left to reveal, in milliseconds.
pub const REVEAL_IDLE_POLL_MS: u64 = 30;
