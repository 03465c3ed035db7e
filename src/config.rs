use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::defaults;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub audio: AudioConfig,
    pub translation: TranslationConfig,
    pub captions: CaptionsConfig,
}

/// Speech backend endpoints and session parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Duplex endpoint for translation sessions.
    pub live_url: String,
    /// Endpoint for plain transcription (caption) sessions.
    pub captions_url: String,
    /// API key appended to the connection URL.
    pub api_key: String,
    pub model: String,
    pub voice: String,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    /// Fallback rate for synthesized payloads without a container header.
    pub output_sample_rate: u32,
    pub chunk_mime: String,
}

/// Translation session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranslationConfig {
    /// Language code for side A (the local speaker's language).
    pub language_a: String,
    /// Language code for side B (the remote speaker's language).
    pub language_b: String,
    /// Display name for side A's language, used in the setup instruction.
    pub language_a_name: String,
    /// Display name for side B's language, used in the setup instruction.
    pub language_b_name: String,
    pub chunk_interval_ms: u64,
    pub retained_segments: usize,
}

/// Caption session and overlay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptionsConfig {
    pub chunk_interval_ms: u64,
    pub retained_segments: usize,
    /// How many finalized segments the overlay shows at once.
    pub window_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            live_url: String::new(),
            captions_url: String::new(),
            api_key: String::new(),
            model: defaults::DEFAULT_MODEL.to_string(),
            voice: defaults::DEFAULT_VOICE.to_string(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            output_sample_rate: defaults::OUTPUT_SAMPLE_RATE,
            chunk_mime: defaults::DEFAULT_CHUNK_MIME.to_string(),
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            language_a: defaults::LANGUAGE_A.to_string(),
            language_b: defaults::LANGUAGE_B.to_string(),
            language_a_name: defaults::LANGUAGE_A_NAME.to_string(),
            language_b_name: defaults::LANGUAGE_B_NAME.to_string(),
            chunk_interval_ms: defaults::TRANSLATION_CHUNK_INTERVAL_MS,
            retained_segments: defaults::TRANSLATION_RETAINED_SEGMENTS,
        }
    }
}

impl Default for CaptionsConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: defaults::CAPTION_CHUNK_INTERVAL_MS,
            retained_segments: defaults::CAPTION_RETAINED_SEGMENTS,
            window_size: defaults::CAPTION_WINDOW_SIZE,
        }
    }
}

impl TranslationConfig {
    /// Language pair for a turn in the A→B direction (e.g. "en-tl").
    pub fn pair_a_to_b(&self) -> String {
        format!("{}-{}", self.language_a, self.language_b)
    }

    /// Language pair for a turn in the B→A direction (e.g. "tl-en").
    pub fn pair_b_to_a(&self) -> String {
        format!("{}-{}", self.language_b, self.language_a)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file is missing
    ///
    /// Only returns defaults if the file does not exist.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOICEBRIDGE_API_KEY → backend.api_key
    /// - VOICEBRIDGE_LIVE_URL → backend.live_url
    /// - VOICEBRIDGE_CAPTIONS_URL → backend.captions_url
    /// - VOICEBRIDGE_AUDIO_DEVICE → audio.device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("VOICEBRIDGE_API_KEY")
            && !key.is_empty()
        {
            self.backend.api_key = key;
        }

        if let Ok(url) = std::env::var("VOICEBRIDGE_LIVE_URL")
            && !url.is_empty()
        {
            self.backend.live_url = url;
        }

        if let Ok(url) = std::env::var("VOICEBRIDGE_CAPTIONS_URL")
            && !url.is_empty()
        {
            self.backend.captions_url = url;
        }

        if let Ok(device) = std::env::var("VOICEBRIDGE_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_voicebridge_env() {
        remove_env("VOICEBRIDGE_API_KEY");
        remove_env("VOICEBRIDGE_LIVE_URL");
        remove_env("VOICEBRIDGE_CAPTIONS_URL");
        remove_env("VOICEBRIDGE_AUDIO_DEVICE");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.audio.device, None);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.chunk_mime, "audio/pcm;rate=16000");

        assert_eq!(config.translation.language_a, "en");
        assert_eq!(config.translation.language_b, "tl");
        assert_eq!(config.translation.chunk_interval_ms, 100);
        assert_eq!(config.translation.retained_segments, 10);

        assert_eq!(config.captions.chunk_interval_ms, 250);
        assert_eq!(config.captions.window_size, 3);
        assert_eq!(config.captions.retained_segments, 20);

        assert!(config.backend.model.contains("gemini"));
        assert_eq!(config.backend.voice, "Orus");
    }

    #[test]
    fn test_language_pairs() {
        let config = TranslationConfig::default();
        assert_eq!(config.pair_a_to_b(), "en-tl");
        assert_eq!(config.pair_b_to_a(), "tl-en");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().expect("create temp file");
        writeln!(
            file,
            r#"
[backend]
live_url = "wss://example.test/live"
api_key = "secret"

[translation]
language_a = "en"
language_b = "de"
language_b_name = "German"

[captions]
window_size = 4
"#
        )
        .expect("write temp config");

        let config = Config::load(file.path()).expect("load config");
        assert_eq!(config.backend.live_url, "wss://example.test/live");
        assert_eq!(config.backend.api_key, "secret");
        assert_eq!(config.translation.language_b, "de");
        assert_eq!(config.translation.language_b_name, "German");
        assert_eq!(config.captions.window_size, 4);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.translation.pair_a_to_b(), "en-de");
    }

    #[test]
    fn test_load_invalid_toml_is_error() {
        let mut file = NamedTempFile::new().expect("create temp file");
        writeln!(file, "backend = nonsense =").expect("write temp config");
        assert!(Config::load(file.path()).is_err());
        assert!(Config::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let path = Path::new("/nonexistent/voicebridge/config.toml");
        let config = Config::load_or_default(path).expect("missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_voicebridge_env();

        set_env("VOICEBRIDGE_API_KEY", "env-key");
        set_env("VOICEBRIDGE_AUDIO_DEVICE", "pipewire");

        let config = Config::default().with_env_overrides();
        assert_eq!(config.backend.api_key, "env-key");
        assert_eq!(config.audio.device.as_deref(), Some("pipewire"));

        clear_voicebridge_env();
    }

    #[test]
    fn test_env_overrides_ignore_empty_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_voicebridge_env();

        set_env("VOICEBRIDGE_API_KEY", "");

        let config = Config::default().with_env_overrides();
        assert_eq!(config.backend.api_key, "");

        clear_voicebridge_env();
    }
}
