//! Error types for voicebridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Capture errors
    #[error("Device permission denied: {message}")]
    DevicePermissionDenied { message: String },

    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("No remote participant audio available: {message}")]
    RemoteAudioUnavailable { message: String },

    #[error("Audio source '{name}' is already connected")]
    SourceAlreadyConnected { name: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Transport connection closed")]
    TransportClosed,

    #[error("Malformed backend message: {message}")]
    MalformedMessage { message: String },

    // Playback / publish-back errors
    #[error("Playback failed: {message}")]
    Playback { message: String },

    #[error("Publish failed: {message}")]
    Publish { message: String },

    // Persistence errors (best-effort; always logged and swallowed upstream)
    #[error("Persistence write failed: {message}")]
    Persistence { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_device_permission_denied_display() {
        let error = EngineError::DevicePermissionDenied {
            message: "microphone access rejected".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Device permission denied: microphone access rejected"
        );
    }

    #[test]
    fn test_remote_audio_unavailable_display() {
        let error = EngineError::RemoteAudioUnavailable {
            message: "no non-local participant found".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "No remote participant audio available: no non-local participant found"
        );
    }

    #[test]
    fn test_source_already_connected_display() {
        let error = EngineError::SourceAlreadyConnected {
            name: "microphone".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Audio source 'microphone' is already connected"
        );
    }

    #[test]
    fn test_transport_display() {
        let error = EngineError::Transport {
            message: "handshake failed".to_string(),
        };
        assert_eq!(error.to_string(), "Transport error: handshake failed");
    }

    #[test]
    fn test_transport_closed_display() {
        assert_eq!(
            EngineError::TransportClosed.to_string(),
            "Transport connection closed"
        );
    }

    #[test]
    fn test_malformed_message_display() {
        let error = EngineError::MalformedMessage {
            message: "unexpected token".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Malformed backend message: unexpected token"
        );
    }

    #[test]
    fn test_persistence_display() {
        let error = EngineError::Persistence {
            message: "store unreachable".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Persistence write failed: store unreachable"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: EngineError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_str = "invalid = toml = syntax";
        let toml_error = toml::from_str::<toml::Value>(toml_str).unwrap_err();
        let error: EngineError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<EngineError>();
        assert_sync::<EngineError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
