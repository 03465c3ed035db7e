//! Audio capture and mixing.
//!
//! Sources (microphone, remote participant audio, screen-share audio) are
//! polled for 16-bit PCM samples, combined by [`AudioMix`], sliced into
//! fixed-interval chunks by the capture pump, and handed to the transport.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod mixer;
pub mod pump;

pub use mixer::AudioMix;
pub use pump::{CapturePump, PumpControl};

use async_trait::async_trait;

use crate::error::{EngineError, Result};

/// Trait for audio source devices.
///
/// This trait allows swapping implementations (real audio device, a remote
/// participant's inbound audio handle, or a mock).
pub trait AudioSource: Send {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio and release the underlying device handle.
    fn stop(&mut self) -> Result<()>;

    /// Read whatever audio samples have accumulated since the last read.
    ///
    /// # Returns
    /// Vector of 16-bit PCM audio samples; empty when nothing is pending.
    fn read_samples(&mut self) -> Result<Vec<i16>>;
}

/// Provider of locally-captured device sources.
///
/// Acquiring a device suspends until the user/OS permission prompt is
/// resolved, so both acquisitions are async.
#[async_trait]
pub trait DeviceSources: Send + Sync {
    /// Acquire the local microphone.
    ///
    /// # Errors
    /// `DevicePermissionDenied` when access is rejected; the caller must
    /// abort the capture attempt without starting transport.
    async fn microphone(&self) -> Result<Box<dyn AudioSource>>;

    /// Acquire system/screen-share audio.
    ///
    /// This source is optional: callers log a warning and proceed without
    /// it when acquisition fails.
    async fn screen_share(&self) -> Result<Box<dyn AudioSource>>;
}

/// A fixed time slice of captured audio, encoded and ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Encoded audio bytes (PCM16 little-endian by default).
    pub data: Vec<u8>,
    /// Sequence number preserving capture order.
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self { data, sequence }
    }
}

/// Encode PCM samples as little-endian bytes for upload.
pub fn encode_pcm16le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Mock audio source for testing
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    is_started: bool,
    samples: Vec<i16>,
    should_fail_start: bool,
    should_fail_read: bool,
    permission_denied: bool,
    error_message: String,
}

impl MockAudioSource {
    /// Create a new mock audio source with default settings
    pub fn new() -> Self {
        Self {
            is_started: false,
            samples: vec![0i16; 160],
            should_fail_start: false,
            should_fail_read: false,
            permission_denied: false,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Configure the mock to return specific samples on every read
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the mock to fail start with a permission error
    pub fn with_permission_denied(mut self) -> Self {
        self.should_fail_start = true;
        self.permission_denied = true;
        self
    }

    /// Check if the audio source is started
    pub fn is_started(&self) -> bool {
        self.is_started
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            if self.permission_denied {
                Err(EngineError::DevicePermissionDenied {
                    message: self.error_message.clone(),
                })
            } else {
                Err(EngineError::AudioCapture {
                    message: self.error_message.clone(),
                })
            }
        } else {
            self.is_started = true;
            Ok(())
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            Err(EngineError::AudioCapture {
                message: self.error_message.clone(),
            })
        } else {
            Ok(self.samples.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_audio_source_returns_configured_samples() {
        let test_samples = vec![100i16, 200, 300, 400, 500];
        let mut source = MockAudioSource::new().with_samples(test_samples.clone());

        let result = source.read_samples().unwrap();
        assert_eq!(result, test_samples);
    }

    #[test]
    fn test_mock_audio_source_start_stop() {
        let mut source = MockAudioSource::new();
        assert!(!source.is_started());

        source.start().unwrap();
        assert!(source.is_started());

        source.stop().unwrap();
        assert!(!source.is_started());
    }

    #[test]
    fn test_mock_audio_source_permission_denied() {
        let mut source = MockAudioSource::new().with_permission_denied();
        match source.start() {
            Err(EngineError::DevicePermissionDenied { .. }) => {}
            other => panic!("Expected DevicePermissionDenied, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_encode_pcm16le() {
        let samples = vec![0i16, 1, -1, 256];
        let bytes = encode_pcm16le(&samples);
        assert_eq!(bytes, vec![0, 0, 1, 0, 255, 255, 0, 1]);
    }

    #[test]
    fn test_encode_pcm16le_empty() {
        assert!(encode_pcm16le(&[]).is_empty());
    }
}
