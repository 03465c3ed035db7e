//! Playback and publish-back path.
//!
//! Decoded backend audio is rendered to the right audience: in a
//! "speak to others" direction it is published into the room as an
//! outgoing audio source; in a "listen for others" direction it plays on
//! the local output device only.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::room::{PublishedTrack, RoomLayer};

/// A decoded audio buffer ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl DecodedAudio {
    /// Wall-clock length of the buffer.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Decode a synthesized audio payload.
///
/// Payloads with a RIFF header are parsed as WAV; anything else is treated
/// as raw little-endian PCM16 at `fallback_rate`.
pub fn decode_audio_payload(bytes: &[u8], fallback_rate: u32) -> Result<DecodedAudio> {
    if bytes.len() >= 4 && &bytes[..4] == b"RIFF" {
        let reader =
            hound::WavReader::new(Cursor::new(bytes)).map_err(|e| EngineError::Playback {
                message: format!("invalid WAV payload: {}", e),
            })?;
        let sample_rate = reader.spec().sample_rate;
        let samples = reader
            .into_samples::<i16>()
            .collect::<std::result::Result<Vec<i16>, _>>()
            .map_err(|e| EngineError::Playback {
                message: format!("invalid WAV samples: {}", e),
            })?;
        return Ok(DecodedAudio {
            sample_rate,
            samples,
        });
    }

    if bytes.is_empty() {
        return Err(EngineError::Playback {
            message: "empty audio payload".to_string(),
        });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(DecodedAudio {
        sample_rate: fallback_rate,
        samples,
    })
}

/// Local audio output.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Render the buffer to the local output device.
    ///
    /// Resolves when playback completes. Dropping the returned future
    /// cancels the render; skip and teardown rely on this.
    async fn play(&self, audio: DecodedAudio) -> Result<()>;
}

/// Publishes decoded audio into the room, lazily creating a single
/// outgoing track per session.
///
/// A second publish attempt while one is active reuses the existing track;
/// [`PublishBack::close`] withdraws it from the room exactly once.
#[derive(Clone)]
pub struct PublishBack {
    room: Arc<dyn RoomLayer>,
    track: Arc<tokio::sync::Mutex<Option<PublishedTrack>>>,
}

impl PublishBack {
    pub fn new(room: Arc<dyn RoomLayer>) -> Self {
        Self {
            room,
            track: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Write samples to the outgoing track, publishing it on first use.
    pub async fn write(&self, audio: &DecodedAudio) -> Result<()> {
        let mut guard = self.track.lock().await;
        if guard.is_none() {
            *guard = Some(self.room.publish_audio(audio.sample_rate).await?);
            debug!("published outgoing translation track");
        }
        if let Some(track) = guard.as_ref() {
            track
                .writer
                .send(audio.samples.clone())
                .await
                .map_err(|_| EngineError::Publish {
                    message: "outgoing track receiver dropped".to_string(),
                })?;
        }
        Ok(())
    }

    /// Withdraw the outgoing track from the room, if one was published.
    ///
    /// Idempotent: the track is taken out of the slot before the room call.
    pub async fn close(&self) -> Result<()> {
        let track = self.track.lock().await.take();
        match track {
            Some(track) => self.room.unpublish(track).await,
            None => Ok(()),
        }
    }

    pub async fn is_published(&self) -> bool {
        self.track.lock().await.is_some()
    }
}

/// Local output device playback via CPAL.
#[cfg(feature = "cpal-audio")]
pub struct DevicePlayback;

#[cfg(feature = "cpal-audio")]
#[async_trait]
impl PlaybackSink for DevicePlayback {
    async fn play(&self, audio: DecodedAudio) -> Result<()> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let duration = audio.duration();
        // cpal streams are not Send; the whole render runs on a blocking
        // thread and resolves when the buffer has played out. The stop
        // channel unblocks the thread early when this future is dropped,
        // which tears the stream down mid-render.
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let task = tokio::task::spawn_blocking(move || -> Result<()> {
            let host = cpal::default_host();
            let device =
                host.default_output_device()
                    .ok_or_else(|| EngineError::AudioDeviceNotFound {
                        device: "default output".to_string(),
                    })?;

            let config = cpal::StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(audio.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let queue = Arc::new(Mutex::new(audio.samples.into_iter()));
            let stream = device
                .build_output_stream(
                    &config,
                    move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        if let Ok(mut samples) = queue.lock() {
                            for slot in out.iter_mut() {
                                *slot = samples.next().unwrap_or(0);
                            }
                        }
                    },
                    |err| tracing::warn!(error = %err, "output stream error"),
                    None,
                )
                .map_err(|e| EngineError::Playback {
                    message: format!("failed to build output stream: {}", e),
                })?;

            stream.play().map_err(|e| EngineError::Playback {
                message: format!("failed to start output stream: {}", e),
            })?;
            // Blocks for the full render, or returns immediately once the
            // sender side is dropped (cancellation).
            let _ = stop_rx.recv_timeout(duration);
            Ok(())
        });

        let result = task.await.map_err(|e| EngineError::Playback {
            message: format!("playback task failed: {}", e),
        })?;
        drop(stop_tx);
        result
    }
}

/// Playback sink for tests: records buffers and completes after a
/// configurable delay.
pub struct MockPlayback {
    plays: Mutex<Vec<DecodedAudio>>,
    delay: Duration,
}

impl MockPlayback {
    pub fn new() -> Self {
        Self {
            plays: Mutex::new(Vec::new()),
            delay: Duration::from_millis(10),
        }
    }

    /// Simulate a long render, for skip/cancel tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn played(&self) -> Vec<DecodedAudio> {
        self.plays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockPlayback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaybackSink for MockPlayback {
    async fn play(&self, audio: DecodedAudio) -> Result<()> {
        self.plays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(audio);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
