//! Real audio capture using CPAL (Cross-Platform Audio Library).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::info;

use crate::audio::{AudioSource, DeviceSources};
use crate::defaults;
use crate::error::{EngineError, Result};

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: The stream is only accessed from a single thread at a time
/// through the Mutex wrapper in CpalAudioSource. The stream methods are
/// called synchronously and don't cross thread boundaries unsafely.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Map a device error message onto the engine taxonomy.
///
/// CPAL reports OS permission rejections as generic backend errors, so the
/// classification is by message content.
fn classify_device_error(message: String) -> EngineError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        EngineError::DevicePermissionDenied { message }
    } else {
        EngineError::AudioCapture { message }
    }
}

/// Real microphone capture implementation using CPAL.
///
/// Captures 16-bit PCM mono at the configured rate. Tries the preferred
/// format first (i16/mono/target rate), then falls back to the device's
/// default config with software conversion (channel mixing + resampling).
pub struct CpalAudioSource {
    device: cpal::Device,
    stream: Arc<Mutex<Option<SendableStream>>>,
    buffer: Arc<Mutex<Vec<i16>>>,
    sample_rate: u32,
}

impl CpalAudioSource {
    /// Create a new CPAL audio source.
    ///
    /// # Arguments
    /// * `device_name` - Optional device name. If None, uses the default
    ///   input device.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        Self::with_sample_rate(device_name, defaults::SAMPLE_RATE)
    }

    pub fn with_sample_rate(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            let devices = host.input_devices().map_err(|e| EngineError::AudioCapture {
                message: format!("Failed to enumerate devices: {}", e),
            })?;

            let mut found_device = None;
            for dev in devices {
                if dev.name().map(|n| n == name).unwrap_or(false) {
                    found_device = Some(dev);
                    break;
                }
            }

            found_device.ok_or_else(|| EngineError::AudioDeviceNotFound {
                device: name.to_string(),
            })?
        } else {
            host.default_input_device()
                .ok_or_else(|| EngineError::AudioDeviceNotFound {
                    device: "default".to_string(),
                })?
        };

        Ok(Self {
            device,
            stream: Arc::new(Mutex::new(None)),
            buffer: Arc::new(Mutex::new(Vec::new())),
            sample_rate,
        })
    }

    /// Build the input stream, preferring i16/mono at the target rate and
    /// falling back to the device's native config with software conversion.
    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err| {
            tracing::warn!(error = %err, "audio stream error");
        };

        let buffer = Arc::clone(&self.buffer);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Build a stream using the device's default config, mixing channels to
    /// mono and resampling to the target rate in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| EngineError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        info!(
            channels = native_channels,
            rate = native_rate,
            "using native audio format, converting in software"
        );

        let err_callback = |err| {
            tracing::warn!(error = %err, "audio stream error");
        };

        let buffer = Arc::clone(&self.buffer);

        match default_config.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let converted =
                            convert_to_mono(data, native_channels, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| classify_device_error(format!("Failed to build i16 stream: {}", e))),
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let i16_data: Vec<i16> = data
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                            .collect();
                        let converted =
                            convert_to_mono(&i16_data, native_channels, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| classify_device_error(format!("Failed to build f32 stream: {}", e))),
            fmt => Err(EngineError::AudioCapture {
                message: format!("Unsupported native sample format: {:?}", fmt),
            }),
        }
    }
}

/// Mix multi-channel audio to mono and resample to the target rate.
fn convert_to_mono(samples: &[i16], channels: usize, source_rate: u32, target_rate: u32) -> Vec<i16> {
    let mono: Vec<i16> = if channels <= 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    resample(&mono, source_rate, target_rate)
}

/// Nearest-sample resampling, adequate for speech input.
fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let src = ((i as f64) * ratio) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        {
            let stream_guard = self.stream.lock().map_err(|e| EngineError::AudioCapture {
                message: format!("Failed to lock stream: {}", e),
            })?;
            if stream_guard.is_some() {
                return Ok(()); // Already started
            }
        }

        let stream = self.build_stream()?;
        stream
            .play()
            .map_err(|e| classify_device_error(format!("Failed to start audio stream: {}", e)))?;

        let mut stream_guard = self.stream.lock().map_err(|e| EngineError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })?;
        *stream_guard = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut stream_guard = self.stream.lock().map_err(|e| EngineError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })?;

        if let Some(sendable_stream) = stream_guard.take() {
            sendable_stream
                .0
                .pause()
                .map_err(|e| EngineError::AudioCapture {
                    message: format!("Failed to stop audio stream: {}", e),
                })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| EngineError::AudioCapture {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;

        Ok(std::mem::take(&mut *buffer))
    }
}

/// Device source provider backed by CPAL.
///
/// Screen-share/system audio is only reachable where the platform exposes a
/// loopback capture device; with no such device the acquisition fails and
/// callers proceed without it.
pub struct CpalDeviceSources {
    device: Option<String>,
    sample_rate: u32,
}

impl CpalDeviceSources {
    pub fn new(device: Option<String>, sample_rate: u32) -> Self {
        Self {
            device,
            sample_rate,
        }
    }
}

#[async_trait]
impl DeviceSources for CpalDeviceSources {
    async fn microphone(&self) -> Result<Box<dyn AudioSource>> {
        let device = self.device.clone();
        let sample_rate = self.sample_rate;
        // Device probing can block on the audio backend; keep it off the
        // async executor threads.
        let source = tokio::task::spawn_blocking(move || {
            CpalAudioSource::with_sample_rate(device.as_deref(), sample_rate)
        })
        .await
        .map_err(|e| EngineError::AudioCapture {
            message: format!("capture init task failed: {}", e),
        })??;
        Ok(Box::new(source))
    }

    async fn screen_share(&self) -> Result<Box<dyn AudioSource>> {
        Err(EngineError::AudioCapture {
            message: "no system audio loopback device available".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permission_errors() {
        match classify_device_error("Access denied by the OS".to_string()) {
            EngineError::DevicePermissionDenied { .. } => {}
            other => panic!("expected DevicePermissionDenied, got {}", other),
        }
        match classify_device_error("device busy".to_string()) {
            EngineError::AudioCapture { .. } => {}
            other => panic!("expected AudioCapture, got {}", other),
        }
    }

    #[test]
    fn test_resample_identity() {
        let samples = vec![1i16, 2, 3, 4];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_downsamples() {
        let samples: Vec<i16> = (0..48).collect();
        let out = resample(&samples, 48000, 16000);
        assert_eq!(out.len(), 16);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 3);
    }

    #[test]
    fn test_convert_to_mono_averages_channels() {
        let stereo = vec![100i16, 200, -100, 100];
        let mono = convert_to_mono(&stereo, 2, 16000, 16000);
        assert_eq!(mono, vec![150, 0]);
    }

    #[test]
    fn test_create_with_invalid_device_name() {
        match CpalAudioSource::new(Some("NonExistentDevice12345")) {
            Err(EngineError::AudioDeviceNotFound { device }) => {
                assert_eq!(device, "NonExistentDevice12345");
            }
            Err(EngineError::AudioCapture { .. }) => {
                // Device enumeration itself can fail on headless hosts.
            }
            Ok(_) => panic!("unexpected device match"),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}
