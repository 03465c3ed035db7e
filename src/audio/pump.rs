//! Capture pump: slices the mixed stream into fixed-interval upload chunks.
//!
//! The pump owns the [`AudioMix`] for the lifetime of a session. Pausing
//! keeps the devices hot (samples are read and discarded) so capture can
//! resume without re-acquiring hardware; shutdown releases every handle
//! exactly once.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::{encode_pcm16le, AudioChunk, AudioMix};
use crate::error::{EngineError, Result};

enum PumpCommand {
    Pause,
    Resume,
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Cloneable control handle for a running pump.
#[derive(Clone)]
pub struct PumpControl {
    cmd_tx: mpsc::Sender<PumpCommand>,
}

impl PumpControl {
    /// Pause chunk emission without stopping capture.
    pub async fn pause(&self) {
        let _ = self.cmd_tx.send(PumpCommand::Pause).await;
    }

    /// Resume chunk emission.
    pub async fn resume(&self) {
        let _ = self.cmd_tx.send(PumpCommand::Resume).await;
    }
}

/// A running capture pump.
pub struct CapturePump {
    control: PumpControl,
    task: JoinHandle<()>,
}

impl CapturePump {
    /// Spawn the pump over an acquired mix.
    ///
    /// Chunks are emitted on `chunk_tx` in capture order every `interval`.
    pub fn spawn(mix: AudioMix, interval: Duration, chunk_tx: mpsc::Sender<AudioChunk>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(run_pump(mix, interval, chunk_tx, cmd_rx));
        Self {
            control: PumpControl { cmd_tx },
            task,
        }
    }

    /// Control handle usable from the session consumer loop.
    pub fn control(&self) -> PumpControl {
        self.control.clone()
    }

    /// Stop the pump and release the mix.
    ///
    /// Resolves only after every source in the mix has been stopped, so a
    /// follow-up session never races the old one for a device handle.
    pub async fn shutdown(self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .control
            .cmd_tx
            .send(PumpCommand::Shutdown(ack_tx))
            .await
            .is_err()
        {
            // Pump already exited (channel closed on its own teardown).
            self.task.abort();
            return Ok(());
        }
        let result = match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::AudioCapture {
                message: "capture pump exited before acknowledging shutdown".to_string(),
            }),
        };
        self.task.abort();
        result
    }
}

async fn run_pump(
    mut mix: AudioMix,
    interval: Duration,
    chunk_tx: mpsc::Sender<AudioChunk>,
    mut cmd_rx: mpsc::Receiver<PumpCommand>,
) {
    const MAX_CONSECUTIVE_ERRORS: u32 = 10;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut paused = false;
    let mut sequence: u64 = 0;
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PumpCommand::Pause) => paused = true,
                Some(PumpCommand::Resume) => paused = false,
                Some(PumpCommand::Shutdown(ack)) => {
                    let _ = ack.send(mix.release());
                    return;
                }
                None => {
                    let _ = mix.release();
                    return;
                }
            },
            _ = ticker.tick() => {
                let samples = match mix.read_mixed() {
                    Ok(samples) => {
                        consecutive_errors = 0;
                        samples
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            warn!(error = %e, "capture failed {consecutive_errors} times in a row, stopping pump");
                            let _ = mix.release();
                            return;
                        }
                        continue;
                    }
                };

                // While paused the devices are still drained so buffers do
                // not grow, but nothing is uploaded.
                if paused || samples.is_empty() {
                    continue;
                }

                let chunk = AudioChunk::new(encode_pcm16le(&samples), sequence);
                sequence += 1;

                if chunk_tx.send(chunk).await.is_err() {
                    debug!("chunk receiver dropped, stopping pump");
                    let _ = mix.release();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockAudioSource;

    fn mix_with_samples(samples: Vec<i16>) -> AudioMix {
        let mut mix = AudioMix::new();
        mix.connect(
            "microphone",
            Box::new(MockAudioSource::new().with_samples(samples)),
        )
        .unwrap();
        mix
    }

    #[tokio::test]
    async fn test_pump_emits_chunks_in_capture_order() {
        let mix = mix_with_samples(vec![1, 2, 3]);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let pump = CapturePump::spawn(mix, Duration::from_millis(5), chunk_tx);

        let first = chunk_rx.recv().await.expect("first chunk");
        let second = chunk_rx.recv().await.expect("second chunk");
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.data, encode_pcm16le(&[1, 2, 3]));

        pump.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_suppresses_chunks_resume_restores() {
        let mix = mix_with_samples(vec![5; 8]);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(64);
        let pump = CapturePump::spawn(mix, Duration::from_millis(5), chunk_tx);
        let control = pump.control();

        // Let at least one chunk through, then pause.
        let _ = chunk_rx.recv().await.expect("chunk before pause");
        control.pause().await;

        // Drain anything emitted before the pause landed, then verify
        // silence while paused.
        tokio::time::sleep(Duration::from_millis(30)).await;
        while chunk_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(chunk_rx.try_recv().is_err(), "paused pump must not emit");

        control.resume().await;
        let resumed = tokio::time::timeout(Duration::from_millis(500), chunk_rx.recv())
            .await
            .expect("resume timed out")
            .expect("chunk after resume");
        assert!(!resumed.data.is_empty());

        pump.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_mix() {
        let mix = mix_with_samples(vec![1]);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let pump = CapturePump::spawn(mix, Duration::from_millis(5), chunk_tx);

        pump.shutdown().await.unwrap();

        // After shutdown the channel eventually closes and no new chunks
        // arrive past the ones already in flight.
        while chunk_rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_pump_stops_when_receiver_dropped() {
        let mix = mix_with_samples(vec![1]);
        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        let pump = CapturePump::spawn(mix, Duration::from_millis(5), chunk_tx);

        drop(chunk_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Shutdown still resolves cleanly after the pump exited on its own.
        pump.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_exits_after_repeated_read_errors() {
        let mut mix = AudioMix::new();
        mix.connect(
            "broken",
            Box::new(MockAudioSource::new().with_read_failure()),
        )
        .unwrap();

        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let pump = CapturePump::spawn(mix, Duration::from_millis(2), chunk_tx);

        // All reads fail, so the channel closes without a single chunk.
        assert!(chunk_rx.recv().await.is_none());
        pump.shutdown().await.unwrap();
    }
}
