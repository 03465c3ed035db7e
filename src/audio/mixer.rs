//! Combines named audio sources into a single sampled stream.

use tracing::warn;

use crate::audio::AudioSource;
use crate::error::{EngineError, Result};

struct NamedSource {
    name: String,
    source: Box<dyn AudioSource>,
    /// Samples read from this source but not yet consumed by a mix read.
    pending: Vec<i16>,
}

/// An ephemeral graph combining zero or more named audio sources into one
/// sampled output stream.
///
/// Invariants:
/// - each source name is connected at most once;
/// - disconnecting a source leaves the remaining sources connected;
/// - [`AudioMix::release`] stops every source and drops its device handle.
pub struct AudioMix {
    sources: Vec<NamedSource>,
    released: bool,
}

impl AudioMix {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            released: false,
        }
    }

    /// Connect a source under a unique name and start it.
    ///
    /// # Errors
    /// `SourceAlreadyConnected` if the name is already in the mix; the
    /// source's own start error otherwise (the source is not retained on
    /// failure).
    pub fn connect(&mut self, name: &str, mut source: Box<dyn AudioSource>) -> Result<()> {
        if self.sources.iter().any(|s| s.name == name) {
            return Err(EngineError::SourceAlreadyConnected {
                name: name.to_string(),
            });
        }
        source.start()?;
        self.sources.push(NamedSource {
            name: name.to_string(),
            source,
            pending: Vec::new(),
        });
        Ok(())
    }

    /// Disconnect and stop a single source; the rest keep flowing.
    pub fn disconnect(&mut self, name: &str) -> Result<()> {
        let index = self
            .sources
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| EngineError::AudioCapture {
                message: format!("source '{}' is not connected", name),
            })?;
        let mut removed = self.sources.remove(index);
        removed.source.stop()
    }

    /// Read and sum pending samples from every connected source.
    ///
    /// Sources produce samples at the same nominal rate but deliver them in
    /// uneven bursts, so each source keeps a small pending buffer and the
    /// mix sums only the span every source can cover. A source that errors
    /// on read contributes silence for this read.
    pub fn read_mixed(&mut self) -> Result<Vec<i16>> {
        if self.sources.is_empty() {
            return Ok(Vec::new());
        }

        let mut first_read_err = None;
        let mut failed_reads = 0usize;
        for entry in &mut self.sources {
            match entry.source.read_samples() {
                Ok(samples) => entry.pending.extend(samples),
                Err(e) => {
                    warn!(source = %entry.name, error = %e, "audio source read failed");
                    failed_reads += 1;
                    if first_read_err.is_none() {
                        first_read_err = Some(e);
                    }
                }
            }
        }

        // One dead source stays silent; the whole mix failing is a capture
        // error the caller must see.
        if failed_reads == self.sources.len() {
            if let Some(e) = first_read_err {
                return Err(e);
            }
        }

        // Single source: pass through without summing.
        if self.sources.len() == 1 {
            return Ok(std::mem::take(&mut self.sources[0].pending));
        }

        // With several sources, mix only what every non-empty source can
        // cover; a source with nothing pending this round is silent.
        let span = self
            .sources
            .iter()
            .filter(|s| !s.pending.is_empty())
            .map(|s| s.pending.len())
            .min()
            .unwrap_or(0);
        if span == 0 {
            return Ok(Vec::new());
        }

        let mut mixed = vec![0i32; span];
        for entry in &mut self.sources {
            if entry.pending.is_empty() {
                continue;
            }
            let take = span.min(entry.pending.len());
            for (acc, sample) in mixed.iter_mut().zip(entry.pending.drain(..take)) {
                *acc += sample as i32;
            }
        }

        Ok(mixed
            .into_iter()
            .map(|s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect())
    }

    /// Stop every source and release all device handles.
    ///
    /// Safe to call more than once; subsequent calls are no-ops.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let mut first_err = None;
        for entry in &mut self.sources {
            if let Err(e) = entry.source.stop() {
                warn!(source = %entry.name, error = %e, "failed to stop audio source");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        self.sources.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Names of the currently connected sources, in connection order.
    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }
}

impl Default for AudioMix {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioMix {
    fn drop(&mut self) {
        // Last line of defense; owners call release() explicitly.
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockAudioSource;

    #[test]
    fn test_connect_starts_source() {
        let mut mix = AudioMix::new();
        mix.connect("microphone", Box::new(MockAudioSource::new()))
            .unwrap();
        assert_eq!(mix.source_count(), 1);
        assert_eq!(mix.source_names(), vec!["microphone".to_string()]);
    }

    #[test]
    fn test_connect_duplicate_name_rejected() {
        let mut mix = AudioMix::new();
        mix.connect("microphone", Box::new(MockAudioSource::new()))
            .unwrap();
        let err = mix
            .connect("microphone", Box::new(MockAudioSource::new()))
            .unwrap_err();
        match err {
            EngineError::SourceAlreadyConnected { name } => assert_eq!(name, "microphone"),
            other => panic!("Expected SourceAlreadyConnected, got {}", other),
        }
        assert_eq!(mix.source_count(), 1);
    }

    #[test]
    fn test_connect_failed_start_not_retained() {
        let mut mix = AudioMix::new();
        let result = mix.connect(
            "microphone",
            Box::new(MockAudioSource::new().with_permission_denied()),
        );
        assert!(result.is_err());
        assert!(mix.is_empty());
    }

    #[test]
    fn test_disconnect_leaves_other_sources() {
        let mut mix = AudioMix::new();
        mix.connect("microphone", Box::new(MockAudioSource::new()))
            .unwrap();
        mix.connect("remote:alice", Box::new(MockAudioSource::new()))
            .unwrap();

        mix.disconnect("microphone").unwrap();
        assert_eq!(mix.source_names(), vec!["remote:alice".to_string()]);

        // The remaining source still produces samples.
        let samples = mix.read_mixed().unwrap();
        assert!(!samples.is_empty());
    }

    #[test]
    fn test_disconnect_unknown_source_is_error() {
        let mut mix = AudioMix::new();
        assert!(mix.disconnect("ghost").is_err());
    }

    #[test]
    fn test_read_mixed_single_source_passthrough() {
        let mut mix = AudioMix::new();
        mix.connect(
            "microphone",
            Box::new(MockAudioSource::new().with_samples(vec![10, 20, 30])),
        )
        .unwrap();

        assert_eq!(mix.read_mixed().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_read_mixed_sums_sources() {
        let mut mix = AudioMix::new();
        mix.connect(
            "microphone",
            Box::new(MockAudioSource::new().with_samples(vec![100, 100])),
        )
        .unwrap();
        mix.connect(
            "remote:bob",
            Box::new(MockAudioSource::new().with_samples(vec![25, -50])),
        )
        .unwrap();

        assert_eq!(mix.read_mixed().unwrap(), vec![125, 50]);
    }

    #[test]
    fn test_read_mixed_clamps_overflow() {
        let mut mix = AudioMix::new();
        mix.connect(
            "a",
            Box::new(MockAudioSource::new().with_samples(vec![i16::MAX])),
        )
        .unwrap();
        mix.connect(
            "b",
            Box::new(MockAudioSource::new().with_samples(vec![i16::MAX])),
        )
        .unwrap();

        assert_eq!(mix.read_mixed().unwrap(), vec![i16::MAX]);
    }

    #[test]
    fn test_read_mixed_failing_source_is_silent() {
        let mut mix = AudioMix::new();
        mix.connect(
            "microphone",
            Box::new(MockAudioSource::new().with_samples(vec![7, 7])),
        )
        .unwrap();
        mix.connect("broken", Box::new(MockAudioSource::new().with_read_failure()))
            .unwrap();

        // The failing source contributes nothing; the healthy one flows.
        assert_eq!(mix.read_mixed().unwrap(), vec![7, 7]);
    }

    #[test]
    fn test_read_mixed_all_sources_failing_is_error() {
        let mut mix = AudioMix::new();
        mix.connect("broken", Box::new(MockAudioSource::new().with_read_failure()))
            .unwrap();
        assert!(mix.read_mixed().is_err());
    }

    #[test]
    fn test_read_mixed_empty_mix() {
        let mut mix = AudioMix::new();
        assert!(mix.read_mixed().unwrap().is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut mix = AudioMix::new();
        mix.connect("microphone", Box::new(MockAudioSource::new()))
            .unwrap();

        mix.release().unwrap();
        assert!(mix.is_empty());
        mix.release().unwrap();
        assert!(mix.is_empty());
    }
}
