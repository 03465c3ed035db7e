//! Caption buffer and incremental renderer.

pub mod renderer;

pub use renderer::{CaptionRenderer, RevealTiming};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One transcript fragment.
///
/// Interim segments (`is_final == false`) are superseded in display by a
/// newer interim with the same semantic utterance; segments are otherwise
/// immutable once created. Full history lives in the external store — only
/// a bounded window of recent finals is retained for display.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub id: String,
    pub text: String,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptSegment {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            is_final,
            timestamp: Utc::now(),
        }
    }

    /// A finalized segment with a fresh id and timestamp.
    pub fn finalized(text: impl Into<String>) -> Self {
        Self::new(text, true)
    }
}

/// Push a finalized segment onto a retention buffer, evicting the oldest
/// entries beyond `retain`.
pub fn retain_recent(buffer: &mut Vec<TranscriptSegment>, segment: TranscriptSegment, retain: usize) {
    buffer.push(segment);
    if buffer.len() > retain {
        let overflow = buffer.len() - retain;
        buffer.drain(..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_ids_are_unique() {
        let a = TranscriptSegment::finalized("one");
        let b = TranscriptSegment::finalized("two");
        assert_ne!(a.id, b.id);
        assert!(a.is_final);
    }

    #[test]
    fn test_retain_recent_evicts_oldest_first() {
        let mut buffer = Vec::new();
        for i in 0..5 {
            retain_recent(&mut buffer, TranscriptSegment::finalized(format!("s{i}")), 3);
        }
        let texts: Vec<&str> = buffer.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["s2", "s3", "s4"]);
    }
}
