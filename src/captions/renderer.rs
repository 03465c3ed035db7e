//! Incremental caption renderer.
//!
//! Captions are revealed character by character rather than flashed whole,
//! with one hard rule: a recognizer self-correction snaps instantly.
//! Animating a deletion looks wrong to a user, so any upstream text that is
//! not a pure extension of what is already on screen replaces it outright.

use std::collections::VecDeque;
use std::time::Duration;

use crate::captions::TranscriptSegment;
use crate::defaults;

/// Timing profile for the reveal loop.
#[derive(Debug, Clone)]
pub struct RevealTiming {
    /// Delay between characters at normal pace.
    pub base_delay: Duration,
    /// Delay while the unrevealed backlog is above the threshold.
    pub fast_delay: Duration,
    /// Backlog size (characters) at which the fast delay kicks in.
    pub backlog_threshold: usize,
    /// Pause after a sentence-ending character.
    pub sentence_pause: Duration,
    /// Poll interval while there is nothing to reveal.
    pub idle_poll: Duration,
}

impl Default for RevealTiming {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::REVEAL_BASE_DELAY_MS),
            fast_delay: Duration::from_millis(defaults::REVEAL_FAST_DELAY_MS),
            backlog_threshold: defaults::REVEAL_BACKLOG_THRESHOLD,
            sentence_pause: Duration::from_millis(defaults::REVEAL_SENTENCE_PAUSE_MS),
            idle_poll: Duration::from_millis(defaults::REVEAL_IDLE_POLL_MS),
        }
    }
}

/// Sliding window of recent finalized segments plus one in-progress segment
/// revealed incrementally.
///
/// Purely a presentation concern: it consumes `(text, is_final)` updates
/// and a toggle command, and performs no I/O of its own.
pub struct CaptionRenderer {
    visible: bool,
    timing: RevealTiming,
    window_size: usize,
    window: VecDeque<TranscriptSegment>,
    /// Upstream text for the current segment.
    target: String,
    /// Number of characters of `target` currently on screen.
    revealed: usize,
}

impl CaptionRenderer {
    pub fn new(window_size: usize, timing: RevealTiming) -> Self {
        Self {
            visible: false,
            timing,
            window_size,
            window: VecDeque::new(),
            target: String::new(),
            revealed: 0,
        }
    }

    /// Apply an upstream update for the current segment.
    ///
    /// A final update moves the segment into the window (evicting the
    /// oldest entry when full) and clears the current slot. An interim
    /// update either extends the animation or, when the new text does not
    /// extend what is already displayed, snaps to it immediately.
    pub fn apply(&mut self, text: &str, is_final: bool) {
        if is_final {
            self.window.push_back(TranscriptSegment::finalized(text));
            while self.window.len() > self.window_size {
                self.window.pop_front();
            }
            self.target.clear();
            self.revealed = 0;
            return;
        }

        let shown = self.displayed();
        if text.starts_with(shown.as_str()) {
            // Pure extension: keep the revealed prefix, animate the rest.
            self.target = text.to_string();
        } else {
            // Correction: snap, no animation.
            self.target = text.to_string();
            self.revealed = self.target.chars().count();
        }
    }

    /// Reveal at most one character and return the delay until the next
    /// tick.
    pub fn tick(&mut self) -> Duration {
        let total = self.target.chars().count();
        if !self.visible || self.revealed >= total {
            return self.timing.idle_poll;
        }

        self.revealed += 1;
        let revealed_char = self
            .target
            .chars()
            .nth(self.revealed - 1)
            .unwrap_or(' ');
        let backlog = total - self.revealed;

        if matches!(revealed_char, '.' | '!' | '?') {
            self.timing.sentence_pause
        } else if backlog > self.timing.backlog_threshold {
            self.timing.fast_delay
        } else {
            self.timing.base_delay
        }
    }

    /// The currently displayed portion of the in-progress segment.
    pub fn displayed(&self) -> String {
        self.target.chars().take(self.revealed).collect()
    }

    /// Finalized segments currently in the display window, oldest first.
    pub fn window(&self) -> Vec<TranscriptSegment> {
        self.window.iter().cloned().collect()
    }

    /// Show or hide the overlay. Returns the new visibility.
    pub fn toggle(&mut self) -> bool {
        self.visible = !self.visible;
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// True when every character of the current segment is on screen.
    pub fn caught_up(&self) -> bool {
        self.revealed >= self.target.chars().count()
    }

    /// Drop all display state (used on session teardown).
    pub fn clear(&mut self) {
        self.window.clear();
        self.target.clear();
        self.revealed = 0;
    }
}
