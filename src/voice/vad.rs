//! Energy-based voice activity detection
//!
//! A frame whose RMS exceeds the threshold reports `Speaking` at once and
//! (re)arms a short hold timer. The signal only drops back to `Silent` when
//! that timer lapses, so natural pauses between words do not flicker.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::audio::rms;

/// RMS level above which a frame counts as speech
pub const DEFAULT_SPEECH_THRESHOLD: f32 = 0.015;

/// How long `Speaking` is held after the last loud frame
pub const DEFAULT_SPEECH_HOLD: Duration = Duration::from_millis(150);

/// Debounced speaking indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceSignal {
    Speaking,
    Silent,
}

/// Debounced speech detector
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f32,
    hold: Duration,
    hold_until: Option<Instant>,
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SPEECH_THRESHOLD, DEFAULT_SPEECH_HOLD)
    }
}

impl VoiceActivityDetector {
    /// Create a detector with an explicit threshold and hold time
    #[must_use]
    pub const fn new(threshold: f32, hold: Duration) -> Self {
        Self {
            threshold,
            hold,
            hold_until: None,
        }
    }

    /// Classify one frame observed at `now`
    pub fn observe(&mut self, samples: &[f32], now: Instant) -> VoiceSignal {
        let energy = rms(samples);
        if energy > self.threshold {
            self.hold_until = Some(now + self.hold);
            tracing::trace!(energy, "speech frame");
            return VoiceSignal::Speaking;
        }
        self.signal_at(now)
    }

    /// Signal as of `now` without feeding a frame
    #[must_use]
    pub fn signal_at(&self, now: Instant) -> VoiceSignal {
        match self.hold_until {
            Some(until) if now < until => VoiceSignal::Speaking,
            _ => VoiceSignal::Silent,
        }
    }

    /// When the hold timer lapses, if armed
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.hold_until
    }

    /// Disarm a lapsed hold timer
    ///
    /// Returns `Some(Silent)` exactly once per speech burst: the first call at
    /// or after the deadline.
    pub fn expire(&mut self, now: Instant) -> Option<VoiceSignal> {
        match self.hold_until {
            Some(until) if now >= until => {
                self.hold_until = None;
                Some(VoiceSignal::Silent)
            }
            _ => None,
        }
    }

    /// Forget any pending hold
    pub const fn reset(&mut self) {
        self.hold_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud() -> Vec<f32> {
        vec![0.2; 320]
    }

    fn quiet() -> Vec<f32> {
        vec![0.001; 320]
    }

    #[test]
    fn test_silence_stays_silent() {
        let mut vad = VoiceActivityDetector::default();
        let now = Instant::now();
        assert_eq!(vad.observe(&quiet(), now), VoiceSignal::Silent);
        assert_eq!(vad.deadline(), None);
        assert_eq!(vad.expire(now + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_speech_is_immediate_and_held() {
        let mut vad = VoiceActivityDetector::default();
        let t0 = Instant::now();

        assert_eq!(vad.observe(&loud(), t0), VoiceSignal::Speaking);
        assert_eq!(vad.deadline(), Some(t0 + DEFAULT_SPEECH_HOLD));
        assert_eq!(
            vad.observe(&quiet(), t0 + Duration::from_millis(100)),
            VoiceSignal::Speaking
        );
        assert_eq!(
            vad.observe(&quiet(), t0 + Duration::from_millis(151)),
            VoiceSignal::Silent
        );
    }

    #[test]
    fn test_single_burst_yields_one_silent_transition() {
        let mut vad = VoiceActivityDetector::default();
        let t0 = Instant::now();
        let mut transitions = 0;

        vad.observe(&loud(), t0);
        for ms in (20..=200).step_by(20) {
            let now = t0 + Duration::from_millis(ms);
            if vad.expire(now).is_some() {
                transitions += 1;
            }
            vad.observe(&quiet(), now);
        }

        assert_eq!(transitions, 1);
        assert_eq!(vad.deadline(), None);
    }

    #[test]
    fn test_continued_speech_extends_hold() {
        let mut vad = VoiceActivityDetector::default();
        let t0 = Instant::now();

        vad.observe(&loud(), t0);
        vad.observe(&loud(), t0 + Duration::from_millis(100));

        assert_eq!(vad.expire(t0 + Duration::from_millis(200)), None);
        assert_eq!(
            vad.expire(t0 + Duration::from_millis(250)),
            Some(VoiceSignal::Silent)
        );
    }
}
