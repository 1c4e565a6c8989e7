//! Energy-based utterance segmentation
//!
//! Cuts the 16kHz capture stream into utterances worth transcribing: enough
//! voiced audio followed by a stretch of silence. Bursts too short to be
//! speech are dropped once the silence runs long.

use super::audio::{CAPTURE_SAMPLE_RATE, rms};

/// Minimum audio energy to consider speech
pub const SEGMENT_ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum voiced audio for an utterance (0.3 seconds)
const MIN_SPEECH_SAMPLES: usize = CAPTURE_SAMPLE_RATE as usize * 3 / 10;

/// Silence that ends an utterance (0.5 seconds)
const SILENCE_SAMPLES: usize = CAPTURE_SAMPLE_RATE as usize / 2;

/// Longest utterance kept before it is cut regardless of silence
const MAX_UTTERANCE_SAMPLES: usize = CAPTURE_SAMPLE_RATE as usize * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmenterState {
    Idle,
    Collecting,
}

/// Splits a mono sample stream into utterances
#[derive(Debug)]
pub struct SpeechSegmenter {
    threshold: f32,
    state: SegmenterState,
    buffer: Vec<f32>,
    voiced: usize,
    silence: usize,
}

impl Default for SpeechSegmenter {
    fn default() -> Self {
        Self::new(SEGMENT_ENERGY_THRESHOLD)
    }
}

impl SpeechSegmenter {
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self {
            threshold,
            state: SegmenterState::Idle,
            buffer: Vec::new(),
            voiced: 0,
            silence: 0,
        }
    }

    /// Feed one block; returns a finished utterance when one completes
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let energy = rms(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Collecting;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.voiced = samples.len();
                    self.silence = 0;
                    tracing::trace!(energy, "speech started");
                }
                None
            }
            SegmenterState::Collecting => {
                self.buffer.extend_from_slice(samples);
                if is_speech {
                    self.voiced += samples.len();
                    self.silence = 0;
                } else {
                    self.silence += samples.len();
                }

                let long_enough = self.voiced >= MIN_SPEECH_SAMPLES;
                if long_enough
                    && (self.silence >= SILENCE_SAMPLES
                        || self.buffer.len() >= MAX_UTTERANCE_SAMPLES)
                {
                    tracing::debug!(samples = self.buffer.len(), "utterance complete");
                    let utterance = std::mem::take(&mut self.buffer);
                    self.reset();
                    return Some(utterance);
                }

                if !long_enough && self.silence >= SILENCE_SAMPLES {
                    tracing::trace!("speech burst too short, discarding");
                    self.reset();
                }
                None
            }
        }
    }

    /// Whether speech is currently being collected
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.state == SegmenterState::Collecting
    }

    /// Hand over the utterance being collected if it already holds enough speech
    ///
    /// Used when the stream stops mid-utterance. Leaves the segmenter idle.
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        let utterance = (self.state == SegmenterState::Collecting
            && self.voiced >= MIN_SPEECH_SAMPLES)
            .then(|| std::mem::take(&mut self.buffer));
        self.reset();
        utterance
    }

    /// Drop any partial utterance
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.buffer.clear();
        self.voiced = 0;
        self.silence = 0;
    }
}
