//! Audio data shapes shared across the voice pipeline

use std::time::Duration;

/// Sample rate of captured microphone frames (16kHz for speech)
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Samples per captured frame
pub const CAPTURE_FRAME_SIZE: usize = 4096;

/// Sample rate the live model speaks at when the payload carries no rate
pub const REMOTE_OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Mime prefix for raw little-endian 16-bit PCM
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// One block of captured samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    /// Create a mono frame
    #[must_use]
    pub const fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Wall-clock length of the frame
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() / usize::from(self.channels);
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }

    /// Root-mean-square energy over every sample in the frame
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Calculate RMS energy
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Base64-wrapped PCM payload tagged with its format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

impl EncodedChunk {
    /// Build a PCM chunk with an explicit rate tag, e.g. `audio/pcm;rate=16000`
    #[must_use]
    pub fn pcm(data: String, sample_rate: u32) -> Self {
        Self {
            data,
            mime_type: format!("{PCM_MIME_PREFIX};rate={sample_rate}"),
        }
    }

    /// Sample rate declared in the mime tag, if any
    #[must_use]
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
            .and_then(|(_, value)| value.trim().parse().ok())
    }
}

/// Decoded, playback-ready audio
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    /// Interleaved samples
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackBuffer {
    /// Number of sample frames (one sample per channel)
    #[must_use]
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / usize::from(self.channels)
    }

    /// Duration in seconds on the playback timeline
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Samples of one channel, de-interleaved
    #[must_use]
    pub fn channel(&self, index: u16) -> Vec<f32> {
        let channels = usize::from(self.channels.max(1));
        self.samples
            .iter()
            .skip(usize::from(index))
            .step_by(channels)
            .copied()
            .collect()
    }
}
