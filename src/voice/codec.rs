//! PCM transport codec
//!
//! Outbound frames become base64-wrapped little-endian 16-bit PCM; inbound
//! payloads are turned back into playback buffers at the sink's rate.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::audio::{AudioFrame, EncodedChunk, PlaybackBuffer, REMOTE_OUTPUT_SAMPLE_RATE};
use crate::{Error, Result};

/// Full-scale magnitude of a 16-bit sample
const PCM_SCALE: f32 = 32768.0;

/// Encode a captured frame for transmission
#[must_use]
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    EncodedChunk::pcm(STANDARD.encode(bytes), frame.sample_rate)
}

/// Decode a received chunk into a buffer at the target rate and channel count
///
/// The payload is read as interleaved `target_channels` PCM at the rate named
/// in its mime tag (24kHz when untagged) and linearly resampled when that
/// differs from `target_sample_rate`.
///
/// # Errors
///
/// Returns [`Error::Decode`] for empty, non-base64 or truncated payloads
pub fn decode(
    chunk: &EncodedChunk,
    target_sample_rate: u32,
    target_channels: u16,
) -> Result<PlaybackBuffer> {
    if chunk.data.is_empty() {
        return Err(Error::Decode("empty audio payload".to_string()));
    }
    if target_sample_rate == 0 || target_channels == 0 {
        return Err(Error::Decode(format!(
            "invalid target format {target_sample_rate} Hz x {target_channels}"
        )));
    }

    let bytes = STANDARD
        .decode(chunk.data.trim())
        .map_err(|e| Error::Decode(format!("invalid base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(Error::Decode(format!(
            "odd payload length {} for 16-bit PCM",
            bytes.len()
        )));
    }

    let pcm: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM_SCALE)
        .collect();

    let channels = usize::from(target_channels);
    let frames = pcm.len() / channels;
    if frames == 0 {
        return Err(Error::Decode("payload holds no complete frame".to_string()));
    }

    let source_rate = chunk.sample_rate().unwrap_or(REMOTE_OUTPUT_SAMPLE_RATE);
    if source_rate == 0 {
        return Err(Error::Decode("payload declares a zero sample rate".to_string()));
    }

    let samples = if source_rate == target_sample_rate {
        pcm[..frames * channels].to_vec()
    } else {
        let resampled: Vec<Vec<f32>> = (0..channels)
            .map(|c| {
                let lane: Vec<f32> = pcm[..frames * channels]
                    .iter()
                    .skip(c)
                    .step_by(channels)
                    .copied()
                    .collect();
                resample_linear(&lane, source_rate, target_sample_rate)
            })
            .collect();
        interleave(&resampled)
    };

    Ok(PlaybackBuffer {
        samples,
        sample_rate: target_sample_rate,
        channels: target_channels,
    })
}

/// Resample one channel by linear interpolation
///
/// Output length is `round(len * to / from)`, so duration is preserved.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() || from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }

    let out_len = ((input.len() as f64 * f64::from(to_rate)) / f64::from(from_rate)).round();
    let out_len = (out_len as usize).max(1);
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let frac = (position - index as f64) as f32;
            let a = input[index];
            let b = input[(index + 1).min(last)];
            (b - a).mul_add(frac, a)
        })
        .collect()
}

/// Convert f32 samples to mono WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(quantize(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Clamp to [-1, 1] and scale onto the signed 16-bit range
#[allow(clippy::cast_possible_truncation)]
fn quantize(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (clamped * PCM_SCALE).round().clamp(-PCM_SCALE, PCM_SCALE - 1.0) as i16
}

fn interleave(lanes: &[Vec<f32>]) -> Vec<f32> {
    let frames = lanes.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * lanes.len());
    for i in 0..frames {
        for lane in lanes {
            out.push(lane[i]);
        }
    }
    out
}
