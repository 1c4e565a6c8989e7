//! Audio playback to speakers
//!
//! The sink counts every frame it hands to the device, which gives a sample
//! accurate clock. Scheduled buffers are mixed in at their start frame and
//! reported back once their last frame has been played.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::audio::PlaybackBuffer;
use super::device::{BufferId, PlaybackSink};
use crate::settings::{AudioSettings, DEFAULT_OUTPUT_DEVICE};
use crate::{Error, Result};

/// A buffer placed on the device timeline
struct Voice {
    id: BufferId,
    start_frame: u64,
    buffer: PlaybackBuffer,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }

    /// Sample for output channel `channel` at device frame `frame`
    #[allow(clippy::cast_precision_loss)]
    fn sample(&self, frame: u64, channel: usize, out_channels: usize) -> f32 {
        let Ok(offset) = usize::try_from(frame - self.start_frame) else {
            return 0.0;
        };
        let in_channels = usize::from(self.buffer.channels.max(1));
        let base = offset * in_channels;

        if in_channels == out_channels {
            return self.buffer.samples.get(base + channel).copied().unwrap_or(0.0);
        }
        if in_channels == 1 {
            return self.buffer.samples.get(base).copied().unwrap_or(0.0);
        }
        // Fold extra source channels down when the device has fewer
        if out_channels == 1 {
            let lanes = &self.buffer.samples[base..(base + in_channels).min(self.buffer.samples.len())];
            return lanes.iter().sum::<f32>() / in_channels as f32;
        }
        self.buffer
            .samples
            .get(base + channel.min(in_channels - 1))
            .copied()
            .unwrap_or(0.0)
    }
}

/// State shared with the output callback
struct Mixer {
    frames_played: u64,
    voices: Vec<Voice>,
    completions: mpsc::UnboundedSender<BufferId>,
}

impl Mixer {
    fn render(&mut self, data: &mut [f32], channels: usize) {
        for out in data.chunks_mut(channels) {
            let frame = self.frames_played;
            for (c, slot) in out.iter_mut().enumerate() {
                *slot = self
                    .voices
                    .iter()
                    .filter(|v| v.start_frame <= frame && frame < v.end_frame())
                    .map(|v| v.sample(frame, c, channels))
                    .sum::<f32>()
                    .clamp(-1.0, 1.0);
            }
            self.frames_played += 1;
        }

        let played = self.frames_played;
        let completions = &self.completions;
        self.voices.retain(|v| {
            if v.end_frame() <= played {
                let _ = completions.send(v.id);
                false
            } else {
                true
            }
        });
    }
}

/// Plays scheduled buffers on the selected output device
pub struct CpalSink {
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
    stream: Option<Stream>,
    fallback: Option<Error>,
}

impl CpalSink {
    /// Open the sink named in `settings`, falling back to the default output
    ///
    /// # Errors
    ///
    /// Returns error if no output device or config can be opened
    pub fn open(
        settings: &AudioSettings,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Self> {
        let (device, fallback) = match select_output_device(&settings.output_device_id) {
            Ok(device) => (device, None),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    requested = %settings.output_device_id,
                    "falling back to default output"
                );
                let device = cpal::default_host()
                    .default_output_device()
                    .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
                (device, Some(e))
            }
        };

        let config = output_config(&device, settings)?;
        let channels = usize::from(config.channels);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = settings.sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        let mixer = Arc::new(Mutex::new(Mixer {
            frames_played: 0,
            voices: Vec::new(),
            completions,
        }));
        let mixer_clone = Arc::clone(&mixer);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Ok(mut mixer) = mixer_clone.lock() {
                        mixer.render(data, channels);
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Self {
            mixer,
            sample_rate: settings.sample_rate,
            stream: Some(stream),
            fallback,
        })
    }
}

/// Find an output device by name
///
/// # Errors
///
/// Returns [`Error::Device`] if the named sink is not present
fn select_output_device(id: &str) -> Result<Device> {
    let host = cpal::default_host();

    if id == DEFAULT_OUTPUT_DEVICE {
        return host
            .default_output_device()
            .ok_or_else(|| Error::Device("no default output device".to_string()));
    }

    host.output_devices()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|d| d.name().is_ok_and(|name| name == id))
        .ok_or_else(|| Error::Device(format!("output device {id:?} not found")))
}

fn output_config(device: &Device, settings: &AudioSettings) -> Result<StreamConfig> {
    let rate = SampleRate(settings.sample_rate);
    let supports = |channels: u16| {
        device.supported_output_configs().ok().and_then(|mut configs| {
            configs.find(|c| {
                c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        })
    };

    let supported = supports(settings.channel_count)
        .or_else(|| {
            // Fallback: the other layout, mixer adapts channel counts
            supports(if settings.channel_count == 1 { 2 } else { 1 })
        })
        .ok_or_else(|| {
            Error::Audio(format!(
                "no output config at {} Hz on this device",
                settings.sample_rate
            ))
        })?;

    Ok(supported.with_sample_rate(rate).config())
}

impl PlaybackSink for CpalSink {
    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        let frames = self.mixer.lock().map(|m| m.frames_played).unwrap_or(0);
        frames as f64 / f64::from(self.sample_rate)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn start(&mut self, id: BufferId, buffer: PlaybackBuffer, at: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::Audio("playback sink closed".to_string()));
        }
        let start_frame = (at.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| Error::Audio("playback mixer poisoned".to_string()))?;
        mixer.voices.push(Voice {
            id,
            start_frame,
            buffer,
        });
        Ok(())
    }

    fn stop(&mut self, id: BufferId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.voices.retain(|v| v.id != id);
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            if let Ok(mut mixer) = self.mixer.lock() {
                mixer.voices.clear();
            }
            tracing::debug!("audio playback closed");
        }
    }

    fn take_fallback(&mut self) -> Option<Error> {
        self.fallback.take()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer() -> (Mixer, mpsc::UnboundedReceiver<BufferId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Mixer {
                frames_played: 0,
                voices: Vec::new(),
                completions: tx,
            },
            rx,
        )
    }

    fn voice(id: BufferId, start_frame: u64, samples: Vec<f32>, channels: u16) -> Voice {
        Voice {
            id,
            start_frame,
            buffer: PlaybackBuffer {
                samples,
                sample_rate: 10,
                channels,
            },
        }
    }

    #[test]
    fn test_voices_play_at_their_start_frame() {
        let (mut mixer, mut done) = mixer();
        mixer.voices.push(voice(1, 2, vec![0.5, 0.5], 1));
        mixer.voices.push(voice(2, 4, vec![0.25], 1));

        let mut out = vec![9.0; 6];
        mixer.render(&mut out, 1);

        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.25, 0.0]);
        assert_eq!(done.try_recv().unwrap(), 1);
        assert_eq!(done.try_recv().unwrap(), 2);
        assert!(mixer.voices.is_empty());
    }

    #[test]
    fn test_completion_waits_for_last_frame() {
        let (mut mixer, mut done) = mixer();
        mixer.voices.push(voice(7, 0, vec![0.1; 4], 1));

        let mut out = vec![0.0; 2];
        mixer.render(&mut out, 1);
        assert!(done.try_recv().is_err());

        mixer.render(&mut out, 1);
        assert_eq!(done.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_mono_buffer_fills_stereo_device() {
        let (mut mixer, _done) = mixer();
        mixer.voices.push(voice(1, 0, vec![0.3, 0.6], 1));

        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 2);

        assert_eq!(out, vec![0.3, 0.3, 0.6, 0.6]);
    }

    #[test]
    fn test_stereo_buffer_folds_to_mono_device() {
        let (mut mixer, _done) = mixer();
        mixer.voices.push(voice(1, 0, vec![0.2, 0.4], 2));

        let mut out = vec![0.0; 1];
        mixer.render(&mut out, 1);

        assert!((out[0] - 0.3).abs() < 1e-6);
    }
}
