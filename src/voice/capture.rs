//! Audio capture from microphone

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;

use super::audio::{AudioFrame, CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE};
use super::device::CaptureHandle;
use crate::{Error, Result};

/// Input chunk fed to the resampler when the device can't do 16kHz itself
const RESAMPLE_CHUNK: usize = 1024;

/// Captures the default input device as fixed-size 16kHz mono frames
pub struct CpalCapture {
    stream: Option<Stream>,
}

impl CpalCapture {
    /// Acquire the microphone and start streaming frames into `frames`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Permission`] if the input device cannot be opened
    pub fn start(frames: mpsc::Sender<AudioFrame>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

        let preferred = device
            .supported_input_configs()
            .map_err(|e| Error::Permission(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
            });

        let config: StreamConfig = match preferred {
            Some(c) => c.with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE)).config(),
            None => device
                .default_input_config()
                .map_err(|e| Error::Permission(e.to_string()))?
                .config(),
        };

        let outlet = FrameOutlet::new(frames);
        let mut framer = Framer::new(config.sample_rate.0, config.channels, outlet.clone())?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            native_rate = config.sample_rate.0,
            channels = config.channels,
            "audio capture initialized"
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| framer.push(data),
                move |err| on_stream_error(&outlet, &err),
                None,
            )
            .map_err(|e| Error::Permission(e.to_string()))?;

        stream.play().map_err(|e| Error::Permission(e.to_string()))?;

        tracing::debug!("audio capture started");
        Ok(Self {
            stream: Some(stream),
        })
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

impl CaptureHandle for CpalCapture {
    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sending side of the frame channel, shared by the data and error callbacks
///
/// Closing it ends the consumer's stream even though cpal keeps both
/// callbacks alive until the stream itself is dropped.
#[derive(Clone)]
struct FrameOutlet(Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>);

impl FrameOutlet {
    fn new(frames: mpsc::Sender<AudioFrame>) -> Self {
        Self(Arc::new(Mutex::new(Some(frames))))
    }

    fn send(&self, frame: AudioFrame) {
        let Ok(mut slot) = self.0.lock() else {
            return;
        };
        let Some(frames) = slot.as_ref() else {
            return;
        };
        match frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("capture consumer lagging, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => *slot = None,
        }
    }

    fn close(&self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.take();
        }
    }

    fn is_closed(&self) -> bool {
        self.0.lock().map_or(true, |slot| slot.is_none())
    }
}

/// A lost input device ends the frame stream; anything else is only logged
fn on_stream_error(outlet: &FrameOutlet, err: &cpal::StreamError) {
    match err {
        cpal::StreamError::DeviceNotAvailable => {
            tracing::error!("input device no longer available, ending capture");
            outlet.close();
        }
        other => tracing::error!(error = %other, "audio capture error"),
    }
}

/// Turns raw callback data into 16kHz mono frames of [`CAPTURE_FRAME_SIZE`]
struct Framer {
    channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
    frames: FrameOutlet,
}

impl Framer {
    fn new(native_rate: u32, channels: u16, frames: FrameOutlet) -> Result<Self> {
        let resampler = if native_rate == CAPTURE_SAMPLE_RATE {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                native_rate as usize,
                CAPTURE_SAMPLE_RATE as usize,
                RESAMPLE_CHUNK,
                2,
                1,
            )
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
            Some(resampler)
        };

        Ok(Self {
            channels: usize::from(channels.max(1)),
            resampler,
            pending_in: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            pending_out: Vec::with_capacity(CAPTURE_FRAME_SIZE * 2),
            frames,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, data: &[f32]) {
        if self.frames.is_closed() {
            return;
        }

        let mono = data
            .chunks(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32);

        match self.resampler.as_mut() {
            None => self.pending_out.extend(mono),
            Some(resampler) => {
                self.pending_in.extend(mono);
                while self.pending_in.len() >= RESAMPLE_CHUNK {
                    match resampler.process(&[&self.pending_in[..RESAMPLE_CHUNK]], None) {
                        Ok(mut out) => self.pending_out.append(&mut out[0]),
                        Err(e) => tracing::warn!(error = %e, "capture resample failed"),
                    }
                    self.pending_in.drain(..RESAMPLE_CHUNK);
                }
            }
        }

        while self.pending_out.len() >= CAPTURE_FRAME_SIZE {
            let samples: Vec<f32> = self.pending_out.drain(..CAPTURE_FRAME_SIZE).collect();
            self.frames.send(AudioFrame::mono(samples, CAPTURE_SAMPLE_RATE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_emits_fixed_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut framer = Framer::new(CAPTURE_SAMPLE_RATE, 1, FrameOutlet::new(tx)).unwrap();

        framer.push(&vec![0.1; 3000]);
        assert!(rx.try_recv().is_err());

        framer.push(&vec![0.1; 3000]);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.samples.len(), CAPTURE_FRAME_SIZE);
        assert_eq!(frame.sample_rate, CAPTURE_SAMPLE_RATE);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_framer_downmixes_stereo() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut framer = Framer::new(CAPTURE_SAMPLE_RATE, 2, FrameOutlet::new(tx)).unwrap();

        let stereo: Vec<f32> = (0..CAPTURE_FRAME_SIZE * 2)
            .map(|i| if i % 2 == 0 { 0.4 } else { 0.0 })
            .collect();
        framer.push(&stereo);

        let frame = rx.try_recv().unwrap();
        assert!(frame.samples.iter().all(|s| (s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_framer_resamples_native_rate() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut framer = Framer::new(48000, 1, FrameOutlet::new(tx)).unwrap();

        // Three seconds at 48kHz is enough for several 16kHz frames
        for _ in 0..(48000 * 3 / RESAMPLE_CHUNK) {
            framer.push(&vec![0.0; RESAMPLE_CHUNK]);
        }

        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.samples.len(), CAPTURE_FRAME_SIZE);
            count += 1;
        }
        assert!(count >= 10, "got {count} frames");
    }

    #[test]
    fn test_framer_drops_when_consumer_lags() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut framer = Framer::new(CAPTURE_SAMPLE_RATE, 1, FrameOutlet::new(tx)).unwrap();

        framer.push(&vec![0.0; CAPTURE_FRAME_SIZE * 3]);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_lost_device_ends_frame_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        let outlet = FrameOutlet::new(tx);
        let mut framer = Framer::new(CAPTURE_SAMPLE_RATE, 1, outlet.clone()).unwrap();

        framer.push(&vec![0.1; CAPTURE_FRAME_SIZE]);
        on_stream_error(&outlet, &cpal::StreamError::DeviceNotAvailable);
        framer.push(&vec![0.1; CAPTURE_FRAME_SIZE]);

        assert!(rx.try_recv().is_ok());
        assert_eq!(
            rx.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }

    #[test]
    fn test_backend_hiccup_keeps_stream_open() {
        let (tx, mut rx) = mpsc::channel(8);
        let outlet = FrameOutlet::new(tx);
        let mut framer = Framer::new(CAPTURE_SAMPLE_RATE, 1, outlet.clone()).unwrap();

        let hiccup = cpal::StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "buffer underrun".to_string(),
            },
        };
        on_stream_error(&outlet, &hiccup);
        framer.push(&vec![0.1; CAPTURE_FRAME_SIZE]);

        assert!(rx.try_recv().is_ok());
        assert_eq!(rx.try_recv().unwrap_err(), mpsc::error::TryRecvError::Empty);
    }
}
