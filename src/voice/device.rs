//! Microphone and speaker capabilities
//!
//! The voice core never touches an audio backend directly. It asks an
//! [`AudioDevices`] implementation for a capture stream or a playback sink and
//! talks to the returned handles. [`CpalDevices`] is the hardware backend.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;
use tokio::sync::mpsc;

use super::audio::{AudioFrame, PlaybackBuffer};
use super::capture::CpalCapture;
use super::playback::CpalSink;
use crate::Result;
use crate::settings::{AudioSettings, DEFAULT_OUTPUT_DEVICE};

/// Identifier of a buffer handed to a sink
pub type BufferId = u64;

/// An output device the user can pick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDevice {
    pub id: String,
    pub label: String,
}

/// A running microphone capture
pub trait CaptureHandle {
    /// Stop capturing and release the microphone
    ///
    /// Must be idempotent; once it returns the device is free for another owner.
    fn stop(&mut self);
}

/// An opened speaker sink with its own sample clock
pub trait PlaybackSink {
    /// Current position of the device clock, in seconds
    fn current_time(&self) -> f64;

    /// Play `buffer` starting exactly at device time `at`
    ///
    /// # Errors
    ///
    /// Returns error if the sink can no longer accept audio
    fn start(&mut self, id: BufferId, buffer: PlaybackBuffer, at: f64) -> Result<()>;

    /// Stop a buffer immediately, whether pending or playing
    fn stop(&mut self, id: BufferId);

    /// Tear the sink down
    fn close(&mut self);

    /// Why the requested output was swapped for the default, once
    fn take_fallback(&mut self) -> Option<crate::Error> {
        None
    }
}

/// Capability to reach audio hardware
pub trait AudioDevices: Send + Sync {
    /// Enumerate selectable output devices
    ///
    /// # Errors
    ///
    /// Returns error if the audio host cannot be queried
    fn list_output_devices(&self) -> Result<Vec<OutputDevice>>;

    /// Acquire the microphone; frames are pushed into `frames` in capture order
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Permission`] if the microphone cannot be acquired
    fn open_capture(&self, frames: mpsc::Sender<AudioFrame>) -> Result<Box<dyn CaptureHandle>>;

    /// Open the configured sink; finished buffer ids are sent to `completions`
    ///
    /// An unknown sink falls back to the default output and reports
    /// [`crate::Error::Device`] through [`PlaybackSink::take_fallback`].
    ///
    /// # Errors
    ///
    /// Returns error if no output device can be opened at all
    fn open_playback(
        &self,
        settings: &AudioSettings,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn PlaybackSink>>;
}

/// cpal-backed audio hardware
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDevices;

impl AudioDevices for CpalDevices {
    fn list_output_devices(&self) -> Result<Vec<OutputDevice>> {
        let host = cpal::default_host();
        let mut devices = vec![OutputDevice {
            id: DEFAULT_OUTPUT_DEVICE.to_string(),
            label: "System Default".to_string(),
        }];

        let outputs = host
            .output_devices()
            .map_err(|e| crate::Error::Audio(e.to_string()))?;

        for device in outputs {
            match device.name() {
                Ok(name) => devices.push(OutputDevice {
                    id: name.clone(),
                    label: name,
                }),
                Err(e) => tracing::debug!(error = %e, "skipping unnamed output device"),
            }
        }

        Ok(devices)
    }

    fn open_capture(&self, frames: mpsc::Sender<AudioFrame>) -> Result<Box<dyn CaptureHandle>> {
        let capture = CpalCapture::start(frames)?;
        Ok(Box::new(capture))
    }

    fn open_playback(
        &self,
        settings: &AudioSettings,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn PlaybackSink>> {
        let sink = CpalSink::open(settings, completions)?;
        Ok(Box::new(sink))
    }
}
