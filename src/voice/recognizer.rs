//! Continuous speech recognition capability
//!
//! A recognition run streams transcript fragments until it ends on its own
//! or is stopped. [`TranscribingRecognizer`] builds one from the capture
//! stream, [`SpeechSegmenter`] and a cloud [`SpeechToText`] call.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use super::audio::{AudioFrame, CAPTURE_SAMPLE_RATE};
use super::device::{AudioDevices, CaptureHandle};
use super::segmenter::SpeechSegmenter;
use super::stt::SpeechToText;
use crate::Result;

/// Frames buffered between the capture callback and the recognition task
const FRAME_QUEUE: usize = 32;

/// Turns one 16kHz utterance into text
type Transcribe = Arc<dyn Fn(Vec<f32>) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Why a recognition run failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    /// Microphone access denied or revoked
    NotAllowed(String),
    Other(String),
}

/// Output of a recognition run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Recognized text; only final fragments are matched against triggers
    Fragment { text: String, is_final: bool },
    /// The run ended naturally
    End,
    Error(RecognitionError),
}

/// A running recognition
pub trait RecognitionHandle {
    /// Stop recognizing and release the microphone
    ///
    /// Returns once the microphone is free. Idempotent.
    fn stop(&mut self);
}

/// Capability to start continuous recognition
pub trait Recognizer {
    /// Start a run delivering events to `events`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Permission`] if the microphone cannot be
    /// acquired, or another error if recognition cannot start at all
    fn start(
        &self,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionHandle>>;
}

/// Recognizer built from microphone capture and batch transcription
pub struct TranscribingRecognizer {
    devices: Arc<dyn AudioDevices>,
    stt: Arc<SpeechToText>,
    run_length: Duration,
}

impl TranscribingRecognizer {
    #[must_use]
    pub fn new(devices: Arc<dyn AudioDevices>, stt: SpeechToText, run_length: Duration) -> Self {
        Self {
            devices,
            stt: Arc::new(stt),
            run_length,
        }
    }
}

impl Recognizer for TranscribingRecognizer {
    fn start(
        &self,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionHandle>> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let capture = self.devices.open_capture(frames_tx)?;

        let stt = Arc::clone(&self.stt);
        let transcribe: Transcribe =
            Arc::new(move |utterance: Vec<f32>| -> BoxFuture<'static, Result<String>> {
                let stt = Arc::clone(&stt);
                Box::pin(async move { stt.transcribe_samples(&utterance, CAPTURE_SAMPLE_RATE).await })
            });

        let task = tokio::spawn(recognize(frames_rx, transcribe, events, self.run_length));

        tracing::debug!("wake-word recognition started");
        Ok(Box::new(TranscribingHandle {
            capture: Some(capture),
            task: Some(task),
        }))
    }
}

/// Stand-in when no transcription backend is configured
///
/// Every start fails, so enabling hands-free reports the reason and turns
/// itself back off.
#[derive(Debug, Clone)]
pub struct UnavailableRecognizer {
    reason: String,
}

impl UnavailableRecognizer {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Recognizer for UnavailableRecognizer {
    fn start(
        &self,
        _events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionHandle>> {
        Err(crate::Error::Stt(self.reason.clone()))
    }
}

struct TranscribingHandle {
    capture: Option<Box<dyn CaptureHandle>>,
    task: Option<JoinHandle<()>>,
}

impl RecognitionHandle for TranscribingHandle {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("wake-word recognition stopped");
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }
}

impl Drop for TranscribingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn recognize(
    mut frames: mpsc::Receiver<AudioFrame>,
    transcribe: Transcribe,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    run_length: Duration,
) {
    let mut segmenter = SpeechSegmenter::default();
    let mut pending = JoinSet::new();
    let deadline = tokio::time::sleep(run_length);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    // The handle stops capture only after aborting this task
                    tracing::warn!("microphone stream ended during recognition");
                    let _ = events.send(RecognitionEvent::Error(RecognitionError::NotAllowed(
                        "microphone stream ended".to_string(),
                    )));
                    return;
                };
                if let Some(utterance) = segmenter.push(&frame.samples) {
                    pending.spawn(transcribe(utterance));
                }
            }
            Some(done) = pending.join_next() => deliver(done, &events),
        }
    }

    // Out of time: stop listening but let speech already heard finish
    drop(frames);
    if let Some(utterance) = segmenter.flush() {
        pending.spawn(transcribe(utterance));
    }
    while let Some(done) = pending.join_next().await {
        deliver(done, &events);
    }

    let _ = events.send(RecognitionEvent::End);
}

fn deliver(
    done: std::result::Result<Result<String>, tokio::task::JoinError>,
    events: &mpsc::UnboundedSender<RecognitionEvent>,
) {
    match done {
        Ok(Ok(text)) if !text.trim().is_empty() => {
            let _ = events.send(RecognitionEvent::Fragment {
                text: text.trim().to_string(),
                is_final: true,
            });
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "utterance transcription failed"),
        Err(e) => tracing::warn!(error = %e, "transcription task failed"),
    }
}
