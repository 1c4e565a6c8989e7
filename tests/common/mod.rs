//! Shared test utilities
//!
//! In-memory stand-ins for the audio hardware, the live model and the
//! recognizer. Every fake records what was done to it behind an
//! `Arc<Mutex<_>>` so tests can inspect it after handing ownership away.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use ohm_voice::voice::{
    Arbiter, ArbiterHandle, ArbiterOptions, AudioDevices, AudioFrame, BufferId, CAPTURE_SAMPLE_RATE,
    CaptureHandle, EncodedChunk, LiveConnector, LiveLink, OutputDevice, PlaybackBuffer,
    PlaybackSink, RecognitionEvent, RecognitionHandle, Recognizer, RemoteEvent, ServerMessage,
    codec,
};
use ohm_voice::{AudioSettings, Error, KeyValueStore, MemoryStore, Result};
use tokio::sync::mpsc;

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().expect("fake state poisoned")
}

// --- audio devices ---

/// Everything the fake hardware has seen
#[derive(Default)]
pub struct DeviceLog {
    /// Captures currently holding the microphone
    pub mic_holders: usize,
    /// Highest number of simultaneous holders ever observed
    pub max_mic_holders: usize,
    pub captures_opened: usize,
    pub deny_capture: bool,
    pub fail_playback: bool,
    frames: Option<mpsc::Sender<AudioFrame>>,

    pub clock: f64,
    /// `(id, start, duration)` for every buffer handed to a sink
    pub started: Vec<(BufferId, f64, f64)>,
    pub stopped: Vec<BufferId>,
    pub sinks_opened: usize,
    pub sinks_closed: usize,
    pub last_settings: Option<AudioSettings>,
    completions: Option<mpsc::UnboundedSender<BufferId>>,
}

/// Fake microphone and speaker
#[derive(Clone, Default)]
pub struct FakeDevices {
    pub log: Arc<Mutex<DeviceLog>>,
}

impl FakeDevices {
    pub fn log(&self) -> MutexGuard<'_, DeviceLog> {
        lock(&self.log)
    }

    /// Deliver a captured frame to whoever holds the microphone
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        self.log()
            .frames
            .as_ref()
            .is_some_and(|tx| tx.try_send(frame).is_ok())
    }

    /// Pull the microphone away from whoever holds it, as a revoked device would
    pub fn lose_microphone(&self) -> bool {
        self.log().frames.take().is_some()
    }

    /// Report a buffer as finished playing
    pub fn complete(&self, id: BufferId) -> bool {
        self.log()
            .completions
            .as_ref()
            .is_some_and(|tx| tx.send(id).is_ok())
    }
}

struct FakeCapture {
    log: Arc<Mutex<DeviceLog>>,
    running: bool,
}

impl CaptureHandle for FakeCapture {
    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let mut log = lock(&self.log);
        log.mic_holders -= 1;
        log.frames = None;
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FakeSink {
    log: Arc<Mutex<DeviceLog>>,
    fallback: Option<Error>,
}

impl PlaybackSink for FakeSink {
    fn current_time(&self) -> f64 {
        lock(&self.log).clock
    }

    fn start(&mut self, id: BufferId, buffer: PlaybackBuffer, at: f64) -> Result<()> {
        lock(&self.log).started.push((id, at, buffer.duration()));
        Ok(())
    }

    fn stop(&mut self, id: BufferId) {
        lock(&self.log).stopped.push(id);
    }

    fn close(&mut self) {
        let mut log = lock(&self.log);
        log.sinks_closed += 1;
        log.completions = None;
    }

    fn take_fallback(&mut self) -> Option<Error> {
        self.fallback.take()
    }
}

fn outputs() -> Vec<OutputDevice> {
    vec![
        OutputDevice {
            id: "default".to_string(),
            label: "System Default".to_string(),
        },
        OutputDevice {
            id: "usb-headset".to_string(),
            label: "USB Headset".to_string(),
        },
    ]
}

impl AudioDevices for FakeDevices {
    fn list_output_devices(&self) -> Result<Vec<OutputDevice>> {
        Ok(outputs())
    }

    fn open_capture(&self, frames: mpsc::Sender<AudioFrame>) -> Result<Box<dyn CaptureHandle>> {
        let mut log = self.log();
        if log.deny_capture {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        log.mic_holders += 1;
        log.max_mic_holders = log.max_mic_holders.max(log.mic_holders);
        log.captures_opened += 1;
        log.frames = Some(frames);
        Ok(Box::new(FakeCapture {
            log: Arc::clone(&self.log),
            running: true,
        }))
    }

    fn open_playback(
        &self,
        settings: &AudioSettings,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn PlaybackSink>> {
        let mut log = self.log();
        if log.fail_playback {
            return Err(Error::Audio("no output device available".to_string()));
        }
        log.sinks_opened += 1;
        log.last_settings = Some(settings.clone());
        log.completions = Some(completions);

        let known = outputs()
            .iter()
            .any(|device| device.id == settings.output_device_id);
        let fallback = (!known).then(|| {
            Error::Device(format!("output device {:?} not found", settings.output_device_id))
        });
        Ok(Box::new(FakeSink {
            log: Arc::clone(&self.log),
            fallback,
        }))
    }
}

// --- live model ---

/// Everything the fake live model has seen
#[derive(Default)]
pub struct LinkLog {
    pub connects: usize,
    pub closes: usize,
    pub refuse: bool,
    pub broken: bool,
    pub sent: Vec<EncodedChunk>,
    events: Option<mpsc::UnboundedSender<RemoteEvent>>,
}

/// Fake live model connector
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub log: Arc<Mutex<LinkLog>>,
}

impl FakeConnector {
    pub fn log(&self) -> MutexGuard<'_, LinkLog> {
        lock(&self.log)
    }

    /// Deliver a server event to the current session
    pub fn emit(&self, event: RemoteEvent) -> bool {
        self.log()
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

struct FakeLink {
    log: Arc<Mutex<LinkLog>>,
}

impl LiveLink for FakeLink {
    fn send(&self, chunk: EncodedChunk) -> Result<()> {
        let mut log = lock(&self.log);
        if log.broken {
            return Err(Error::Transport("socket closed".to_string()));
        }
        log.sent.push(chunk);
        Ok(())
    }

    fn close(&self) {
        lock(&self.log).closes += 1;
    }
}

impl LiveConnector for FakeConnector {
    fn connect(&self, events: mpsc::UnboundedSender<RemoteEvent>) -> Result<Box<dyn LiveLink>> {
        let mut log = self.log();
        log.connects += 1;
        if log.refuse {
            return Err(Error::Connect("connection refused".to_string()));
        }
        log.events = Some(events);
        Ok(Box::new(FakeLink {
            log: Arc::clone(&self.log),
        }))
    }
}

// --- recognizer ---

/// Everything the fake recognizer has seen
#[derive(Default)]
pub struct RecognizerLog {
    pub starts: usize,
    pub stops: usize,
    pub live: usize,
    events: Option<mpsc::UnboundedSender<RecognitionEvent>>,
}

/// Fake recognizer that takes the microphone from [`FakeDevices`]
#[derive(Clone)]
pub struct FakeRecognizer {
    pub devices: FakeDevices,
    pub log: Arc<Mutex<RecognizerLog>>,
}

impl FakeRecognizer {
    pub fn new(devices: FakeDevices) -> Self {
        Self {
            devices,
            log: Arc::default(),
        }
    }

    pub fn log(&self) -> MutexGuard<'_, RecognizerLog> {
        lock(&self.log)
    }

    /// Deliver an event to the running recognition
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        self.log()
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn hear(&self, text: &str) -> bool {
        self.emit(RecognitionEvent::Fragment {
            text: text.to_string(),
            is_final: true,
        })
    }
}

struct FakeRun {
    log: Arc<Mutex<RecognizerLog>>,
    capture: Option<Box<dyn CaptureHandle>>,
}

impl RecognitionHandle for FakeRun {
    fn stop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            let mut log = lock(&self.log);
            log.stops += 1;
            log.live -= 1;
            log.events = None;
        }
    }
}

impl Drop for FakeRun {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Recognizer for FakeRecognizer {
    fn start(
        &self,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionHandle>> {
        // Frames are unused; the recognizer only needs to hold the device
        let (frames, _) = mpsc::channel(1);
        let capture = self.devices.open_capture(frames)?;

        let mut log = self.log();
        log.starts += 1;
        log.live += 1;
        log.events = Some(events);
        Ok(Box::new(FakeRun {
            log: Arc::clone(&self.log),
            capture: Some(capture),
        }))
    }
}

// --- wiring ---

/// Arbiter wired to fakes, with the fakes kept for inspection
pub struct Harness {
    pub arbiter: Arbiter,
    pub handle: ArbiterHandle,
    pub devices: FakeDevices,
    pub connector: FakeConnector,
    pub recognizer: FakeRecognizer,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self::build(store, FakeDevices::default(), FakeConnector::default())
    }

    pub fn build(store: Arc<MemoryStore>, devices: FakeDevices, connector: FakeConnector) -> Self {
        let recognizer = FakeRecognizer::new(devices.clone());
        let (arbiter, handle) = Arbiter::new(
            ArbiterOptions::default(),
            Arc::new(devices.clone()),
            Box::new(connector.clone()),
            Box::new(recognizer.clone()),
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
        );

        Self {
            arbiter,
            handle,
            devices,
            connector,
            recognizer,
            store,
        }
    }
}

/// Mono capture frame of constant amplitude
pub fn frame(amplitude: f32) -> AudioFrame {
    AudioFrame::mono(vec![amplitude; 1600], CAPTURE_SAMPLE_RATE)
}

/// Model audio chunk of `seconds` at 24kHz mono
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn model_audio(seconds: f32) -> EncodedChunk {
    let samples = vec![0.1; (24000.0 * seconds) as usize];
    codec::encode(&AudioFrame::mono(samples, 24000))
}

pub fn audio_message(seconds: f32) -> RemoteEvent {
    RemoteEvent::Message(ServerMessage {
        audio: Some(model_audio(seconds)),
        ..ServerMessage::default()
    })
}

pub fn transcript_message(text: &str) -> RemoteEvent {
    RemoteEvent::Message(ServerMessage {
        transcript: Some(text.to_string()),
        ..ServerMessage::default()
    })
}
