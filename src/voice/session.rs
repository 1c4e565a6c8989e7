//! Full-duplex live voice session
//!
//! `Idle → Connecting → Active → Closing → Idle`. Every external happening
//! (remote event, captured frame, buffer completion, timer) enters through
//! [`DuplexSession::handle`] with the time it was observed, so the state
//! machine itself never waits. [`DuplexSession::next_input`] multiplexes the
//! sources that belong to the current session; dropping them on teardown is
//! what keeps stale events from a previous session out.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::audio::AudioFrame;
use super::codec;
use super::device::{AudioDevices, BufferId, CaptureHandle};
use super::live::{LiveConnector, LiveLink, RemoteEvent, ServerMessage};
use super::scheduler::PlaybackScheduler;
use super::vad::{VoiceActivityDetector, VoiceSignal};
use crate::config::VadConfig;
use crate::settings::AudioSettings;
use crate::{Error, Result};

/// Frames buffered between the capture callback and the session
const FRAME_QUEUE: usize = 32;

/// Lifecycle of the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

/// Something the session wants the outside world to know
#[derive(Debug)]
pub enum SessionEvent {
    State(SessionState),
    Speaking(bool),
    Transcript { fragment: String, full: String },
    /// A failure absorbed by the session; it has already been torn down
    Failed(Error),
    /// A problem worked around without ending the session
    Degraded(Error),
}

/// One input for the state machine
#[derive(Debug)]
pub enum SessionInput {
    Remote(RemoteEvent),
    Frame(AudioFrame),
    /// The capture stream ended underneath the session
    CaptureEnded,
    Completed(BufferId),
    /// The VAD hold timer lapsed
    SpeechHoldExpired,
    ConnectTimedOut,
}

/// Owner of one live session at a time
pub struct DuplexSession {
    devices: Arc<dyn AudioDevices>,
    connector: Box<dyn LiveConnector>,
    connect_timeout: Duration,
    state: SessionState,
    settings: Option<AudioSettings>,
    capture: Option<Box<dyn CaptureHandle>>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    link: Option<Box<dyn LiveLink>>,
    remote: Option<mpsc::UnboundedReceiver<RemoteEvent>>,
    scheduler: Option<PlaybackScheduler>,
    completions: Option<mpsc::UnboundedReceiver<BufferId>>,
    connect_deadline: Option<Instant>,
    vad: VoiceActivityDetector,
    speaking: bool,
    transcript: String,
}

impl DuplexSession {
    #[must_use]
    pub fn new(
        devices: Arc<dyn AudioDevices>,
        connector: Box<dyn LiveConnector>,
        vad: VadConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            devices,
            connector,
            connect_timeout,
            state: SessionState::Idle,
            settings: None,
            capture: None,
            frames: None,
            link: None,
            remote: None,
            scheduler: None,
            completions: None,
            connect_deadline: None,
            vad: VoiceActivityDetector::new(vad.threshold, vad.hold),
            speaking: false,
            transcript: String::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session currently holds the microphone
    #[must_use]
    pub fn holds_microphone(&self) -> bool {
        self.capture.is_some()
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Everything the model has said this session
    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Audio settings frozen for the running session
    #[must_use]
    pub const fn settings(&self) -> Option<&AudioSettings> {
        self.settings.as_ref()
    }

    /// Buffers pending or playing
    #[must_use]
    pub fn active_buffers(&self) -> usize {
        self.scheduler
            .as_ref()
            .map_or(0, PlaybackScheduler::active_count)
    }

    /// Acquire the microphone, open playback and begin connecting
    ///
    /// Only valid from `Idle`. On failure every resource acquired so far is
    /// released and the session stays `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionBusy`] when not idle, [`Error::Permission`]
    /// when the microphone is refused, or the playback/connect failure
    pub fn start(&mut self, settings: AudioSettings, now: Instant) -> Result<Vec<SessionEvent>> {
        if self.state != SessionState::Idle {
            return Err(Error::SessionBusy);
        }

        self.transcript.clear();
        self.vad.reset();
        self.speaking = false;

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let capture = self.devices.open_capture(frames_tx)?;
        self.capture = Some(capture);
        self.frames = Some(frames_rx);

        let mut events = Vec::new();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        match self.devices.open_playback(&settings, completions_tx) {
            Ok(mut sink) => {
                if let Some(fallback) = sink.take_fallback() {
                    tracing::warn!(error = %fallback, "playing through the default output");
                    events.push(SessionEvent::Degraded(fallback));
                }
                self.scheduler = Some(PlaybackScheduler::new(sink));
                self.completions = Some(completions_rx);
            }
            Err(e) => {
                self.release();
                return Err(e);
            }
        }

        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        match self.connector.connect(remote_tx) {
            Ok(link) => {
                self.link = Some(link);
                self.remote = Some(remote_rx);
            }
            Err(e) => {
                self.release();
                return Err(match e {
                    Error::Connect(_) => e,
                    other => Error::Connect(other.to_string()),
                });
            }
        }

        tracing::info!(
            sample_rate = settings.sample_rate,
            channels = settings.channel_count,
            output = %settings.output_device_id,
            "live session connecting"
        );
        self.settings = Some(settings);
        self.connect_deadline = Some(now + self.connect_timeout);
        self.state = SessionState::Connecting;
        events.push(SessionEvent::State(SessionState::Connecting));
        Ok(events)
    }

    /// Close the session and release whatever was allocated
    ///
    /// Safe from any state; a no-op when already idle.
    pub fn stop(&mut self) -> Vec<SessionEvent> {
        let allocated = self.capture.is_some()
            || self.link.is_some()
            || self.scheduler.is_some()
            || self.remote.is_some();
        if self.state == SessionState::Idle && !allocated {
            return Vec::new();
        }

        let mut events = Vec::new();
        if self.state != SessionState::Closing {
            self.state = SessionState::Closing;
            events.push(SessionEvent::State(SessionState::Closing));
        }

        if self.speaking {
            self.speaking = false;
            events.push(SessionEvent::Speaking(false));
        }
        self.release();

        self.state = SessionState::Idle;
        events.push(SessionEvent::State(SessionState::Idle));
        tracing::info!("live session closed");
        events
    }

    fn release(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.remote = None;

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.frames = None;

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.close();
        }
        self.completions = None;

        self.connect_deadline = None;
        self.settings = None;
        self.vad.reset();
    }

    /// Tear down after a failure, reporting it first
    fn fail(&mut self, error: Error) -> Vec<SessionEvent> {
        tracing::warn!(error = %error, state = ?self.state, "live session failed");
        let mut events = vec![SessionEvent::Failed(error)];
        events.extend(self.stop());
        events
    }

    /// Wait for the next input of the current session
    ///
    /// Pending forever while idle.
    pub async fn next_input(&mut self) -> SessionInput {
        loop {
            let vad_deadline = if self.speaking {
                self.vad.deadline()
            } else {
                None
            };

            tokio::select! {
                event = recv_unbounded(&mut self.remote) => {
                    return SessionInput::Remote(event.unwrap_or(RemoteEvent::Closed));
                }
                frame = recv_bounded(&mut self.frames) => {
                    return frame.map_or(SessionInput::CaptureEnded, SessionInput::Frame);
                }
                id = recv_unbounded(&mut self.completions) => match id {
                    Some(id) => return SessionInput::Completed(id),
                    None => self.completions = None,
                },
                () = sleep_opt(vad_deadline) => return SessionInput::SpeechHoldExpired,
                () = sleep_opt(self.connect_deadline) => return SessionInput::ConnectTimedOut,
            }
        }
    }

    /// Apply one input observed at `now`
    pub fn handle(&mut self, input: SessionInput, now: Instant) -> Vec<SessionEvent> {
        match input {
            SessionInput::Remote(event) => self.on_remote(event),
            SessionInput::Frame(frame) => self.on_frame(&frame, now),
            SessionInput::CaptureEnded => {
                if self.capture.is_some() {
                    self.fail(Error::Permission("microphone stream ended".to_string()))
                } else {
                    Vec::new()
                }
            }
            SessionInput::Completed(id) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.complete(id);
                }
                Vec::new()
            }
            SessionInput::SpeechHoldExpired => self.on_speech_hold_expired(now),
            SessionInput::ConnectTimedOut => match self.connect_deadline {
                Some(deadline) if self.state == SessionState::Connecting && now >= deadline => {
                    self.fail(Error::Connect("live session handshake timed out".to_string()))
                }
                _ => Vec::new(),
            },
        }
    }

    fn on_remote(&mut self, event: RemoteEvent) -> Vec<SessionEvent> {
        match (self.state, event) {
            (SessionState::Connecting, RemoteEvent::Open) => {
                self.connect_deadline = None;
                self.state = SessionState::Active;
                tracing::info!("live session active");
                vec![SessionEvent::State(SessionState::Active)]
            }
            (SessionState::Active, RemoteEvent::Message(message)) => self.on_message(message),
            (SessionState::Connecting, RemoteEvent::Error(message)) => {
                self.fail(Error::Connect(message))
            }
            (SessionState::Connecting, RemoteEvent::Closed) => self.fail(Error::Connect(
                "remote closed during handshake".to_string(),
            )),
            (SessionState::Active, RemoteEvent::Error(message)) => {
                self.fail(Error::Transport(message))
            }
            (SessionState::Active, RemoteEvent::Closed) => {
                tracing::info!("remote ended the live session");
                self.stop()
            }
            (state, event) => {
                tracing::debug!(?state, ?event, "ignoring remote event");
                Vec::new()
            }
        }
    }

    fn on_message(&mut self, message: ServerMessage) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        // Interrupt first so audio arriving with the barge-in survives it
        if message.interrupted {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.interrupt();
            }
        }

        if let (Some(chunk), Some(settings)) = (message.audio.as_ref(), self.settings.as_ref()) {
            match codec::decode(chunk, settings.sample_rate, settings.channel_count) {
                Ok(buffer) => {
                    if let Some(scheduler) = self.scheduler.as_mut() {
                        if let Err(e) = scheduler.schedule(buffer) {
                            tracing::warn!(error = %e, "failed to schedule model audio");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping undecodable audio chunk"),
            }
        }

        if let Some(fragment) = message.transcript {
            if !self.transcript.is_empty() {
                self.transcript.push(' ');
            }
            self.transcript.push_str(fragment.trim());
            events.push(SessionEvent::Transcript {
                fragment,
                full: self.transcript.clone(),
            });
        }

        events
    }

    fn on_frame(&mut self, frame: &AudioFrame, now: Instant) -> Vec<SessionEvent> {
        if self.state != SessionState::Active {
            return Vec::new();
        }

        let mut events = Vec::new();
        let signal = self.vad.observe(&frame.samples, now);
        if signal == VoiceSignal::Speaking && !self.speaking {
            self.speaking = true;
            events.push(SessionEvent::Speaking(true));
        }

        let chunk = codec::encode(frame);
        let sent = match self.link.as_ref() {
            Some(link) => link.send(chunk),
            None => Err(Error::Transport("no live link".to_string())),
        };
        if let Err(e) = sent {
            events.extend(self.fail(e));
        }
        events
    }

    fn on_speech_hold_expired(&mut self, now: Instant) -> Vec<SessionEvent> {
        match self.vad.expire(now) {
            Some(VoiceSignal::Silent) if self.speaking => {
                self.speaking = false;
                vec![SessionEvent::Speaking(false)]
            }
            _ => Vec::new(),
        }
    }
}

impl Drop for DuplexSession {
    fn drop(&mut self) {
        self.release();
    }
}

async fn recv_bounded<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_unbounded<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
