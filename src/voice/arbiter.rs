//! Microphone ownership between the wake-word listener and the live session
//!
//! The [`Arbiter`] is a single actor. It owns both microphone users and is
//! the only code that starts either, always stop-then-start: the listener is
//! stopped (and has released the device) before a session acquires it, and
//! the listener only starts again once the session is idle and the settling
//! delay has passed.
//!
//! Everything else talks to it through a cloneable [`ArbiterHandle`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use super::device::{AudioDevices, OutputDevice};
use super::live::LiveConnector;
use super::recognizer::{RecognitionEvent, Recognizer};
use super::session::{DuplexSession, SessionEvent, SessionInput, SessionState, sleep_opt};
use super::wake_word::{ListenerOutcome, WakeState, WakeWordListener};
use crate::config::{Config, DEFAULT_SETTLE_DELAY, DEFAULT_WAKE_PHRASES, VadConfig};
use crate::error::ErrorKind;
use crate::settings::{AudioSettings, KeyValueStore, Preferences};
use crate::{Error, Result};

const COMMAND_QUEUE: usize = 32;
const NOTIFICATION_CAPACITY: usize = 64;

/// Tunables for the arbiter and the components it owns
#[derive(Debug, Clone)]
pub struct ArbiterOptions {
    /// Pause between a session ending and the listener reacquiring the mic
    pub settle_delay: Duration,
    pub phrases: Vec<String>,
    pub vad: VadConfig,
    pub connect_timeout: Duration,
}

impl Default for ArbiterOptions {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            phrases: DEFAULT_WAKE_PHRASES.iter().map(ToString::to_string).collect(),
            vad: VadConfig::default(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for ArbiterOptions {
    fn from(config: &Config) -> Self {
        Self {
            settle_delay: config.wake.settle_delay,
            phrases: config.wake.phrases.clone(),
            vad: config.vad,
            connect_timeout: config.live.connect_timeout,
        }
    }
}

/// Who holds the microphone right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MicOwner {
    Nobody,
    Listener,
    Session,
}

/// State change pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    SessionState { state: SessionState },
    WakeState { state: WakeState },
    Speaking { speaking: bool },
    Transcript { fragment: String, full: String },
    Error { kind: ErrorKind, message: String },
    SettingsChanged { settings: AudioSettings },
    HandsFreeChanged { enabled: bool },
}

/// Point-in-time view of the voice core
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub session: SessionState,
    pub wake: WakeState,
    pub hands_free: bool,
    pub speaking: bool,
    pub transcript: String,
    pub settings: AudioSettings,
    pub mic_owner: MicOwner,
    pub active_buffers: usize,
}

enum Command {
    StartSession(oneshot::Sender<Result<()>>),
    StopSession(oneshot::Sender<()>),
    SetHandsFree {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateSettings {
        settings: AudioSettings,
        reply: oneshot::Sender<Result<AudioSettings>>,
    },
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Single authority over the microphone
pub struct Arbiter {
    session: DuplexSession,
    listener: WakeWordListener,
    store: Arc<dyn KeyValueStore>,
    prefs: Preferences,
    settle_delay: Duration,
    rearm_at: Option<Instant>,
    last_wake: WakeState,
    commands: mpsc::Receiver<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl Arbiter {
    /// Build the arbiter and its handle; preferences are read from `store`
    #[must_use]
    pub fn new(
        options: ArbiterOptions,
        devices: Arc<dyn AudioDevices>,
        connector: Box<dyn LiveConnector>,
        recognizer: Box<dyn Recognizer>,
        store: Arc<dyn KeyValueStore>,
    ) -> (Self, ArbiterHandle) {
        let prefs = Preferences::load(store.as_ref());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        tracing::debug!(
            hands_free = prefs.hands_free,
            sample_rate = prefs.audio.sample_rate,
            "voice arbiter initialized"
        );

        let arbiter = Self {
            session: DuplexSession::new(
                Arc::clone(&devices),
                connector,
                options.vad,
                options.connect_timeout,
            ),
            listener: WakeWordListener::new(recognizer, options.phrases),
            store,
            prefs,
            settle_delay: options.settle_delay,
            rearm_at: None,
            last_wake: WakeState::Disabled,
            commands: commands_rx,
            notifications: notifications.clone(),
        };

        let handle = ArbiterHandle {
            commands: commands_tx,
            notifications,
            devices,
        };

        (arbiter, handle)
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(mut self) {
        self.resume();
        while self.step().await {}
        self.shutdown();
    }

    /// Wait for and process one event; false once shut down
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            command = self.commands.recv() => match command {
                Some(command) => self.handle_command(command),
                None => false,
            },
            input = self.session.next_input() => {
                self.on_session_input(input, Instant::now());
                true
            }
            event = self.listener.next_event() => {
                self.on_recognition(event, Instant::now());
                true
            }
            () = sleep_opt(self.rearm_at) => {
                self.on_rearm();
                true
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        let now = Instant::now();
        match command {
            Command::StartSession(reply) => {
                let _ = reply.send(self.start_session(now));
            }
            Command::StopSession(reply) => {
                self.stop_session(now);
                let _ = reply.send(());
            }
            Command::SetHandsFree { enabled, reply } => {
                let _ = reply.send(self.set_hands_free(enabled));
            }
            Command::UpdateSettings { settings, reply } => {
                let _ = reply.send(self.update_settings(settings));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Start listening at startup if hands-free was left on
    pub fn resume(&mut self) {
        if self.prefs.hands_free && self.session.state() == SessionState::Idle {
            let _ = self.try_listen();
        }
        self.finish_step();
    }

    /// Start a live session, taking the microphone from the listener
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionBusy`] if a session exists, or the start
    /// failure (already reported to subscribers)
    pub fn start_session(&mut self, now: Instant) -> Result<()> {
        let result = self.begin_session(now);
        self.finish_step();
        result
    }

    fn begin_session(&mut self, now: Instant) -> Result<()> {
        if self.session.state() != SessionState::Idle {
            return Err(Error::SessionBusy);
        }

        // Phase one: the listener lets go of the microphone
        self.rearm_at = None;
        self.listener.suspend();

        // Phase two: the session takes it
        match self.session.start(self.prefs.audio.clone(), now) {
            Ok(events) => {
                self.publish(events, now);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "live session failed to start");
                self.notify_error(&e);
                self.after_session(now, e.kind() == ErrorKind::Permission);
                Err(e)
            }
        }
    }

    /// Stop the live session, if any
    pub fn stop_session(&mut self, now: Instant) {
        let events = self.session.stop();
        self.publish(events, now);
        self.finish_step();
    }

    /// Toggle hands-free mode and persist the choice
    ///
    /// # Errors
    ///
    /// Returns error if the preference cannot be saved or the listener
    /// cannot start
    pub fn set_hands_free(&mut self, enabled: bool) -> Result<()> {
        let result = self.apply_hands_free(enabled);
        self.finish_step();
        result
    }

    fn apply_hands_free(&mut self, enabled: bool) -> Result<()> {
        Preferences::save_hands_free(self.store.as_ref(), enabled)?;
        if self.prefs.hands_free != enabled {
            self.prefs.hands_free = enabled;
            self.notify(Notification::HandsFreeChanged { enabled });
        }
        tracing::info!(enabled, "hands-free mode");

        if !enabled {
            self.rearm_at = None;
            self.listener.disable();
            return Ok(());
        }

        if self.session.state() == SessionState::Idle && self.rearm_at.is_none() {
            self.try_listen()
        } else {
            // Armed; listening starts once the session is over
            self.listener.arm();
            Ok(())
        }
    }

    /// Replace the audio settings; only while no session exists
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`], [`Error::SessionBusy`], or a
    /// persistence error
    pub fn update_settings(&mut self, settings: AudioSettings) -> Result<AudioSettings> {
        settings.validate()?;
        if self.session.state() != SessionState::Idle {
            return Err(Error::SessionBusy);
        }

        Preferences::save_audio(self.store.as_ref(), &settings)?;
        self.prefs.audio = settings.clone();
        tracing::info!(?settings, "audio settings updated");
        self.notify(Notification::SettingsChanged {
            settings: settings.clone(),
        });
        Ok(settings)
    }

    /// Feed one session input observed at `now`
    pub fn on_session_input(&mut self, input: SessionInput, now: Instant) {
        let events = self.session.handle(input, now);
        self.publish(events, now);
        self.finish_step();
    }

    /// Feed one recognition event observed at `now`
    pub fn on_recognition(&mut self, event: RecognitionEvent, now: Instant) {
        match self.listener.handle_event(event) {
            ListenerOutcome::Ignored | ListenerOutcome::Restarted => {}
            ListenerOutcome::Triggered { phrase, .. } => {
                tracing::info!(phrase, "wake word starts live session");
                if let Err(e) = self.begin_session(now) {
                    tracing::debug!(error = %e, "wake-triggered session did not start");
                }
            }
            ListenerOutcome::Disabled(e) => {
                self.notify_error(&e);
                self.disable_hands_free();
            }
        }
        self.finish_step();
    }

    /// Settling delay elapsed: hand the microphone back to the listener
    pub fn on_rearm(&mut self) {
        self.rearm_at = None;
        if self.prefs.hands_free && self.session.state() == SessionState::Idle {
            let _ = self.try_listen();
        }
        self.finish_step();
    }

    /// Tear everything down without touching persisted preferences
    pub fn shutdown(&mut self) {
        let events = self.session.stop();
        self.publish(events, Instant::now());
        self.rearm_at = None;
        self.listener.disable();
        self.finish_step();
        tracing::info!("voice arbiter stopped");
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            session: self.session.state(),
            wake: self.listener.state(),
            hands_free: self.prefs.hands_free,
            speaking: self.session.is_speaking(),
            transcript: self.session.transcript().to_string(),
            settings: self.prefs.audio.clone(),
            mic_owner: self.mic_owner(),
            active_buffers: self.session.active_buffers(),
        }
    }

    #[must_use]
    pub fn mic_owner(&self) -> MicOwner {
        match (self.listener.holds_microphone(), self.session.holds_microphone()) {
            (true, _) => MicOwner::Listener,
            (false, true) => MicOwner::Session,
            (false, false) => MicOwner::Nobody,
        }
    }

    /// When the listener is due to reacquire the microphone
    #[must_use]
    pub const fn rearm_deadline(&self) -> Option<Instant> {
        self.rearm_at
    }

    #[must_use]
    pub const fn session(&self) -> &DuplexSession {
        &self.session
    }

    #[must_use]
    pub const fn listener(&self) -> &WakeWordListener {
        &self.listener
    }

    fn try_listen(&mut self) -> Result<()> {
        if self.session.holds_microphone() {
            return Err(Error::SessionBusy);
        }
        match self.listener.listen() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.notify_error(&e);
                self.disable_hands_free();
                Err(e)
            }
        }
    }

    /// The session reached idle; decide whether the listener comes back
    fn after_session(&mut self, now: Instant, permission_denied: bool) {
        if permission_denied {
            self.disable_hands_free();
            return;
        }
        if self.prefs.hands_free {
            self.listener.arm();
            self.rearm_at = Some(now + self.settle_delay);
            tracing::debug!(delay = ?self.settle_delay, "wake word listener re-arming");
        }
    }

    /// Hands-free cannot work; turn it off and remember that
    fn disable_hands_free(&mut self) {
        self.rearm_at = None;
        self.listener.disable();
        if !self.prefs.hands_free {
            return;
        }

        self.prefs.hands_free = false;
        if let Err(e) = Preferences::save_hands_free(self.store.as_ref(), false) {
            tracing::warn!(error = %e, "failed to persist hands-free off");
        }
        tracing::warn!("hands-free mode disabled");
        self.notify(Notification::HandsFreeChanged { enabled: false });
    }

    fn publish(&mut self, events: Vec<SessionEvent>, now: Instant) {
        let mut ended = false;
        let mut permission_denied = false;

        for event in events {
            match event {
                SessionEvent::State(state) => {
                    ended |= state == SessionState::Idle;
                    self.notify(Notification::SessionState { state });
                }
                SessionEvent::Speaking(speaking) => {
                    self.notify(Notification::Speaking { speaking });
                }
                SessionEvent::Transcript { fragment, full } => {
                    self.notify(Notification::Transcript { fragment, full });
                }
                SessionEvent::Failed(e) => {
                    permission_denied |= e.kind() == ErrorKind::Permission;
                    self.notify_error(&e);
                }
                SessionEvent::Degraded(e) => self.notify_error(&e),
            }
        }

        if ended {
            self.after_session(now, permission_denied);
        }
    }

    fn notify_error(&self, error: &Error) {
        self.notify(Notification::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn notify(&self, notification: Notification) {
        tracing::trace!(?notification, "voice notification");
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    /// Publish listener state changes and check mutual exclusion
    fn finish_step(&mut self) {
        let wake = self.listener.state();
        if wake != self.last_wake {
            self.last_wake = wake;
            self.notify(Notification::WakeState { state: wake });
        }

        let exclusive = !(self.listener.holds_microphone() && self.session.holds_microphone());
        if !exclusive {
            tracing::error!("listener and session both hold the microphone");
        }
        debug_assert!(exclusive, "listener and session both hold the microphone");
    }
}

/// Cloneable, `Send` handle to a running [`Arbiter`]
#[derive(Clone)]
pub struct ArbiterHandle {
    commands: mpsc::Sender<Command>,
    notifications: broadcast::Sender<Notification>,
    devices: Arc<dyn AudioDevices>,
}

impl ArbiterHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::RuntimeStopped)?;
        rx.await.map_err(|_| Error::RuntimeStopped)
    }

    /// Start a live session
    ///
    /// # Errors
    ///
    /// Returns the start failure, or [`Error::RuntimeStopped`]
    pub async fn start_session(&self) -> Result<()> {
        self.request(Command::StartSession).await?
    }

    /// Stop the live session; idempotent
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeStopped`] if the arbiter is gone
    pub async fn stop_session(&self) -> Result<()> {
        self.request(Command::StopSession).await
    }

    /// Toggle hands-free mode
    ///
    /// # Errors
    ///
    /// Returns error if the choice cannot be saved or listening cannot start
    pub async fn set_hands_free(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetHandsFree { enabled, reply })
            .await?
    }

    /// Replace audio settings
    ///
    /// # Errors
    ///
    /// Returns error if invalid, busy, or not persisted
    pub async fn update_settings(&self, settings: AudioSettings) -> Result<AudioSettings> {
        self.request(|reply| Command::UpdateSettings { settings, reply })
            .await?
    }

    /// Current audio settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeStopped`] if the arbiter is gone
    pub async fn settings(&self) -> Result<AudioSettings> {
        Ok(self.snapshot().await?.settings)
    }

    /// Current state of the voice core
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeStopped`] if the arbiter is gone
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(Command::Snapshot).await
    }

    /// Enumerate output devices
    ///
    /// # Errors
    ///
    /// Returns error if the audio host cannot be queried
    pub async fn list_output_devices(&self) -> Result<Vec<OutputDevice>> {
        let devices = Arc::clone(&self.devices);
        tokio::task::spawn_blocking(move || devices.list_output_devices())
            .await
            .map_err(|e| Error::Audio(e.to_string()))?
    }

    /// Receive notifications from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Ask the arbiter to tear down and exit
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
