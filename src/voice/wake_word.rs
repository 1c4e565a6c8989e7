//! Hands-free wake word listening
//!
//! Keeps a recognizer running while hands-free mode is on and no session
//! holds the microphone. A final fragment containing a trigger phrase stops
//! the recognizer and reports the trigger; the caller decides what to start.

use serde::Serialize;
use tokio::sync::mpsc;

use super::recognizer::{RecognitionError, RecognitionEvent, RecognitionHandle, Recognizer};
use crate::Error;

/// Listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeState {
    /// Hands-free off, or the microphone was refused
    Disabled,
    /// Recognizer running, watching for a trigger
    Listening,
    /// Hands-free on, but the microphone belongs to a session
    Suspended,
}

/// What a recognition event meant
#[derive(Debug)]
pub enum ListenerOutcome {
    /// Nothing for the caller to do
    Ignored,
    /// A trigger phrase was heard; the recognizer is already stopped
    Triggered { phrase: String, transcript: String },
    /// The recognizer ended on its own and was started again
    Restarted,
    /// Listening is no longer possible
    Disabled(Error),
}

/// Restartable trigger-phrase listener
pub struct WakeWordListener {
    recognizer: Box<dyn Recognizer>,
    phrases: Vec<String>,
    state: WakeState,
    handle: Option<Box<dyn RecognitionHandle>>,
    events: Option<mpsc::UnboundedReceiver<RecognitionEvent>>,
}

impl WakeWordListener {
    /// Create a disabled listener
    #[must_use]
    pub fn new(recognizer: Box<dyn Recognizer>, phrases: Vec<String>) -> Self {
        let phrases: Vec<String> = phrases
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        tracing::debug!(phrases = ?phrases, "wake word listener initialized");

        Self {
            recognizer,
            phrases,
            state: WakeState::Disabled,
            handle: None,
            events: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> WakeState {
        self.state
    }

    /// Whether a recognition run currently holds the microphone
    #[must_use]
    pub fn holds_microphone(&self) -> bool {
        self.handle.is_some()
    }

    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Start (or keep) listening
    ///
    /// The caller must already know the microphone is free. On failure the
    /// listener is left `Disabled`.
    ///
    /// # Errors
    ///
    /// Returns the recognizer's start error
    pub fn listen(&mut self) -> crate::Result<()> {
        if self.handle.is_some() {
            self.state = WakeState::Listening;
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.recognizer.start(tx) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.events = Some(rx);
                self.state = WakeState::Listening;
                tracing::info!("listening for wake word");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "wake word recognizer failed to start");
                self.state = WakeState::Disabled;
                Err(e)
            }
        }
    }

    /// Release the microphone, staying armed for later
    ///
    /// Returns once the recognizer has confirmed its stop.
    pub fn suspend(&mut self) {
        self.release();
        if self.state != WakeState::Disabled {
            self.state = WakeState::Suspended;
        }
    }

    /// Mark armed without holding the microphone
    pub fn arm(&mut self) {
        if self.handle.is_none() {
            self.state = WakeState::Suspended;
        }
    }

    /// Release the microphone and stop listening altogether
    pub fn disable(&mut self) {
        self.release();
        self.state = WakeState::Disabled;
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
        }
        // Drop queued events from the stopped run
        self.events = None;
    }

    /// Wait for the next recognition event; pending while not listening
    pub async fn next_event(&mut self) -> RecognitionEvent {
        match self.events.as_mut() {
            Some(events) => events.recv().await.unwrap_or(RecognitionEvent::End),
            None => std::future::pending().await,
        }
    }

    /// Trigger phrase contained in `text`, if any
    #[must_use]
    pub fn match_phrase(&self, text: &str) -> Option<&str> {
        let normalized = text.to_lowercase();
        self.phrases
            .iter()
            .find(|phrase| normalized.contains(phrase.as_str()))
            .map(String::as_str)
    }

    /// React to one recognition event
    pub fn handle_event(&mut self, event: RecognitionEvent) -> ListenerOutcome {
        if self.state != WakeState::Listening {
            return ListenerOutcome::Ignored;
        }

        match event {
            RecognitionEvent::Fragment { text, is_final } => {
                if !is_final {
                    return ListenerOutcome::Ignored;
                }
                let Some(phrase) = self.match_phrase(&text).map(ToString::to_string) else {
                    tracing::debug!(transcript = %text, "no wake word");
                    return ListenerOutcome::Ignored;
                };

                tracing::info!(phrase, transcript = %text, "wake word detected");
                self.suspend();
                ListenerOutcome::Triggered {
                    phrase,
                    transcript: text,
                }
            }
            RecognitionEvent::End => {
                tracing::debug!("recognition run ended, restarting");
                self.release();
                match self.listen() {
                    Ok(()) => ListenerOutcome::Restarted,
                    Err(e) => ListenerOutcome::Disabled(e),
                }
            }
            RecognitionEvent::Error(RecognitionError::NotAllowed(message)) => {
                tracing::warn!(%message, "microphone refused, disabling hands-free");
                self.disable();
                ListenerOutcome::Disabled(Error::Permission(message))
            }
            RecognitionEvent::Error(RecognitionError::Other(message)) => {
                tracing::warn!(%message, "recognition error");
                ListenerOutcome::Ignored
            }
        }
    }
}

impl Drop for WakeWordListener {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Runs {
        started: usize,
        live: usize,
        refuse: bool,
        sender: Option<mpsc::UnboundedSender<RecognitionEvent>>,
    }

    #[derive(Clone, Default)]
    struct StubRecognizer(Arc<Mutex<Runs>>);

    struct StubHandle(Arc<Mutex<Runs>>);

    impl RecognitionHandle for StubHandle {
        fn stop(&mut self) {
            let mut runs = self.0.lock().unwrap();
            runs.live = runs.live.saturating_sub(1);
            runs.sender = None;
        }
    }

    impl Recognizer for StubRecognizer {
        fn start(
            &self,
            events: mpsc::UnboundedSender<RecognitionEvent>,
        ) -> crate::Result<Box<dyn RecognitionHandle>> {
            let mut runs = self.0.lock().unwrap();
            if runs.refuse {
                return Err(Error::Permission("denied".to_string()));
            }
            runs.started += 1;
            runs.live += 1;
            runs.sender = Some(events);
            Ok(Box::new(StubHandle(Arc::clone(&self.0))))
        }
    }

    fn listener() -> (WakeWordListener, StubRecognizer) {
        let stub = StubRecognizer::default();
        let listener = WakeWordListener::new(
            Box::new(stub.clone()),
            vec!["Ohm".to_string(), "start".to_string()],
        );
        (listener, stub)
    }

    fn fragment(text: &str) -> RecognitionEvent {
        RecognitionEvent::Fragment {
            text: text.to_string(),
            is_final: true,
        }
    }

    #[test]
    fn test_phrase_matching_is_case_insensitive() {
        let (listener, _) = listener();
        assert_eq!(listener.match_phrase("Start OHM please"), Some("ohm"));
        assert_eq!(listener.match_phrase("let's START"), Some("start"));
        assert_eq!(listener.match_phrase("hello world"), None);
    }

    #[test]
    fn test_trigger_stops_recognizer() {
        let (mut listener, stub) = listener();
        listener.listen().unwrap();
        assert_eq!(listener.state(), WakeState::Listening);

        let outcome = listener.handle_event(fragment("hey ohm"));
        assert!(matches!(outcome, ListenerOutcome::Triggered { ref phrase, .. } if phrase == "ohm"));
        assert_eq!(listener.state(), WakeState::Suspended);
        assert!(!listener.holds_microphone());
        assert_eq!(stub.0.lock().unwrap().live, 0);
    }

    #[test]
    fn test_interim_fragments_ignored() {
        let (mut listener, _) = listener();
        listener.listen().unwrap();

        let outcome = listener.handle_event(RecognitionEvent::Fragment {
            text: "ohm".to_string(),
            is_final: false,
        });
        assert!(matches!(outcome, ListenerOutcome::Ignored));
        assert_eq!(listener.state(), WakeState::Listening);
    }

    #[test]
    fn test_restart_on_end() {
        let (mut listener, stub) = listener();
        listener.listen().unwrap();

        let outcome = listener.handle_event(RecognitionEvent::End);
        assert!(matches!(outcome, ListenerOutcome::Restarted));
        assert_eq!(listener.state(), WakeState::Listening);

        let runs = stub.0.lock().unwrap();
        assert_eq!(runs.started, 2);
        assert_eq!(runs.live, 1);
    }

    #[test]
    fn test_not_allowed_disables() {
        let (mut listener, _) = listener();
        listener.listen().unwrap();

        let outcome = listener.handle_event(RecognitionEvent::Error(
            RecognitionError::NotAllowed("revoked".to_string()),
        ));
        assert!(matches!(
            outcome,
            ListenerOutcome::Disabled(Error::Permission(_))
        ));
        assert_eq!(listener.state(), WakeState::Disabled);
        assert!(!listener.holds_microphone());
    }

    #[test]
    fn test_refused_start_leaves_disabled() {
        let (mut listener, stub) = listener();
        stub.0.lock().unwrap().refuse = true;

        assert!(listener.listen().is_err());
        assert_eq!(listener.state(), WakeState::Disabled);
    }

    #[test]
    fn test_events_ignored_when_not_listening() {
        let (mut listener, stub) = listener();
        listener.arm();
        assert_eq!(listener.state(), WakeState::Suspended);

        assert!(matches!(
            listener.handle_event(RecognitionEvent::End),
            ListenerOutcome::Ignored
        ));
        assert_eq!(stub.0.lock().unwrap().started, 0);
    }

    #[tokio::test]
    async fn test_next_event_delivers_in_order() {
        let (mut listener, stub) = listener();
        listener.listen().unwrap();

        let sender = stub.0.lock().unwrap().sender.clone().unwrap();
        sender.send(fragment("one")).unwrap();
        sender.send(RecognitionEvent::End).unwrap();

        assert_eq!(listener.next_event().await, fragment("one"));
        assert_eq!(listener.next_event().await, RecognitionEvent::End);
    }
}
