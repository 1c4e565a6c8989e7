//! Remote live-audio session capability
//!
//! The core only defines the logical message shapes. Transport and framing
//! belong to the [`LiveConnector`] implementation (see
//! [`super::gemini::GeminiLiveConnector`]).

use tokio::sync::mpsc;

use super::audio::EncodedChunk;
use crate::Result;

/// One inbound unit from the remote model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMessage {
    /// Model speech to play
    pub audio: Option<EncodedChunk>,
    /// The user barged in; cut playback now
    pub interrupted: bool,
    /// Text of what the model is saying
    pub transcript: Option<String>,
}

/// Lifecycle and data events of a live session, in server order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Handshake completed; media may flow
    Open,
    Message(ServerMessage),
    /// Transport or protocol failure
    Error(String),
    /// Remote side closed the session
    Closed,
}

/// Outbound half of an established (or establishing) live session
pub trait LiveLink {
    /// Queue one media chunk for the remote model
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transport`] if the session is gone
    fn send(&self, chunk: EncodedChunk) -> Result<()>;

    /// Close the session; idempotent
    fn close(&self);
}

/// Capability to open live sessions
pub trait LiveConnector {
    /// Begin connecting
    ///
    /// Returns immediately. Readiness, inbound messages, errors and closure
    /// all arrive on `events`; `Open` marks the end of the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connect`] if the attempt cannot even be started
    fn connect(&self, events: mpsc::UnboundedSender<RemoteEvent>) -> Result<Box<dyn LiveLink>>;
}
