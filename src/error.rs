//! Error types for the OhM voice core

use serde::Serialize;
use thiserror::Error;

/// Result type alias for voice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice core
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone or recognizer access denied
    #[error("permission denied: {0}")]
    Permission(String),

    /// Remote live session could not be established
    #[error("connect error: {0}")]
    Connect(String),

    /// Malformed inbound audio
    #[error("decode error: {0}")]
    Decode(String),

    /// Live session dropped mid-flight
    #[error("transport error: {0}")]
    Transport(String),

    /// Output device selection failed
    #[error("device error: {0}")]
    Device(String),

    /// Audio subsystem error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio settings outside the supported set
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Operation not allowed while a session holds the microphone
    #[error("a voice session is in progress")]
    SessionBusy,

    /// The voice runtime is no longer running
    #[error("voice runtime stopped")]
    RuntimeStopped,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Coarse error classification surfaced in notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permission,
    Connect,
    Decode,
    Transport,
    Device,
    Other,
}

impl Error {
    /// Classify this error for user-facing reporting
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Permission(_) => ErrorKind::Permission,
            Self::Connect(_) => ErrorKind::Connect,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Transport(_) | Self::WebSocket(_) => ErrorKind::Transport,
            Self::Device(_) => ErrorKind::Device,
            _ => ErrorKind::Other,
        }
    }
}
