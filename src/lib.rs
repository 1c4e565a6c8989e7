//! Ohm - hands-free, full-duplex voice sessions with a live speech model
//!
//! This library provides the voice core behind the `ohm` daemon:
//! - PCM codec, voice activity detection and gapless playback scheduling
//! - Duplex sessions streaming the microphone to a live model
//! - A wake-word listener that starts sessions hands-free
//! - The arbiter that keeps the two from ever sharing the microphone
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              HTTP / WebSocket control API            │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ArbiterHandle
//! ┌────────────────────▼────────────────────────────────┐
//! │                     Arbiter                          │
//! │   WakeWordListener  ⇄  mic  ⇄  DuplexSession         │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │                              │
//! ┌──────────▼──────────┐        ┌──────────▼──────────┐
//! │  Capture / STT      │        │  Live model / Sink   │
//! └─────────────────────┘        └─────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod settings;
pub mod voice;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use settings::{AudioSettings, JsonFileStore, KeyValueStore, MemoryStore, Preferences};
