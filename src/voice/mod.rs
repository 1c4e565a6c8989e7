//! Real-time voice core
//!
//! Capture and playback devices, the PCM codec, VAD, the playback scheduler,
//! the live duplex session, the wake-word listener, and the [`Arbiter`] that
//! decides which of the last two owns the microphone.

mod arbiter;
mod audio;
mod capture;
pub mod codec;
mod device;
mod gemini;
mod live;
mod playback;
mod recognizer;
mod scheduler;
mod segmenter;
mod session;
mod stt;
mod vad;
mod wake_word;

pub use arbiter::{
    Arbiter, ArbiterHandle, ArbiterOptions, MicOwner, Notification, Snapshot,
};
pub use audio::{
    AudioFrame, CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE, EncodedChunk, PCM_MIME_PREFIX,
    PlaybackBuffer, REMOTE_OUTPUT_SAMPLE_RATE, rms,
};
pub use capture::CpalCapture;
pub use device::{
    AudioDevices, BufferId, CaptureHandle, CpalDevices, OutputDevice, PlaybackSink,
};
pub use gemini::GeminiLiveConnector;
pub use live::{LiveConnector, LiveLink, RemoteEvent, ServerMessage};
pub use playback::CpalSink;
pub use recognizer::{
    RecognitionError, RecognitionEvent, RecognitionHandle, Recognizer, TranscribingRecognizer,
    UnavailableRecognizer,
};
pub use scheduler::{PlaybackScheduler, ScheduledBuffer};
pub use segmenter::{SEGMENT_ENERGY_THRESHOLD, SpeechSegmenter};
pub use session::{DuplexSession, SessionEvent, SessionInput, SessionState};
pub use stt::SpeechToText;
pub use vad::{DEFAULT_SPEECH_HOLD, DEFAULT_SPEECH_THRESHOLD, VoiceActivityDetector, VoiceSignal};
pub use wake_word::{ListenerOutcome, WakeState, WakeWordListener};
