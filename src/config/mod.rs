//! Configuration management for the ohm voice daemon
//!
//! Precedence is env > toml > default, resolved once at startup.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::voice::{DEFAULT_SPEECH_HOLD, DEFAULT_SPEECH_THRESHOLD};

/// Gemini Live WebSocket endpoint
pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio live model
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Prebuilt voice the model speaks with
pub const DEFAULT_VOICE_NAME: &str = "Kore";

/// Persona instruction sent at setup
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are OhM, a helpful voice assistant. Keep responses short and conversational.";

/// Phrases that start a session in hands-free mode
pub const DEFAULT_WAKE_PHRASES: [&str; 2] = ["ohm", "start"];

/// Pause before the listener reacquires the microphone after a session
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Default control API port
pub const DEFAULT_PORT: u16 = 18791;

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote live session
    pub live: LiveConfig,

    /// Hands-free listener
    pub wake: WakeConfig,

    /// Speaking indicator
    pub vad: VadConfig,

    /// Control API
    pub server: ServerConfig,

    /// API keys for transcription services
    pub api_keys: ApiKeys,

    /// Directory holding persisted settings
    pub data_dir: PathBuf,
}

/// Live session configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: String,

    /// Gemini API key
    pub api_key: Option<String>,

    pub model: String,

    pub voice_name: String,

    pub system_instruction: String,

    /// How long `Connecting` may last before it counts as a connect failure
    pub connect_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice_name: DEFAULT_VOICE_NAME.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Transcription backend for the wake-word recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttProviderKind {
    #[default]
    Whisper,
    Deepgram,
}

impl SttProviderKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Some(Self::Whisper),
            "deepgram" => Some(Self::Deepgram),
            _ => None,
        }
    }

    /// Model used when none is configured
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Whisper => "whisper-1",
            Self::Deepgram => "nova-2",
        }
    }
}

/// Wake-word configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Lowercased trigger phrases
    pub phrases: Vec<String>,

    pub settle_delay: Duration,

    pub stt_provider: SttProviderKind,

    pub stt_model: String,

    /// Length of one recognition run
    pub session_length: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrases: DEFAULT_WAKE_PHRASES.iter().map(ToString::to_string).collect(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            stt_provider: SttProviderKind::Whisper,
            stt_model: SttProviderKind::Whisper.default_model().to_string(),
            session_length: Duration::from_secs(60),
        }
    }
}

/// VAD configuration
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub threshold: f32,
    pub hold: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SPEECH_THRESHOLD,
            hold: DEFAULT_SPEECH_HOLD,
        }
    }
}

/// Control API configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper)
    pub openai: Option<String>,

    /// `Deepgram` API key
    pub deepgram: Option<String>,
}

impl Config {
    /// Load configuration from the config file and process environment
    #[must_use]
    pub fn load() -> Self {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    #[must_use]
    pub fn from_sources(fc: file::OhmConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        // Live session (env > toml > default)
        let live_default = LiveConfig::default();
        let live = LiveConfig {
            endpoint: fc.live.endpoint.unwrap_or(live_default.endpoint),
            api_key: var("GEMINI_API_KEY")
                .or_else(|| var("API_KEY"))
                .or(fc.api_keys.gemini),
            model: var("OHM_LIVE_MODEL")
                .or(fc.live.model)
                .unwrap_or(live_default.model),
            voice_name: fc.live.voice.unwrap_or(live_default.voice_name),
            system_instruction: fc
                .live
                .system_instruction
                .unwrap_or(live_default.system_instruction),
            connect_timeout: fc
                .live
                .connect_timeout_secs
                .map_or(live_default.connect_timeout, Duration::from_secs),
        };

        // Wake word (toml > default)
        let wake_default = WakeConfig::default();
        let stt_provider = fc
            .wake
            .stt_provider
            .as_deref()
            .and_then(|s| {
                let parsed = SttProviderKind::parse(s);
                if parsed.is_none() {
                    tracing::warn!(provider = s, "unknown stt provider, using whisper");
                }
                parsed
            })
            .unwrap_or(wake_default.stt_provider);
        let phrases: Vec<String> = fc
            .wake
            .phrases
            .map(|p| {
                p.into_iter()
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect()
            })
            .filter(|p: &Vec<String>| !p.is_empty())
            .unwrap_or(wake_default.phrases);
        let wake = WakeConfig {
            phrases,
            settle_delay: fc
                .wake
                .settle_delay_ms
                .map_or(wake_default.settle_delay, Duration::from_millis),
            stt_provider,
            stt_model: fc
                .wake
                .stt_model
                .unwrap_or_else(|| stt_provider.default_model().to_string()),
            session_length: fc
                .wake
                .session_length_secs
                .map_or(wake_default.session_length, Duration::from_secs),
        };

        let vad_default = VadConfig::default();
        let vad = VadConfig {
            threshold: fc.vad.threshold.unwrap_or(vad_default.threshold),
            hold: fc.vad.hold_ms.map_or(vad_default.hold, Duration::from_millis),
        };

        let server = ServerConfig {
            port: var("OHM_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
        };

        let api_keys = ApiKeys {
            openai: var("OPENAI_API_KEY").or(fc.api_keys.openai),
            deepgram: var("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
        };

        // Determine data directory (~/.local/share/ohm on Linux)
        let data_dir = var("OHM_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        Self {
            live,
            wake,
            vad,
            server,
            api_keys,
            data_dir,
        }
    }

    /// Location of the persisted settings file
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    /// API key for the configured STT provider, if any
    #[must_use]
    pub fn stt_api_key(&self) -> Option<&str> {
        match self.wake.stt_provider {
            SttProviderKind::Whisper => self.api_keys.openai.as_deref(),
            SttProviderKind::Deepgram => self.api_keys.deepgram.as_deref(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(|| PathBuf::from(".ohm"), |d| d.data_dir().join("ohm"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(file::OhmConfigFile::default(), env_from(&[]));

        assert_eq!(config.live.model, DEFAULT_LIVE_MODEL);
        assert_eq!(config.live.voice_name, "Kore");
        assert!(config.live.api_key.is_none());
        assert_eq!(config.wake.phrases, vec!["ohm", "start"]);
        assert_eq!(config.wake.settle_delay, Duration::from_millis(500));
        assert_eq!(config.wake.stt_model, "whisper-1");
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!((config.vad.threshold - 0.015).abs() < f32::EPSILON);
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: file::OhmConfigFile = toml::from_str(
            r#"
            data_dir = "/from/file"
            [api_keys]
            gemini = "file-key"
            [server]
            port = 9000
            "#,
        )
        .unwrap();

        let config = Config::from_sources(
            fc,
            env_from(&[("GEMINI_API_KEY", "env-key"), ("OHM_PORT", "9100")]),
        );

        assert_eq!(config.live.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.data_dir, PathBuf::from("/from/file"));
        assert_eq!(config.settings_path(), PathBuf::from("/from/file/settings.json"));
    }

    #[test]
    fn test_api_key_fallback_name() {
        let config = Config::from_sources(
            file::OhmConfigFile::default(),
            env_from(&[("API_KEY", "plain")]),
        );
        assert_eq!(config.live.api_key.as_deref(), Some("plain"));
    }

    #[test]
    fn test_wake_section() {
        let fc: file::OhmConfigFile = toml::from_str(
            r#"
            [wake]
            phrases = ["  Hey Ohm ", ""]
            stt_provider = "deepgram"
            "#,
        )
        .unwrap();

        let config = Config::from_sources(fc, env_from(&[("DEEPGRAM_API_KEY", "dg")]));
        assert_eq!(config.wake.phrases, vec!["hey ohm"]);
        assert_eq!(config.wake.stt_provider, SttProviderKind::Deepgram);
        assert_eq!(config.wake.stt_model, "nova-2");
        assert_eq!(config.stt_api_key(), Some("dg"));
    }
}
