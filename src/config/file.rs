//! TOML configuration file loading
//!
//! Supports `~/.config/ohm/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct OhmConfigFile {
    /// Remote live session
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Hands-free listener
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Speaking indicator
    #[serde(default)]
    pub vad: VadFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Control API
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Where persisted settings live
    pub data_dir: Option<String>,
}

/// Live session configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint without the key parameter
    pub endpoint: Option<String>,

    /// Model identifier (e.g. "gemini-2.5-flash-native-audio-preview-09-2025")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Kore")
    pub voice: Option<String>,

    /// System instruction sent at setup
    pub system_instruction: Option<String>,

    /// Handshake timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

/// Wake-word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Trigger phrases, matched case-insensitively
    pub phrases: Option<Vec<String>>,

    /// Pause between a session ending and the listener reacquiring the mic
    pub settle_delay_ms: Option<u64>,

    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: Option<String>,

    /// Length of one recognition run before it ends and restarts
    pub session_length_secs: Option<u64>,
}

/// VAD configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    /// RMS threshold
    pub threshold: Option<f32>,

    /// Hold time after the last loud frame
    pub hold_ms: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub gemini: Option<String>,
    pub openai: Option<String>,
    pub deepgram: Option<String>,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,
}

/// Load the TOML config file from the standard path
///
/// Returns `OhmConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> OhmConfigFile {
    config_file_path().map_or_else(OhmConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Same fallback rules as [`load_config_file`].
pub fn load_config_from(path: &Path) -> OhmConfigFile {
    if !path.exists() {
        return OhmConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                OhmConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            OhmConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/ohm/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("ohm").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let config: OhmConfigFile = toml::from_str(
            r#"
            [wake]
            phrases = ["computer"]
            settle_delay_ms = 800

            [vad]
            threshold = 0.02
            "#,
        )
        .unwrap();

        assert_eq!(config.wake.phrases, Some(vec!["computer".to_string()]));
        assert_eq!(config.wake.settle_delay_ms, Some(800));
        assert_eq!(config.vad.threshold, Some(0.02));
        assert!(config.live.model.is_none());
        assert!(config.server.port.is_none());
    }

    #[test]
    fn test_unparseable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[wake\nphrases = ").unwrap();

        let config = load_config_from(&path);
        assert!(config.wake.phrases.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = load_config_from(Path::new("/nonexistent/ohm/config.toml"));
        assert!(config.data_dir.is_none());
    }
}
