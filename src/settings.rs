//! Persisted user preferences
//!
//! Preferences live in a flat key-value store. They are read once at startup
//! and written back on every change. Missing or unusable values fall back to
//! defaults instead of failing startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Sink id meaning "whatever the system routes to"
pub const DEFAULT_OUTPUT_DEVICE: &str = "default";

/// Output rates the playback path accepts
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [16000, 24000, 44100, 48000];

/// Default playback rate
pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

const KEY_OUTPUT_DEVICE: &str = "output_device_id";
const KEY_SAMPLE_RATE: &str = "sample_rate";
const KEY_CHANNEL_COUNT: &str = "channel_count";
const KEY_HANDS_FREE: &str = "hands_free_enabled";

/// Playback format and sink choice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub output_device_id: String,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            output_device_id: DEFAULT_OUTPUT_DEVICE.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channel_count: 1,
        }
    }
}

impl AudioSettings {
    /// Check the rate and channel count against the supported set
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] naming the offending field
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(Error::InvalidSettings(format!(
                "sample rate {} not in {SUPPORTED_SAMPLE_RATES:?}",
                self.sample_rate
            )));
        }
        if !matches!(self.channel_count, 1 | 2) {
            return Err(Error::InvalidSettings(format!(
                "channel count {} must be 1 or 2",
                self.channel_count
            )));
        }
        if self.output_device_id.trim().is_empty() {
            return Err(Error::InvalidSettings("output device id is empty".to_string()));
        }
        Ok(())
    }
}

/// Everything the user can toggle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub audio: AudioSettings,
    pub hands_free: bool,
}

impl Preferences {
    /// Read preferences, falling back per key on absent or invalid values
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let defaults = AudioSettings::default();

        let output_device_id = store
            .get(KEY_OUTPUT_DEVICE)
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(defaults.output_device_id);

        let sample_rate = parse_or(store, KEY_SAMPLE_RATE, defaults.sample_rate, |rate| {
            SUPPORTED_SAMPLE_RATES.contains(rate)
        });

        let channel_count = parse_or(store, KEY_CHANNEL_COUNT, defaults.channel_count, |c| {
            matches!(*c, 1 | 2)
        });

        let hands_free = parse_or(store, KEY_HANDS_FREE, false, |_| true);

        Self {
            audio: AudioSettings {
                output_device_id,
                sample_rate,
                channel_count,
            },
            hands_free,
        }
    }

    /// Write the audio settings
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot persist
    pub fn save_audio(store: &dyn KeyValueStore, audio: &AudioSettings) -> Result<()> {
        store.set(KEY_OUTPUT_DEVICE, &audio.output_device_id)?;
        store.set(KEY_SAMPLE_RATE, &audio.sample_rate.to_string())?;
        store.set(KEY_CHANNEL_COUNT, &audio.channel_count.to_string())
    }

    /// Write the hands-free toggle
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot persist
    pub fn save_hands_free(store: &dyn KeyValueStore, enabled: bool) -> Result<()> {
        store.set(KEY_HANDS_FREE, &enabled.to_string())
    }

    /// Write everything
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot persist
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        Self::save_audio(store, &self.audio)?;
        Self::save_hands_free(store, self.hands_free)
    }
}

fn parse_or<T>(store: &dyn KeyValueStore, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: std::str::FromStr,
{
    let Some(raw) = store.get(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid stored setting");
            default
        }
    }
}

/// Flat string key-value persistence
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be persisted
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory store (tests, `--ephemeral` runs)
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| Error::Config("settings store poisoned".to_string()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON object on disk, rewritten on every `set`
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// An unreadable file is logged and treated as empty.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = read_json_map(&path);
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    /// Backing file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_json_map(path: &Path) -> BTreeMap<String, String> {
    if !path.exists() {
        return BTreeMap::new();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse settings file, using defaults"
                );
                BTreeMap::new()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read settings file"
            );
            BTreeMap::new()
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| Error::Config("settings store poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&*values)?;
        std::fs::write(&self.path, content)?;

        tracing::debug!(key, value, path = %self.path.display(), "setting saved");
        Ok(())
    }
}
