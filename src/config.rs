//! Configuration management for quick-tts.
//!
//! The voice config is a JSON object with uppercase keys (`BASE_URL`,
//! `VOICE`, ...) and is validated once at startup. The shortcut file is a
//! JSON array of `{key, text}` objects.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ConfigError;

fn default_output_format() -> String {
    "audio-24khz-48kbitrate-mono-mp3".into()
}

fn default_style() -> String {
    "general".into()
}

fn default_language() -> String {
    "zh-CN".into()
}

fn default_api_key_header() -> String {
    "FFCafe-Access-Token".into()
}

/// Accepts `"10"`, `"-5"`, `10` or `-5`.
fn de_percent<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Percent {
        Int(i32),
        Str(String),
    }

    match Percent::deserialize(deserializer)? {
        Percent::Int(n) => Ok(n),
        Percent::Str(s) => s
            .trim()
            .trim_end_matches('%')
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid percentage '{s}': {e}"))),
    }
}

/// Voice and API settings for the synthesis service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VoiceConfig {
    #[serde(rename = "BASE_URL")]
    pub base_url: String,
    #[serde(rename = "API_ENDPOINT")]
    pub api_endpoint: String,
    #[serde(rename = "API_KEY")]
    pub api_key: String,
    #[serde(rename = "API_KEY_HEADER", default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(rename = "OUTPUT_FORMAT", default = "default_output_format")]
    pub output_format: String,
    #[serde(rename = "VOICE")]
    pub voice: String,
    #[serde(rename = "VOICE_STYLE", default = "default_style")]
    pub style: String,
    /// Signed percentage relative to the voice's normal rate.
    #[serde(rename = "SPEED", default, deserialize_with = "de_percent")]
    pub speed: i32,
    #[serde(rename = "PITCH", default, deserialize_with = "de_percent")]
    pub pitch: i32,
    #[serde(rename = "LANGUAGE", default = "default_language")]
    pub language: String,
    #[serde(rename = "STORED_FILEPATH")]
    pub storage_dir: PathBuf,
}

impl VoiceConfig {
    /// Load and validate the voice config.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config/sound_model.json
    /// 2. ~/.config/quick-tts/sound_model.json
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates: Vec<PathBuf> = match path {
            Some(p) => vec![p.to_path_buf()],
            None => [
                std::env::current_dir()
                    .ok()
                    .map(|d| d.join("config").join("sound_model.json")),
                dirs::home_dir().map(|h| h.join(".config/quick-tts/sound_model.json")),
            ]
            .into_iter()
            .flatten()
            .collect(),
        };

        let Some(config_path) = candidates.iter().find(|p| p.exists()) else {
            let tried = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfigError::NotFound(tried));
        };

        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let config = Self::from_json(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: config_path.clone(),
                source,
            },
            other => other,
        })?;

        info!("Loaded voice config from {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a voice config document.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "BASE_URL",
                reason: format!("'{}' is not an http(s) URL", self.base_url),
            });
        }
        if self.voice.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "VOICE",
                reason: "must not be empty".into(),
            });
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "STORED_FILEPATH",
                reason: "must not be empty".into(),
            });
        }
        if self.api_key_header.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "API_KEY_HEADER",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn full_api_url(&self) -> String {
        format!("{}{}", self.base_url, self.api_endpoint)
    }

    /// Whether the markup needs an `express-as` style wrapper.
    pub fn has_style(&self) -> bool {
        let style = self.style.trim();
        !style.is_empty() && !style.eq_ignore_ascii_case("general")
    }

    /// File extension for cached audio, derived from `OUTPUT_FORMAT`.
    pub fn audio_extension(&self) -> &'static str {
        let format = self.output_format.to_ascii_lowercase();
        if format.ends_with("mp3") {
            "mp3"
        } else if format.starts_with("riff-") || format.starts_with("raw-") {
            "wav"
        } else if format.starts_with("ogg-") {
            "ogg"
        } else if format.starts_with("webm-") {
            "webm"
        } else {
            "mp3"
        }
    }
}

#[cfg(test)]
impl VoiceConfig {
    pub(crate) fn for_tests(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: "http://localhost".into(),
            api_endpoint: "/tts".into(),
            api_key: "k".into(),
            api_key_header: default_api_key_header(),
            output_format: default_output_format(),
            voice: "A".into(),
            style: default_style(),
            speed: 0,
            pitch: 0,
            language: default_language(),
            storage_dir: storage_dir.into(),
        }
    }
}

/// One `{key, text}` item from the shortcut file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutEntry {
    pub key: String,
    pub text: String,
}

/// Default shortcut file location.
pub fn default_shortcut_path() -> PathBuf {
    PathBuf::from("shortcut_key.json")
}

/// Load shortcut entries in file order.
///
/// A missing file gets an example written in its place and yields no
/// entries. An unreadable or non-array file yields no entries and is left
/// untouched. Invalid items are skipped individually.
pub fn load_shortcuts(path: &Path) -> Vec<ShortcutEntry> {
    if !path.exists() {
        warn!("Shortcut file not found: {}", path.display());
        write_example_shortcuts(path);
        return Vec::new();
    }

    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read {}: {e}", path.display());
            return Vec::new();
        }
    };

    let value: serde_json::Value = match serde_json::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to parse {}: {e}", path.display());
            return Vec::new();
        }
    };

    let serde_json::Value::Array(items) = value else {
        warn!(
            "Shortcut file {} must contain a JSON array of objects",
            path.display()
        );
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ShortcutEntry>(item.clone()) {
            Ok(entry) => Some(entry),
            Err(_) => {
                warn!("Invalid shortcut item: {item}. Skipping.");
                None
            }
        })
        .collect()
}

fn example_shortcuts() -> Vec<ShortcutEntry> {
    [
        ("<ctrl>+<alt>+1", "Hello, world!"),
        ("<ctrl>+<alt>+2", "This is a test phrase."),
        ("<ctrl>+<alt>+3", "Shortcuts are working."),
    ]
    .into_iter()
    .map(|(key, text)| ShortcutEntry {
        key: key.into(),
        text: text.into(),
    })
    .collect()
}

fn write_example_shortcuts(path: &Path) {
    let json = match serde_json::to_string_pretty(&example_shortcuts()) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize example shortcuts: {e}");
            return;
        }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("Failed to create {}: {e}", parent.display());
            return;
        }
    }
    match fs::write(path, json) {
        Ok(()) => info!("Example shortcut file created at: {}", path.display()),
        Err(e) => warn!("Failed to create example file {}: {e}", path.display()),
    }
}
