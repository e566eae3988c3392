//! Error types for each stage of the speak pipeline.
//!
//! Nearly all of these stop at the component that produced them and end up
//! as a log line; none are fatal to the playback worker or the GUI.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed, unreadable, or incomplete configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No voice config found (tried {0})")]
    NotFound(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failure to obtain audio from the remote synthesis API.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// DNS, connection, timeout or body read failure.
    #[error("Synthesis request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Any response other than HTTP 200.
    #[error("Synthesis API error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("Synthesis API returned an empty body")]
    EmptyBody,
}

/// Problems while loading or playing a queued file.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("File not found or invalid: {0}")]
    MissingFile(PathBuf),

    #[error("Failed to initialize audio output: {0}")]
    Init(String),

    #[error("Failed to play {path}: {reason}")]
    Play { path: PathBuf, reason: String },
}

/// Global hotkey listener errors.
#[derive(Debug, Error)]
pub enum HotkeyError {
    #[error(
        "No keyboards found. Make sure you're in the 'input' group: sudo usermod -aG input $USER"
    )]
    NoKeyboards,

    #[error("Unknown key '{token}' in shortcut '{combo}'")]
    UnknownKey { combo: String, token: String },

    #[error("Empty shortcut")]
    EmptyCombo,
}
