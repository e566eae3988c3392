//! Content-addressed audio cache.
//!
//! Files live flat under the configured storage directory as
//! `{32 hex chars}.{ext}`. Existence of the file is the only state: there is
//! no manifest, no expiry and no size bound.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::VoiceConfig;

/// Hex digest over every parameter that affects the synthesized audio.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash of voice, style, speed, pitch and text, in that order.
    ///
    /// Each field is length-prefixed so adjacent fields cannot run together.
    pub fn derive(voice: &VoiceConfig, text: &str) -> Self {
        let speed = voice.speed.to_string();
        let pitch = voice.pitch.to_string();
        let mut hasher = Sha256::new();
        for field in [voice.voice.as_str(), &voice.style, &speed, &pitch, text] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct AudioCache {
    dir: PathBuf,
    extension: String,
}

impl AudioCache {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn for_voice(voice: &VoiceConfig) -> Self {
        Self::new(voice.storage_dir.clone(), voice.audio_extension())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic location for a key, whether or not it exists yet.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{}", self.extension))
    }

    /// Path of the cached file if a regular file exists for `key`.
    ///
    /// Contents are not verified; a truncated file counts as a hit.
    pub fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let path = self.path_for(key);
        path.is_file().then_some(path)
    }

    /// Write `bytes` under `key`, replacing any existing entry.
    ///
    /// The data goes to a sibling `.part` file first and is renamed into
    /// place, so readers never see a half-written file under the final name.
    pub fn store(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let partial = self.dir.join(format!("{key}.{}.part", self.extension));
        fs::write(&partial, bytes)?;
        if let Err(e) = fs::rename(&partial, &path) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        debug!("Cached {} bytes at {}", bytes.len(), path.display());
        Ok(path)
    }
}
