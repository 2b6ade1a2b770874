//! Configuration management for the narrator
//!
//! Values come from an optional TOML file, then environment overrides, then
//! built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::audio::{BLOCK_SIZE, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE};
use crate::{Error, Result};

/// Default narration model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice (deep storytelling voice)
pub const DEFAULT_VOICE: &str = "Kore";

/// Default duplex endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default behavioral prompt for the narrator
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an enchanted theater narrator watching a shadow puppet show. \
The user is making hand shadows on a wall. As soon as you see the first image, describe what you see \
(rabbits, birds, wolves) and weave a short, whimsical story about them. If you don't see a clear shape yet, \
encourage the user to make one. Speak clearly and with wonder.";

/// Default interval between video frame snapshots
const DEFAULT_FRAME_INTERVAL_MS: u64 = 1500;

/// Default JPEG quality for frame snapshots
const DEFAULT_JPEG_QUALITY: u8 = 60;

/// Default bound on the longest side of a frame snapshot
const DEFAULT_MAX_FRAME_DIMENSION: u32 = 768;

/// Default websocket handshake timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Response modality requested from the narration service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    /// Synthesized speech
    #[default]
    Audio,
}

/// Configuration sent when a session opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Model identifier (without the `models/` prefix)
    pub model: String,

    /// Behavioral system prompt
    pub system_instruction: String,

    /// Prebuilt voice name
    pub voice: String,

    /// Response modality
    pub response_modality: Modality,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            response_modality: Modality::Audio,
        }
    }
}

/// Capture and playback parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// Capture rate sent on the wire
    pub input_sample_rate: u32,

    /// Rate of narration audio received from the service
    pub output_sample_rate: u32,

    /// Samples per outbound capture block
    pub block_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: SAMPLE_RATE,
            output_sample_rate: PLAYBACK_SAMPLE_RATE,
            block_size: BLOCK_SIZE,
        }
    }
}

/// Video frame snapshot parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Interval between snapshots while the session is open
    pub interval: Duration,

    /// JPEG quality (1-100)
    pub jpeg_quality: u8,

    /// Longest side of a snapshot in pixels
    pub max_dimension: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_dimension: DEFAULT_MAX_FRAME_DIMENSION,
        }
    }
}

/// Narrator configuration
#[derive(Debug)]
pub struct Config {
    /// API key for the narration service
    pub api_key: Option<SecretString>,

    /// Duplex endpoint URL (without the key query parameter)
    pub endpoint: String,

    /// Websocket handshake timeout
    pub connect_timeout: Duration,

    /// Session configuration sent on open
    pub session: SessionConfig,

    /// Audio parameters
    pub audio: AudioConfig,

    /// Frame snapshot parameters
    pub frames: FrameConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            session: SessionConfig::default(),
            audio: AudioConfig::default(),
            frames: FrameConfig::default(),
        }
    }
}

/// On-disk configuration; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_key: Option<String>,
    endpoint: Option<String>,
    model: Option<String>,
    voice: Option<String>,
    system_instruction: Option<String>,
    frame_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    max_frame_dimension: Option<u32>,
    connect_timeout_secs: Option<u64>,
}

/// Return the default config file location
///
/// Uses `~/.config/live-narrator/narrator.toml` on Linux
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "omni", "live-narrator")
        .map(|d| d.config_dir().join("narrator.toml"))
}

impl Config {
    /// Load configuration from a file and the process environment
    ///
    /// An explicit `path` must exist; the default location is optional.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or values are invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let content = match path {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("failed to read {}: {e}", path.display()))
            })?),
            None => default_config_path()
                .filter(|p| p.exists())
                .map(|p| {
                    tracing::debug!(path = %p.display(), "loading config file");
                    std::fs::read_to_string(&p)
                })
                .transpose()?,
        };

        Self::from_toml_str(content.as_deref().unwrap_or_default(), |key| {
            std::env::var(key).ok()
        })
    }

    /// Build configuration from TOML content and an environment lookup
    ///
    /// Environment values take precedence over file values.
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed or values are invalid
    pub fn from_toml_str<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: FileConfig = toml::from_str(content)?;
        let defaults = Self::default();

        let api_key = lookup("NARRATOR_API_KEY")
            .or_else(|| lookup("GEMINI_API_KEY"))
            .or(file.api_key)
            .filter(|k| !k.is_empty())
            .map(SecretString::from);

        let endpoint = lookup("NARRATOR_ENDPOINT")
            .or(file.endpoint)
            .unwrap_or(defaults.endpoint);

        let session = SessionConfig {
            model: lookup("NARRATOR_MODEL")
                .or(file.model)
                .unwrap_or(defaults.session.model),
            system_instruction: lookup("NARRATOR_PROMPT")
                .or(file.system_instruction)
                .unwrap_or(defaults.session.system_instruction),
            voice: lookup("NARRATOR_VOICE")
                .or(file.voice)
                .unwrap_or(defaults.session.voice),
            response_modality: Modality::Audio,
        };

        let frame_interval_ms = match lookup("NARRATOR_FRAME_INTERVAL_MS") {
            Some(raw) => Some(raw.parse::<u64>().map_err(|e| {
                Error::Config(format!("invalid NARRATOR_FRAME_INTERVAL_MS '{raw}': {e}"))
            })?),
            None => file.frame_interval_ms,
        };

        let frames = FrameConfig {
            interval: frame_interval_ms
                .map_or(defaults.frames.interval, Duration::from_millis),
            jpeg_quality: file.jpeg_quality.unwrap_or(defaults.frames.jpeg_quality),
            max_dimension: file
                .max_frame_dimension
                .unwrap_or(defaults.frames.max_dimension),
        };

        let connect_timeout = file
            .connect_timeout_secs
            .map_or(defaults.connect_timeout, Duration::from_secs);

        let config = Self {
            api_key,
            endpoint,
            connect_timeout,
            session,
            audio: defaults.audio,
            frames,
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.frames.interval.is_zero() {
            return Err(Error::Config("frame interval must be non-zero".to_string()));
        }
        if !(1..=100).contains(&self.frames.jpeg_quality) {
            return Err(Error::Config(format!(
                "jpeg quality must be 1-100, got {}",
                self.frames.jpeg_quality
            )));
        }
        if self.frames.max_dimension == 0 {
            return Err(Error::Config("max frame dimension must be non-zero".to_string()));
        }
        if self.session.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(Error::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                self.endpoint
            )));
        }
        Ok(())
    }
}
