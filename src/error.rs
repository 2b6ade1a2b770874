//! Error types for the live narration session

use thiserror::Error;

/// Result type alias for narrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a narration session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone or output device unavailable, or access denied
    #[error("device acquisition error: {0}")]
    Acquisition(String),

    /// Remote handshake or mid-session transport failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed inbound audio payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Frame snapshot error
    #[error("frame error: {0}")]
    Frame(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error ends the session
    ///
    /// Decode and frame errors only drop the offending chunk or snapshot.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_) | Self::Frame(_))
    }
}
