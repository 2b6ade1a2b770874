//! Duplex transport boundary
//!
//! A transport opens one connection to the narration service, accepts
//! outbound media in order, and reports everything the service sends as
//! typed events on a single ordered channel.

use std::ops::RangeInclusive;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;

use crate::Result;
use crate::audio::pcm;
use crate::config::SessionConfig;

/// MIME type for frame snapshots
pub const JPEG_MIME: &str = "image/jpeg";

/// One outbound unit of media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInput {
    /// MIME type, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,

    /// Base64-encoded payload
    pub data: String,
}

impl MediaInput {
    /// Encode a capture block as PCM16 media
    #[must_use]
    pub fn audio(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            mime_type: pcm_mime(sample_rate),
            data: STANDARD.encode(pcm::encode(samples)),
        }
    }

    /// Wrap an already base64-encoded JPEG snapshot
    #[must_use]
    pub fn jpeg(data: String) -> Self {
        Self {
            mime_type: JPEG_MIME.to_string(),
            data,
        }
    }

    /// Whether this carries audio
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// MIME type for raw PCM16 at `sample_rate`
#[must_use]
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Sample rates accepted from a MIME `rate=` parameter
pub const MIME_RATE_RANGE: RangeInclusive<u32> = 8_000..=192_000;

/// Extract the `rate=` parameter from an audio MIME type
///
/// Rates outside [`MIME_RATE_RANGE`] are ignored so the caller falls back to
/// its configured rate.
#[must_use]
pub fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|rate| MIME_RATE_RANGE.contains(rate))
}

/// Something the narration service sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Remote side confirmed the session configuration
    Opened,

    /// A base64 PCM16 audio fragment
    AudioReceived {
        /// Base64 payload
        data: String,
        /// Sample rate from the MIME type, if declared
        sample_rate: Option<u32>,
    },

    /// Text part of the model's turn
    Text(String),

    /// Prior speech is stale and must be discarded
    Interrupted,

    /// The model finished its turn
    TurnComplete,

    /// Connection closed
    Closed(Option<String>),

    /// Fatal transport failure
    ErrorOccurred(String),
}

/// Duplex connection to a narration service
#[async_trait]
pub trait Transport: Send {
    /// Open a connection and send the session configuration
    ///
    /// Returns the ordered receiver for everything the service sends. The
    /// session is usable once [`TransportEvent::Opened`] arrives on it.
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn open(&mut self, config: &SessionConfig) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Queue one media unit; units reach the wire in submission order
    ///
    /// # Errors
    ///
    /// Returns error if the connection is not open
    fn send_media(&self, media: MediaInput) -> Result<()>;

    /// Close the connection; safe to call repeatedly
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_media() {
        let media = MediaInput::audio(&[0.0, 1.0], 16000);
        assert_eq!(media.mime_type, "audio/pcm;rate=16000");
        assert!(media.is_audio());

        let bytes = STANDARD.decode(&media.data).unwrap();
        assert_eq!(bytes, vec![0, 0, 0xff, 0x7f]);
    }

    #[test]
    fn test_jpeg_media() {
        let media = MediaInput::jpeg("abcd".to_string());
        assert_eq!(media.mime_type, "image/jpeg");
        assert!(!media.is_audio());
    }

    #[test]
    fn test_mime_sample_rate() {
        assert_eq!(mime_sample_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(mime_sample_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(mime_sample_rate("audio/pcm"), None);
        assert_eq!(mime_sample_rate("audio/pcm;rate=fast"), None);
    }

    #[test]
    fn test_implausible_mime_rate_ignored() {
        assert_eq!(mime_sample_rate("audio/pcm;rate=1"), None);
        assert_eq!(mime_sample_rate("audio/pcm;rate=0"), None);
        assert_eq!(mime_sample_rate("audio/pcm;rate=500000"), None);
        assert_eq!(mime_sample_rate("audio/pcm;rate=8000"), Some(8000));
        assert_eq!(mime_sample_rate("audio/pcm;rate=192000"), Some(192_000));
    }
}
