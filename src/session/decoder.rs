//! Inbound audio decoding

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::audio::{AudioBuffer, DeviceState, OutputDevice, pcm};
use crate::{Error, Result};

/// Decode one base64 PCM16 fragment into a buffer on `device`
///
/// A suspended device is resumed first so the fragment isn't scheduled onto a
/// halted clock.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the device cannot be resumed, the payload is
/// not valid base64, its byte length is odd, or the buffer cannot be allocated
pub async fn decode(
    data: &str,
    sample_rate: u32,
    device: &mut dyn OutputDevice,
) -> Result<AudioBuffer> {
    if device.state() == DeviceState::Suspended {
        device
            .resume()
            .await
            .map_err(|e| Error::Decode(format!("output device would not resume: {e}")))?;
    }

    let bytes = STANDARD
        .decode(data)
        .map_err(|e| Error::Decode(format!("invalid base64 audio: {e}")))?;

    let samples = pcm::decode(&bytes).ok_or_else(|| {
        Error::Decode(format!("PCM16 payload has odd length {}", bytes.len()))
    })?;

    device
        .create_buffer(samples, sample_rate)
        .await
        .map_err(|e| Error::Decode(format!("buffer allocation failed: {e}")))
}
