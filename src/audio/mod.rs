//! Audio module
//!
//! PCM16 conversion, resampling, and the capture/playback devices the
//! session streams through.

pub mod device;
pub mod pcm;
pub mod resample;

mod capture;
mod playback;

use tokio::sync::mpsc;

pub use capture::{BLOCK_SIZE, BlockChunker, MicrophoneInput, SAMPLE_RATE};
pub use device::{
    AudioBackend, AudioBuffer, AudioChunk, AudioInput, DeviceState, OutputDevice, UnitId,
};
pub use playback::{PLAYBACK_SAMPLE_RATE, SpeakerOutput};

use crate::Result;

/// Audio backend using the platform default devices via cpal
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(&self, sample_rate: u32, block_size: usize) -> Result<Box<dyn AudioInput>> {
        Ok(Box::new(MicrophoneInput::open(sample_rate, block_size)?))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        finished: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(SpeakerOutput::open(sample_rate, finished)?))
    }
}
