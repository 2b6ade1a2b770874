//! Audio device capabilities used by the session
//!
//! The session never touches cpal directly. It acquires a capture device and
//! an output timeline through an [`AudioBackend`], so tests can run without
//! audio hardware.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Identifier of one scheduled playback unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block of mono capture samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Sample rate the block was produced at
    pub sample_rate: u32,
}

/// Decoded audio ready to be placed on an output timeline
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Samples at the output device's native rate
    pub frames: Arc<[f32]>,
    /// Playback length in seconds
    pub duration: f64,
}

/// Run state of an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Clock is advancing and scheduled units are audible
    Running,
    /// Clock is halted until [`OutputDevice::resume`] is called
    Suspended,
    /// Device has been released
    Closed,
}

/// Microphone capture
pub trait AudioInput {
    /// Start delivering fixed-size blocks to `chunks`
    ///
    /// # Errors
    ///
    /// Returns error if the capture stream cannot be started
    fn start(&mut self, chunks: mpsc::UnboundedSender<AudioChunk>) -> Result<()>;

    /// Stop capturing; safe to call repeatedly
    fn stop(&mut self);

    /// Rate of the delivered blocks
    fn sample_rate(&self) -> u32;
}

/// Output timeline with its own clock
///
/// Time values are seconds in the device's clock domain. Units started on the
/// device report completion on the channel given to
/// [`AudioBackend::open_output`].
#[async_trait(?Send)]
pub trait OutputDevice {
    /// Current run state
    fn state(&self) -> DeviceState;

    /// Resume a suspended device
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be restarted
    async fn resume(&mut self) -> Result<()>;

    /// Current clock reading in seconds
    fn current_time(&self) -> f64;

    /// Allocate a playable buffer from mono samples at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the buffer cannot be allocated
    async fn create_buffer(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<AudioBuffer>;

    /// Begin playing `buffer` at clock time `when`
    ///
    /// # Errors
    ///
    /// Returns error if the device is closed
    fn start(&mut self, id: UnitId, buffer: &AudioBuffer, when: f64) -> Result<()>;

    /// Stop a unit; a no-op if it already finished
    fn stop(&mut self, id: UnitId);

    /// Release the device; safe to call repeatedly
    ///
    /// # Errors
    ///
    /// Returns error if the underlying stream fails to shut down
    async fn close(&mut self) -> Result<()>;
}

/// Source of capture and output devices
pub trait AudioBackend {
    /// Acquire the microphone, delivering `block_size` samples at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no input device is available or access is denied
    fn open_input(&self, sample_rate: u32, block_size: usize) -> Result<Box<dyn AudioInput>>;

    /// Open an output timeline for audio at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    fn open_output(
        &self,
        sample_rate: u32,
        finished: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>>;
}
