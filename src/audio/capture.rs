//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::device::{AudioChunk, AudioInput};
use super::resample::StreamResampler;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per outbound capture block (~256ms at 16kHz)
pub const BLOCK_SIZE: usize = 4096;

/// Captures audio from the default input device in fixed-size blocks
pub struct MicrophoneInput {
    device: Device,
    config: StreamConfig,
    sample_rate: u32,
    block_size: usize,
    stream: Option<Stream>,
}

impl MicrophoneInput {
    /// Acquire the default input device
    ///
    /// Prefers a mono configuration at `sample_rate`; otherwise captures at
    /// the device default and resamples.
    ///
    /// # Errors
    ///
    /// Returns error if no input device is available or it cannot be queried
    pub fn open(sample_rate: u32, block_size: usize) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Acquisition("no input device available".to_string()))?;

        let native = device
            .supported_input_configs()
            .map_err(|e| Error::Acquisition(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            });

        let config = match native {
            Some(supported) => supported.with_sample_rate(SampleRate(sample_rate)).config(),
            None => device
                .default_input_config()
                .map_err(|e| Error::Acquisition(e.to_string()))?
                .config(),
        };

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            sample_rate,
            block_size,
            stream: None,
        })
    }
}

impl AudioInput for MicrophoneInput {
    fn start(&mut self, chunks: mpsc::UnboundedSender<AudioChunk>) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut chunker = BlockChunker::new(
            usize::from(self.config.channels),
            self.config.sample_rate.0,
            self.sample_rate,
            self.block_size,
        )?;

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for chunk in chunker.push(data) {
                        if chunks.send(chunk).is_err() {
                            return;
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Acquisition(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for MicrophoneInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Turns interleaved device callbacks into fixed-size mono blocks
pub struct BlockChunker {
    channels: usize,
    sample_rate: u32,
    block_size: usize,
    resampler: Option<StreamResampler>,
    mono: Vec<f32>,
    pending: Vec<f32>,
}

impl BlockChunker {
    /// Create a chunker for a device running at `device_rate` with `channels`
    ///
    /// # Errors
    ///
    /// Returns error if a resampler is needed and cannot be constructed
    pub fn new(
        channels: usize,
        device_rate: u32,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Self> {
        let resampler = if device_rate == sample_rate {
            None
        } else {
            Some(StreamResampler::new(device_rate, sample_rate)?)
        };

        Ok(Self {
            channels: channels.max(1),
            sample_rate,
            block_size,
            resampler,
            mono: Vec::new(),
            pending: Vec::with_capacity(block_size * 2),
        })
    }

    /// Feed one callback's worth of interleaved samples
    ///
    /// Returns every block completed by this input.
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<AudioChunk> {
        self.mono.clear();
        if self.channels == 1 {
            self.mono.extend_from_slice(interleaved);
        } else {
            let channels = self.channels as f32;
            self.mono.extend(
                interleaved
                    .chunks(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels),
            );
        }

        match &mut self.resampler {
            Some(resampler) => {
                if let Err(e) = resampler.push(&self.mono, &mut self.pending) {
                    tracing::error!(error = %e, "capture resampling failed");
                }
            }
            None => self.pending.extend_from_slice(&self.mono),
        }

        let mut blocks = Vec::new();
        while self.pending.len() >= self.block_size {
            let samples: Vec<f32> = self.pending.drain(..self.block_size).collect();
            blocks.push(AudioChunk {
                samples,
                sample_rate: self.sample_rate,
            });
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_emits_exact_blocks() {
        let mut chunker = BlockChunker::new(1, SAMPLE_RATE, SAMPLE_RATE, BLOCK_SIZE).unwrap();

        assert!(chunker.push(&[0.1; 3000]).is_empty());

        let blocks = chunker.push(&[0.1; 3000]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].samples.len(), BLOCK_SIZE);
        assert_eq!(blocks[0].sample_rate, SAMPLE_RATE);

        // 6000 - 4096 carried over, 2192 more completes the next block
        assert_eq!(chunker.push(&[0.1; 2192]).len(), 1);
    }

    #[test]
    fn test_chunker_downmixes_stereo() {
        let mut chunker = BlockChunker::new(2, SAMPLE_RATE, SAMPLE_RATE, 4).unwrap();
        let blocks = chunker.push(&[1.0, 0.0, 0.5, 0.5, -1.0, -1.0, 0.0, 0.2]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].samples, vec![0.5, 0.5, -1.0, 0.1]);
    }

    #[test]
    fn test_chunker_resamples_to_capture_rate() {
        let mut chunker = BlockChunker::new(1, 48000, SAMPLE_RATE, BLOCK_SIZE).unwrap();
        let mut total = 0;
        for _ in 0..30 {
            for block in chunker.push(&[0.0; 4800]) {
                assert_eq!(block.samples.len(), BLOCK_SIZE);
                total += block.samples.len();
            }
        }
        // 144000 device samples is 48000 capture samples: 11 full blocks
        assert_eq!(total / BLOCK_SIZE, 11);
    }
}
