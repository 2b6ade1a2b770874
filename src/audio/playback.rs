//! Audio playback to speakers
//!
//! The output stream renders a mix of scheduled units against a sample clock
//! that advances only while the stream is running, so start times can be
//! placed exactly on the device timeline. Units that continue the queued
//! audio are joined on the frame where the previous one ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::device::{AudioBuffer, DeviceState, OutputDevice, UnitId};
use super::resample::StreamResampler;
use crate::{Error, Result};

/// Sample rate for playback (matches narration audio output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// One unit placed on the timeline
struct Voice {
    id: UnitId,
    start_frame: u64,
    frames: Arc<[f32]>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.frames.len() as u64
    }
}

/// Timeline state shared with the output callback
struct Mixer {
    frames_rendered: u64,
    /// Frame where the last queued voice ends
    timeline_end: u64,
    voices: Vec<Voice>,
    finished: mpsc::UnboundedSender<UnitId>,
}

impl Mixer {
    fn new(finished: mpsc::UnboundedSender<UnitId>) -> Self {
        Self {
            frames_rendered: 0,
            timeline_end: 0,
            voices: Vec::new(),
            finished,
        }
    }

    /// Whether queued audio is still ahead of the render clock
    const fn is_busy(&self) -> bool {
        self.timeline_end > self.frames_rendered
    }

    /// Queue a voice and return its start frame
    ///
    /// A voice that continues the queued audio starts on the frame where the
    /// timeline ends. Anything else starts at `requested`. Neither may start
    /// behind the render clock.
    fn place(&mut self, id: UnitId, frames: Arc<[f32]>, requested: u64, continues: bool) -> u64 {
        let start_frame = if continues {
            self.timeline_end
        } else {
            requested
        }
        .max(self.frames_rendered);

        let voice = Voice {
            id,
            start_frame,
            frames,
        };
        self.timeline_end = self.timeline_end.max(voice.end_frame());
        self.voices.push(voice);
        start_frame
    }

    fn remove(&mut self, id: UnitId) {
        self.voices.retain(|voice| voice.id != id);
        self.timeline_end = self
            .voices
            .iter()
            .map(Voice::end_frame)
            .max()
            .unwrap_or(self.frames_rendered);
    }

    /// Render interleaved output and retire voices that have played out
    fn render(&mut self, data: &mut [f32], channels: usize) {
        let start = self.frames_rendered;
        let mut rendered = 0u64;

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            let clock = start + i as u64;
            let mut mixed = 0.0f32;

            for voice in &self.voices {
                if clock >= voice.start_frame && clock < voice.end_frame() {
                    #[allow(clippy::cast_possible_truncation)]
                    let offset = (clock - voice.start_frame) as usize;
                    mixed += voice.frames[offset];
                }
            }

            let sample = mixed.clamp(-1.0, 1.0);
            for out in frame.iter_mut() {
                *out = sample;
            }
            rendered += 1;
        }

        self.frames_rendered += rendered;

        let now = self.frames_rendered;
        let finished = &self.finished;
        self.voices.retain(|voice| {
            if voice.end_frame() <= now {
                let _ = finished.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Plays scheduled audio units to the default output device
pub struct SpeakerOutput {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    mixer: Arc<Mutex<Mixer>>,
    stalled: Arc<AtomicBool>,
    /// Converts inbound audio to the device rate as one continuous stream
    inbound: Option<StreamResampler>,
    /// Output-clock time where the last started unit ends
    chain_end: f64,
}

impl SpeakerOutput {
    /// Open the default output device and start its clock
    ///
    /// Prefers a configuration at `sample_rate`; otherwise runs at the device
    /// default and resamples buffers as they are allocated.
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available or the stream fails
    pub fn open(sample_rate: u32, finished: mpsc::UnboundedSender<UnitId>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Acquisition("no output device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let native = device
            .supported_output_configs()
            .map_err(|e| Error::Acquisition(e.to_string()))?
            .find(|c| supports_rate(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports_rate(c, 2))
            });

        let config = match native {
            Some(supported) => supported.with_sample_rate(SampleRate(sample_rate)).config(),
            None => device
                .default_output_config()
                .map_err(|e| Error::Acquisition(e.to_string()))?
                .config(),
        };

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        let mut output = Self {
            device,
            config,
            stream: None,
            mixer: Arc::new(Mutex::new(Mixer::new(finished))),
            stalled: Arc::new(AtomicBool::new(false)),
            inbound: None,
            chain_end: 0.0,
        };
        output.build_stream()?;

        Ok(output)
    }

    /// Device clock rate
    #[must_use]
    pub const fn device_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn build_stream(&mut self) -> Result<()> {
        let channels = usize::from(self.config.channels);
        let mixer = Arc::clone(&self.mixer);
        let stalled = Arc::clone(&self.stalled);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Ok(mut mixer) = mixer.lock() {
                        mixer.render(data, channels);
                    } else {
                        data.fill(0.0);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    stalled.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Convert inbound samples to the device rate
    ///
    /// Buffers arriving while queued audio is still playing continue the
    /// previous resampler state so there is no seam between them.
    #[allow(clippy::future_not_send)]
    async fn resample_inbound(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<Vec<f32>> {
        let device_rate = self.device_rate();
        let busy = self.mixer.lock().is_ok_and(|mixer| mixer.is_busy());

        let resampler = match self.inbound.take() {
            Some(resampler) if busy && resampler.rates() == (sample_rate, device_rate) => resampler,
            _ => StreamResampler::new(sample_rate, device_rate)?,
        };

        let (resampler, frames) = tokio::task::spawn_blocking(move || {
            let mut resampler = resampler;
            let mut frames = Vec::with_capacity(samples.len() * 2);
            let result = resampler.push(&samples, &mut frames).map(|()| frames);
            (resampler, result)
        })
        .await
        .map_err(|e| Error::Audio(e.to_string()))?;

        self.inbound = Some(resampler);
        frames
    }
}

#[async_trait(?Send)]
impl OutputDevice for SpeakerOutput {
    fn state(&self) -> DeviceState {
        if self.stream.is_none() {
            DeviceState::Closed
        } else if self.stalled.load(Ordering::SeqCst) {
            DeviceState::Suspended
        } else {
            DeviceState::Running
        }
    }

    async fn resume(&mut self) -> Result<()> {
        let Some(stream) = &self.stream else {
            return Err(Error::Audio("output device is closed".to_string()));
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stalled.store(false, Ordering::SeqCst);
        tracing::debug!("audio playback resumed");
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        let frames = self.mixer.lock().map_or(0, |m| m.frames_rendered);
        frames as f64 / f64::from(self.device_rate())
    }

    #[allow(clippy::cast_precision_loss)]
    async fn create_buffer(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<AudioBuffer> {
        if self.stream.is_none() {
            return Err(Error::Audio("output device is closed".to_string()));
        }
        if sample_rate == 0 {
            return Err(Error::Audio("buffer sample rate must be non-zero".to_string()));
        }

        let duration = samples.len() as f64 / f64::from(sample_rate);
        let device_rate = self.device_rate();

        let frames = if sample_rate == device_rate {
            samples
        } else {
            self.resample_inbound(samples, sample_rate).await?
        };

        Ok(AudioBuffer {
            frames: frames.into(),
            duration,
        })
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn start(&mut self, id: UnitId, buffer: &AudioBuffer, when: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::Audio("output device is closed".to_string()));
        }

        let rate = f64::from(self.device_rate());
        let requested = (when.max(0.0) * rate).round() as u64;
        let continues = ((when - self.chain_end) * rate).abs() < 0.5;

        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| Error::Audio("playback mixer poisoned".to_string()))?;
        let start_frame = mixer.place(id, Arc::clone(&buffer.frames), requested, continues);
        drop(mixer);

        self.chain_end = when + buffer.duration;
        tracing::trace!(id = id.0, start_frame, continues, "unit queued");
        Ok(())
    }

    fn stop(&mut self, id: UnitId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.remove(id);
        }
        // Held samples belong to the stopped audio
        self.inbound = None;
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            if let Ok(mut mixer) = self.mixer.lock() {
                mixer.voices.clear();
                mixer.timeline_end = mixer.frames_rendered;
            }
            self.inbound = None;
            drop(stream);
            tracing::debug!("audio playback closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: u64, start_frame: u64, frames: &[f32]) -> Voice {
        Voice {
            id: UnitId(id),
            start_frame,
            frames: frames.into(),
        }
    }

    #[test]
    fn test_mixer_plays_units_back_to_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);
        mixer.voices.push(voice(1, 0, &[0.1, 0.1]));
        mixer.voices.push(voice(2, 2, &[0.2, 0.2]));

        let mut out = [0.0f32; 4];
        mixer.render(&mut out, 1);

        assert_eq!(out, [0.1, 0.1, 0.2, 0.2]);
        assert_eq!(mixer.frames_rendered, 4);
        assert_eq!(rx.try_recv().unwrap(), UnitId(1));
        assert_eq!(rx.try_recv().unwrap(), UnitId(2));
        assert!(mixer.voices.is_empty());
    }

    #[test]
    fn test_mixer_waits_for_future_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);
        mixer.voices.push(voice(7, 3, &[0.5]));

        let mut out = [1.0f32; 4];
        mixer.render(&mut out, 2);

        // Two stereo frames of silence, unit not reached yet
        assert_eq!(out, [0.0; 4]);
        assert!(rx.try_recv().is_err());
        assert_eq!(mixer.voices.len(), 1);
    }

    #[test]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn test_resampled_fragments_join_without_seams() {
        const DEVICE_RATE: u32 = 44_100;
        const FRAGMENT: usize = 1001;

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);
        let mut resampler = StreamResampler::new(PLAYBACK_SAMPLE_RATE, DEVICE_RATE).unwrap();

        let mut previous_end = None;
        for k in 0..10u64 {
            let mut frames = Vec::new();
            resampler.push(&[0.5; FRAGMENT], &mut frames).unwrap();

            let when = (k * FRAGMENT as u64) as f64 / f64::from(PLAYBACK_SAMPLE_RATE);
            let requested = (when * f64::from(DEVICE_RATE)).round() as u64;
            let start = mixer.place(UnitId(k), frames.into(), requested, k > 0);

            if let Some(end) = previous_end {
                assert_eq!(start, end);
            }
            previous_end = Some(mixer.timeline_end);
        }

        let total = mixer.timeline_end as usize;
        let mut out = vec![0.0f32; total];
        mixer.render(&mut out, 1);

        // Past the filter warm-up the level never dips or doubles
        for (i, sample) in out.iter().enumerate().skip(256) {
            assert!((sample - 0.5).abs() < 0.05, "frame {i} is {sample}");
        }
        assert!(mixer.voices.is_empty());
    }

    #[test]
    fn test_late_start_clamped_to_render_clock() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);

        let mut out = [0.0f32; 10];
        mixer.render(&mut out, 1);

        // Requested before the clock: starts now, plays in full
        let start = mixer.place(UnitId(1), Arc::from([0.3f32; 4].as_slice()), 6, false);
        assert_eq!(start, 10);

        let mut out = [0.0f32; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, [0.3; 4]);
    }

    #[test]
    fn test_stop_rewinds_timeline_end() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(tx);
        mixer.place(UnitId(1), Arc::from([0.1f32; 8].as_slice()), 0, false);
        mixer.place(UnitId(2), Arc::from([0.1f32; 8].as_slice()), 0, true);
        assert_eq!(mixer.timeline_end, 16);

        mixer.remove(UnitId(2));
        assert_eq!(mixer.timeline_end, 8);
        mixer.remove(UnitId(1));
        assert!(!mixer.is_busy());
    }
}
