//! Sample-rate conversion between device rates and wire rates

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::{Error, Result};

/// Input frames fed to the resampler per call
///
/// Kept small so little audio is held back between pushes.
const CHUNK_FRAMES: usize = 128;

/// Sinc filter length in taps
const SINC_LEN: usize = 128;

/// Incremental resampler for a continuous mono stream
///
/// Filter state carries across pushes, so a stream fed in arbitrary pieces
/// converts as if it arrived in one piece. The filter delay is trimmed from
/// the start of the output so it lines up with the input.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    from: u32,
    to: u32,
    pending: Vec<f32>,
    delay: usize,
}

impl StreamResampler {
    /// Create a stream resampler from `from` Hz to `to` Hz
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed
    pub fn new(from: u32, to: u32) -> Result<Self> {
        if from == 0 || to == 0 {
            return Err(Error::Audio(format!(
                "resampler {from} -> {to} Hz: rates must be non-zero"
            )));
        }

        let params = SincInterpolationParameters {
            sinc_len: SINC_LEN,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler =
            SincFixedIn::<f32>::new(f64::from(to) / f64::from(from), 1.0, params, CHUNK_FRAMES, 1)
                .map_err(|e| Error::Audio(format!("resampler {from} -> {to} Hz: {e}")))?;
        let delay = resampler.output_delay();

        Ok(Self {
            resampler,
            from,
            to,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
            delay,
        })
    }

    /// Input and output rates
    #[must_use]
    pub const fn rates(&self) -> (u32, u32) {
        (self.from, self.to)
    }

    /// Feed samples and append any converted output to `out`
    ///
    /// # Errors
    ///
    /// Returns error if the resampler fails
    pub fn push(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let chunk: &[&[f32]] = &[&self.pending[..needed]];
            let frames = self
                .resampler
                .process(chunk, None)
                .map_err(|e| Error::Audio(e.to_string()))?;

            let skip = self.delay.min(frames[0].len());
            self.delay -= skip;
            out.extend_from_slice(&frames[0][skip..]);
            self.pending.drain(..needed);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_resampler_converges_on_ratio() {
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();
        let mut out = Vec::new();
        for _ in 0..48 {
            resampler.push(&[0.0; 1000], &mut out).unwrap();
        }
        // All but the held-back tail and the filter delay has been converted
        assert!(out.len() > 15800 && out.len() <= 16000);
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_pieces_convert_like_one_push() {
        let signal: Vec<f32> = (0..4000).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();

        let mut whole = Vec::new();
        StreamResampler::new(24000, 44100)
            .unwrap()
            .push(&signal, &mut whole)
            .unwrap();

        let mut pieces = Vec::new();
        let mut resampler = StreamResampler::new(24000, 44100).unwrap();
        for piece in signal.chunks(1001) {
            resampler.push(piece, &mut pieces).unwrap();
        }

        assert_eq!(pieces.len(), whole.len());
        for (a, b) in pieces.iter().zip(&whole) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_delay_trimmed_from_output() {
        let mut resampler = StreamResampler::new(24000, 48000).unwrap();
        let mut out = Vec::new();
        resampler.push(&[0.5; 2400], &mut out).unwrap();

        // Steady level reached well before the filter would have emitted
        // its untrimmed warm-up
        assert!((out[200] - 0.5).abs() < 0.02);
        assert_eq!(resampler.rates(), (24000, 48000));
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(StreamResampler::new(0, 16000).is_err());
    }
}
