//! PCM16 sample conversion for the wire format

/// Scale applied when converting f32 amplitudes to i16
const ENCODE_SCALE: f32 = 32767.0;

/// Divisor applied when converting i16 samples back to f32
const DECODE_SCALE: f32 = 32768.0;

/// Encode f32 samples in `[-1.0, 1.0]` as little-endian 16-bit signed PCM
///
/// Samples are clamped before scaling so full-scale input never wraps.
/// NaN samples are written as silence.
#[must_use]
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Decode little-endian 16-bit signed PCM into f32 samples
///
/// Returns `None` if the byte length is not a multiple of 2.
#[must_use]
pub fn decode(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return None;
    }

    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / DECODE_SCALE)
            .collect(),
    )
}

/// Convert one amplitude to an i16 sample, truncating toward zero
#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * ENCODE_SCALE) as i16
}

/// Root-mean-square energy of a block of samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_twice_input_length() {
        let samples = vec![0.1f32; 4096];
        assert_eq!(encode(&samples).len(), 8192);
    }

    #[test]
    fn test_full_scale_does_not_wrap() {
        let bytes = encode(&[1.0, -1.0, 1.5, -3.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![32767, -32767, 32767, -32767]);
    }

    #[test]
    fn test_nan_encodes_as_silence() {
        assert_eq!(encode(&[f32::NAN, 0.5]), {
            let mut expected = vec![0, 0];
            expected.extend_from_slice(&16383i16.to_le_bytes());
            expected
        });
    }

    #[test]
    fn test_silence_roundtrip() {
        let decoded = decode(&encode(&[0.0; 64])).unwrap();
        assert_eq!(decoded.len(), 64);
        assert!(decoded.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_decode_scale() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&i16::MIN.to_le_bytes());
        bytes.extend_from_slice(&16384i16.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap(), vec![-1.0, 0.5]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        assert!(decode(&[0, 0, 1]).is_none());
        assert_eq!(decode(&[]).unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn test_rms() {
        assert!(rms(&[0.0; 100]) < 0.001);
        assert!(rms(&[0.5; 100]) > 0.4);
        assert!(rms(&[]) < f32::EPSILON);
    }
}
