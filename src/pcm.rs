//! PCM
//!
//! The fixed audio contract at the call boundary: 32-bit float, mono,
//! 44.1 kHz. Raw bytes are little-endian.

use std::borrow::Cow;

use thiserror::Error;

use crate::pipeline::SAMPLE_RATE;

const FLOAT_WIDTH: usize = 4;

/// Errors raised when audio does not match the fixed PCM profile.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnsupportedFormatError {
    /// Samples are not 32-bit floats.
    #[error("expected 32-bit float samples, got {bits} bits per sample")]
    SampleWidth {
        /// The rejected width.
        bits: u16,
    },

    /// Audio is not mono.
    #[error("expected mono audio, got {channels} channels")]
    Channels {
        /// The rejected channel count.
        channels: u16,
    },

    /// Audio is not sampled at 44.1 kHz.
    #[error("expected a {expected} Hz sample rate, got {got} Hz")]
    SampleRate {
        /// The fixed sample rate.
        expected: u32,
        /// The rejected sample rate.
        got: u32,
    },

    /// The byte buffer does not hold a whole number of samples.
    #[error("buffer of {len} bytes is not a multiple of the {width}-byte sample width")]
    Misaligned {
        /// Buffer length in bytes.
        len: usize,
        /// Sample width in bytes.
        width: usize,
    },
}

/// Describes the layout of a raw audio buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    /// Samples per second.
    pub sample_rate: u32,
    /// Bits per sample.
    pub bits_per_sample: u16,
    /// Interleaved channel count.
    pub num_channels: u16,
}

impl PcmFormat {
    /// The one supported profile.
    pub const SUPPORTED: PcmFormat = PcmFormat {
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        num_channels: 1,
    };

    /// Describe a buffer layout.
    pub const fn new(sample_rate: u32, bits_per_sample: u16, num_channels: u16) -> Self {
        PcmFormat {
            sample_rate,
            bits_per_sample,
            num_channels,
        }
    }

    /// Check this layout against the supported profile.
    pub fn validate(&self) -> Result<(), UnsupportedFormatError> {
        if self.bits_per_sample != Self::SUPPORTED.bits_per_sample {
            return Err(UnsupportedFormatError::SampleWidth {
                bits: self.bits_per_sample,
            });
        }
        if self.num_channels != Self::SUPPORTED.num_channels {
            return Err(UnsupportedFormatError::Channels {
                channels: self.num_channels,
            });
        }
        if self.sample_rate != Self::SUPPORTED.sample_rate {
            return Err(UnsupportedFormatError::SampleRate {
                expected: Self::SUPPORTED.sample_rate,
                got: self.sample_rate,
            });
        }
        Ok(())
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::SUPPORTED
    }
}

/// Interpret `bytes` as mono float samples.
///
/// Borrows the buffer in place when it is suitably aligned on a
/// little-endian target, and copies otherwise.
pub fn decode<'a>(
    bytes: &'a [u8],
    format: &PcmFormat,
) -> Result<Cow<'a, [f32]>, UnsupportedFormatError> {
    format.validate()?;
    if bytes.len() % FLOAT_WIDTH != 0 {
        return Err(UnsupportedFormatError::Misaligned {
            len: bytes.len(),
            width: FLOAT_WIDTH,
        });
    }

    #[cfg(target_endian = "little")]
    {
        if let Ok(samples) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
            return Ok(Cow::Borrowed(samples));
        }
    }

    Ok(Cow::Owned(
        bytes
            .chunks_exact(FLOAT_WIDTH)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    ))
}

/// Numeric element types that can cross the boundary.
pub trait PcmSample: Copy {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Append the little-endian encoding of `self` to `out`.
    fn write_le(self, out: &mut Vec<u8>);
}

impl PcmSample for f32 {
    const WIDTH: usize = 4;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl PcmSample for f64 {
    const WIDTH: usize = 8;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// Serialize `values` into a flat little-endian byte buffer, no header.
pub fn encode<T: PcmSample>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::WIDTH);
    for &v in values {
        v.write_le(&mut out);
    }
    out
}

/// Downmix interleaved 16-bit stereo bytes to mono floats in `[-1, 1]`.
///
/// This is the conversion a capture device in the common 44.1 kHz stereo
/// 16-bit format needs before its audio fits the supported profile.
pub fn downmix_stereo_i16(bytes: &[u8]) -> Result<Vec<f32>, UnsupportedFormatError> {
    const FRAME: usize = 4;
    if bytes.len() % FRAME != 0 {
        return Err(UnsupportedFormatError::Misaligned {
            len: bytes.len(),
            width: FRAME,
        });
    }
    let scale = 2.0 * f32::from(i16::MAX);
    Ok(bytes
        .chunks_exact(FRAME)
        .map(|c| {
            let left = i16::from_le_bytes([c[0], c[1]]);
            let right = i16::from_le_bytes([c[2], c[3]]);
            (f32::from(left) + f32::from(right)) / scale
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_every_other_profile() {
        let bytes = encode(&[0.0f32; 4]);
        assert_eq!(
            decode(&bytes, &PcmFormat::new(SAMPLE_RATE, 16, 1)),
            Err(UnsupportedFormatError::SampleWidth { bits: 16 })
        );
        assert_eq!(
            decode(&bytes, &PcmFormat::new(SAMPLE_RATE, 32, 2)),
            Err(UnsupportedFormatError::Channels { channels: 2 })
        );
        assert_eq!(
            decode(&bytes, &PcmFormat::new(48_000, 32, 1)),
            Err(UnsupportedFormatError::SampleRate {
                expected: SAMPLE_RATE,
                got: 48_000
            })
        );
    }

    #[test]
    fn rejects_partial_samples() {
        assert_eq!(
            decode(&[0u8; 7], &PcmFormat::SUPPORTED),
            Err(UnsupportedFormatError::Misaligned { len: 7, width: 4 })
        );
    }

    #[test]
    fn decodes_bit_identical_samples() {
        let samples = [0.0f32, -1.0, 0.25, f32::MIN_POSITIVE, 1.0e-30, -0.0];
        let bytes = encode(&samples);
        assert_eq!(bytes.len(), samples.len() * 4);
        let decoded = decode(&bytes, &PcmFormat::SUPPORTED).unwrap();
        let bits: Vec<u32> = decoded.iter().map(|s| s.to_bits()).collect();
        let expected: Vec<u32> = samples.iter().map(|s| s.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn decodes_from_unaligned_offsets() {
        let samples = [0.5f32, -0.5, 0.125];
        let mut bytes = vec![0u8];
        bytes.extend(encode(&samples));
        let decoded = decode(&bytes[1..], &PcmFormat::SUPPORTED).unwrap();
        assert_eq!(&decoded[..], &samples[..]);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn aligned_buffers_are_borrowed() {
        let samples = vec![0.5f32, -0.25, 1.0];
        let bytes: &[u8] = bytemuck::cast_slice(&samples);
        let decoded = decode(bytes, &PcmFormat::SUPPORTED).unwrap();
        assert!(matches!(decoded, Cow::Borrowed(_)));
        assert_eq!(&decoded[..], &samples[..]);
    }

    #[test]
    fn encodes_doubles_without_header() {
        let bytes = encode(&[1.5f64, f64::NAN]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &1.5f64.to_le_bytes());
    }

    #[test]
    fn downmixes_stereo() {
        let mut bytes = Vec::new();
        for (l, r) in [(i16::MAX, i16::MAX), (i16::MAX, -i16::MAX), (0, 16384)] {
            bytes.extend_from_slice(&l.to_le_bytes());
            bytes.extend_from_slice(&r.to_le_bytes());
        }
        let mono = downmix_stereo_i16(&bytes).unwrap();
        assert_eq!(mono.len(), 3);
        assert_eq!(mono[0], 1.0);
        assert_eq!(mono[1], 0.0);
        assert!((mono[2] - 0.25).abs() < 1e-4);
        assert!(downmix_stereo_i16(&[0u8; 6]).is_err());
    }
}
