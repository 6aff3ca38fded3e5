//! Silence
//!
//! Detects an interrupted capture: a stretch of near-zero samples long
//! enough that the analysis history should be thrown away.

use std::time::Duration;

/// 16-bit samples with a magnitude up to this level count as quiet, which
/// covers idle converter noise.
pub const SILENCE_LEVEL_I16: i16 = 130;

/// [`SILENCE_LEVEL_I16`] on the float scale.
pub const SILENCE_LEVEL: f32 = SILENCE_LEVEL_I16 as f32 / i16::MAX as f32;

/// Default quiet stretch that counts as silence.
pub const DEFAULT_SILENCE: Duration = Duration::from_secs(5);

/// Tracks how long the input has stayed quiet.
#[derive(Debug, Clone, PartialEq)]
pub struct SilenceDetector {
    window: u64,
    quiet: u64,
}

impl SilenceDetector {
    /// Report silence after `duration` of quiet input at `sample_rate`.
    pub fn new(duration: Duration, sample_rate: u32) -> Self {
        let window = (duration.as_secs_f64() * f64::from(sample_rate)).round() as u64;
        SilenceDetector {
            window: window.max(1),
            quiet: 0,
        }
    }

    /// Feed the next mono samples.
    pub fn update(&mut self, samples: &[f32]) {
        for &s in samples {
            self.count(s.abs() <= SILENCE_LEVEL);
        }
    }

    /// Feed interleaved 16-bit little-endian stereo bytes. A frame is quiet
    /// only if both channels are, so out-of-phase channels that cancel in a
    /// downmix still count as sound. A trailing partial frame is ignored.
    pub fn update_stereo_i16(&mut self, bytes: &[u8]) {
        for frame in bytes.chunks_exact(4) {
            let left = i16::from_le_bytes([frame[0], frame[1]]);
            let right = i16::from_le_bytes([frame[2], frame[3]]);
            self.count(quiet_i16(left) && quiet_i16(right));
        }
    }

    fn count(&mut self, quiet: bool) {
        if quiet {
            self.quiet += 1;
        } else {
            self.quiet = 0;
        }
    }

    /// Whether the last `duration` of input was entirely quiet.
    pub fn is_silence(&self) -> bool {
        self.quiet >= self.window
    }

    /// Forget the quiet stretch seen so far.
    pub fn reset(&mut self) {
        self.quiet = 0;
    }
}

fn quiet_i16(sample: i16) -> bool {
    sample.unsigned_abs() <= SILENCE_LEVEL_I16 as u16
}
