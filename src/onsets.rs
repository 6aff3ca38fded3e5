//! Onsets
//!
//! Online peak picking over an onset activation. Only past frames are
//! consulted, so `post_max` and `post_avg` have no effect here.

use std::collections::VecDeque;

use crate::{
    params::{Params, ONSET_DETECTION_DEFAULTS},
    stage::{Activation, Stage, StageError},
};

/// Peak picker settings. Window lengths are in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct OnsetConfig {
    /// Minimum activation of an onset.
    pub threshold: f32,
    /// Look-back window for the local maximum.
    pub pre_max: f64,
    /// Look-back window for the moving average; zero disables it.
    pub pre_avg: f64,
    /// Minimum gap between reported onsets.
    pub combine: f64,
    /// Constant shift added to every reported onset.
    pub delay: f64,
}

impl OnsetConfig {
    /// Read settings from a pipeline parameter set, falling back to the onset
    /// detection defaults for missing keys. A missing `pre_max` defaults to
    /// one frame.
    pub fn from_params(params: &Params, fps: u32) -> Self {
        let defaults = Params::from_table(ONSET_DETECTION_DEFAULTS);
        let number = |name: &str| {
            params
                .get_f64(name)
                .or_else(|| defaults.get_f64(name))
        };
        OnsetConfig {
            threshold: number("threshold").unwrap_or_default() as f32,
            pre_max: number("pre_max").unwrap_or(1.0 / f64::from(fps.max(1))),
            pre_avg: number("pre_avg").unwrap_or_default(),
            combine: number("combine").unwrap_or_default(),
            delay: number("delay").unwrap_or_default(),
        }
    }
}

/// Online onset peak picker decode stage. Yields the onset times, in
/// seconds, found in each activation.
pub struct OnsetPeakPicker {
    config: OnsetConfig,
    max_frames: usize,
    avg_frames: usize,
    recent: VecDeque<f32>,
    last_onset: Option<f64>,
}

impl OnsetPeakPicker {
    /// Create a cold peak picker for an analysis grid of `fps` frames per
    /// second.
    pub fn new(config: OnsetConfig, fps: u32) -> Self {
        let fps = f64::from(fps.max(1));
        let max_frames = (config.pre_max * fps).round() as usize;
        let avg_frames = (config.pre_avg * fps).round() as usize;
        OnsetPeakPicker {
            config,
            max_frames,
            avg_frames,
            recent: VecDeque::with_capacity(max_frames.max(avg_frames) + 1),
            last_onset: None,
        }
    }

    fn step(&mut self, value: f32, time: f64) -> Option<f64> {
        if self.recent.len() == self.max_frames.max(self.avg_frames) + 1 {
            self.recent.pop_front();
        }
        self.recent.push_back(value);

        let local_max = self
            .recent
            .iter()
            .rev()
            .take(self.max_frames + 1)
            .all(|&v| v <= value);
        let moving_avg = if self.avg_frames > 0 {
            let window = self.recent.iter().rev().take(self.avg_frames + 1);
            let count = window.len();
            window.sum::<f32>() / count as f32
        } else {
            0.0
        };
        if !local_max || value < moving_avg + self.config.threshold {
            return None;
        }

        if let Some(last) = self.last_onset {
            if time - last <= self.config.combine {
                return None;
            }
        }
        self.last_onset = Some(time);
        Some(time + self.config.delay)
    }
}

impl Stage<Activation> for OnsetPeakPicker {
    type Output = Vec<f64>;

    fn name(&self) -> &'static str {
        "onset_peak_picker"
    }

    fn transform(
        &mut self,
        activation: &Activation,
        _params: &Params,
    ) -> Result<Vec<f64>, StageError> {
        let mut onsets = Vec::new();
        for (time, value) in activation.frames() {
            if !value.is_finite() {
                return Err(StageError::NumericInstability(format!(
                    "activation at {time:.3}s is not finite"
                )));
            }
            if let Some(onset) = self.step(value, time) {
                onsets.push(onset);
            }
        }
        Ok(onsets)
    }

    fn reset(&mut self) {
        self.recent.clear();
        self.last_onset = None;
    }
}
