//! Beats
//!
//! Online beat tracking over a beat activation. The beat period is estimated
//! from the autocorrelation of the recent activation history; beats are then
//! placed on activation peaks that agree with the period.

use std::collections::VecDeque;

use crate::{
    params::{Params, BEAT_TRACKING_DEFAULTS},
    stage::{Activation, Stage, StageError},
};

/// Periods scoring at least this share of the best one count as candidates;
/// the shortest candidate wins so that double-period ties resolve upward in
/// tempo.
const OCTAVE_TOLERANCE: f64 = 0.9;

/// Multiples of the longest period kept in the history.
const HISTORY_PERIODS: usize = 3;

/// Beat tracker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatTrackerConfig {
    /// Slowest tempo considered, in bpm.
    pub min_bpm: f64,
    /// Fastest tempo considered, in bpm.
    pub max_bpm: f64,
    /// Resistance to tempo changes; higher means steadier.
    pub transition_lambda: f64,
    /// The beat window spans `1 / observation_lambda` of the period.
    pub observation_lambda: f64,
    /// Activations below this never produce a beat.
    pub threshold: f32,
    /// Snap beats to the activation peak instead of the predicted grid.
    pub correct: bool,
}

impl BeatTrackerConfig {
    /// Read settings from a pipeline parameter set, falling back to the beat
    /// tracking defaults for missing keys.
    pub fn from_params(params: &Params) -> Self {
        let defaults = Params::from_table(BEAT_TRACKING_DEFAULTS);
        let number = |name: &str| {
            params
                .get_f64(name)
                .or_else(|| defaults.get_f64(name))
                .unwrap_or_default()
        };
        BeatTrackerConfig {
            min_bpm: number("min_bpm"),
            max_bpm: number("max_bpm"),
            transition_lambda: number("transition_lambda"),
            observation_lambda: number("observation_lambda"),
            threshold: number("threshold") as f32,
            correct: params.get_bool("correct").unwrap_or(true),
        }
    }
}

impl Default for BeatTrackerConfig {
    fn default() -> Self {
        Self::from_params(&Params::new())
    }
}

/// Online beat tracker decode stage. Yields the beat times, in seconds,
/// found in each activation.
pub struct OnlineBeatTracker {
    config: BeatTrackerConfig,
    min_lag: usize,
    max_lag: usize,
    history: VecDeque<f32>,
    scores: Vec<f64>,
    frame: u64,
    period: Option<f64>,
    last_beat: Option<(u64, f64)>,
    prev: Option<(f32, f64)>,
    prev2: f32,
    fps: f64,
}

impl OnlineBeatTracker {
    /// Create a cold tracker for an analysis grid of `fps` frames per second.
    pub fn new(config: BeatTrackerConfig, fps: u32) -> Self {
        let fps = f64::from(fps.max(1));
        let min_lag = ((60.0 * fps / config.max_bpm).floor() as usize).max(1);
        let max_lag = ((60.0 * fps / config.min_bpm).ceil() as usize).max(min_lag);

        OnlineBeatTracker {
            config,
            min_lag,
            max_lag,
            history: VecDeque::with_capacity(max_lag * HISTORY_PERIODS),
            scores: Vec::with_capacity(max_lag - min_lag + 1),
            frame: 0,
            period: None,
            last_beat: None,
            prev: None,
            prev2: 0.0,
            fps,
        }
    }

    /// Current beat period estimate, in seconds.
    pub fn period(&self) -> Option<f64> {
        self.period.map(|p| p / self.fps)
    }

    fn step(&mut self, value: f32, time: f64) -> Option<f64> {
        let n = self.frame;
        self.frame += 1;

        if self.history.len() == self.max_lag * HISTORY_PERIODS {
            self.history.pop_front();
        }
        self.history.push_back(value);
        if self.history.len() >= 2 * self.max_lag {
            self.update_period();
        }

        let beat = self.detect(n, value);
        self.prev2 = self.prev.map_or(0.0, |(v, _)| v);
        self.prev = Some((value, time));
        beat
    }

    fn update_period(&mut self) {
        let history = self.history.make_contiguous();
        let len = history.len();

        self.scores.clear();
        for lag in self.min_lag..=self.max_lag {
            let score: f64 = (self.max_lag..len)
                .map(|i| f64::from(history[i]) * f64::from(history[i - lag]))
                .sum();
            self.scores.push(score);
        }

        let best = self.scores.iter().cloned().fold(0.0f64, f64::max);
        if best <= 0.0 {
            return;
        }

        let last = self.scores.len() - 1;
        let candidate = (0..=last).find(|&i| {
            let s = self.scores[i];
            let left = i == 0 || s >= self.scores[i - 1];
            let right = i == last || s >= self.scores[i + 1];
            left && right && s >= OCTAVE_TOLERANCE * best
        });
        let Some(i) = candidate else {
            return;
        };
        let lag = (self.min_lag + i) as f64;

        self.period = Some(match self.period {
            None => lag,
            Some(p) => {
                let weight = (-self.config.transition_lambda * (lag / p).ln().abs()).exp();
                p + weight * (lag - p)
            }
        });
    }

    /// Decide whether frame `n` completes a beat. Peaks are confirmed one
    /// frame late, once the activation starts falling.
    fn detect(&mut self, n: u64, value: f32) -> Option<f64> {
        let period = self.period?;
        let (prev, prev_time) = self.prev?;
        let is_peak = prev > value
            && prev >= self.prev2
            && prev > 0.0
            && prev >= self.config.threshold;

        let Some((last, last_time)) = self.last_beat else {
            let mean = self.history.iter().sum::<f32>() / self.history.len() as f32;
            if is_peak && prev >= mean {
                self.last_beat = Some((n - 1, prev_time));
                return Some(prev_time);
            }
            return None;
        };

        let step = period.round().max(1.0) as u64;
        let tolerance = (period / self.config.observation_lambda).max(1.0);
        if !self.config.correct {
            if n >= last + step {
                return self.fill_in(n, last, last_time, step, tolerance);
            }
            return None;
        }

        let since = (n - 1).saturating_sub(last) as f64;
        if is_peak && n - 1 > last && (since - period).abs() <= tolerance {
            self.last_beat = Some((n - 1, prev_time));
            return Some(prev_time);
        }
        if (n - last) as f64 > period + tolerance {
            return self.fill_in(n, last, last_time, step, tolerance);
        }
        None
    }

    /// Place a beat one period after the last one, but only if the
    /// activation reached the threshold inside the beat window around that
    /// position. Otherwise the grid is dropped and the next beat has to be
    /// found from a peak again.
    fn fill_in(
        &mut self,
        n: u64,
        last: u64,
        last_time: f64,
        step: u64,
        tolerance: f64,
    ) -> Option<f64> {
        let window = (n - (last + step)) as usize + tolerance.ceil() as usize + 1;
        let active = self
            .history
            .iter()
            .rev()
            .take(window)
            .any(|&v| v > 0.0 && v >= self.config.threshold);
        if !active {
            self.last_beat = None;
            return None;
        }
        let time = last_time + step as f64 / self.fps;
        self.last_beat = Some((last + step, time));
        Some(time)
    }
}

impl Stage<Activation> for OnlineBeatTracker {
    type Output = Vec<f64>;

    fn name(&self) -> &'static str {
        "beat_tracker"
    }

    fn transform(
        &mut self,
        activation: &Activation,
        _params: &Params,
    ) -> Result<Vec<f64>, StageError> {
        let mut beats = Vec::new();
        for (time, value) in activation.frames() {
            if !value.is_finite() {
                return Err(StageError::NumericInstability(format!(
                    "activation at {time:.3}s is not finite"
                )));
            }
            if let Some(beat) = self.step(value, time) {
                beats.push(beat);
            }
        }
        Ok(beats)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.frame = 0;
        self.period = None;
        self.last_beat = None;
        self.prev = None;
        self.prev2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pulses every `period` frames with one-frame shoulders.
    fn pulses(frames: usize, period: usize) -> Vec<f32> {
        (0..frames)
            .map(|n| match n % period {
                10 => 1.0,
                9 | 11 => 0.5,
                _ => 0.0,
            })
            .collect()
    }

    fn run(tracker: &mut OnlineBeatTracker, values: &[f32], fps: u32) -> Vec<f64> {
        values
            .iter()
            .enumerate()
            .flat_map(|(n, &v)| {
                let act = Activation::new(n as f64 / f64::from(fps), fps, vec![v]);
                tracker.transform(&act, &Params::new()).unwrap()
            })
            .collect()
    }

    #[test]
    fn defaults_match_the_beat_table() {
        let config = BeatTrackerConfig::default();
        assert_eq!(config.min_bpm, 55.0);
        assert_eq!(config.max_bpm, 215.0);
        assert_eq!(config.transition_lambda, 100.0);
        assert_eq!(config.observation_lambda, 16.0);
        assert_eq!(config.threshold, 0.0);
        assert!(config.correct);
    }

    #[test]
    fn tracks_a_steady_pulse() {
        let mut tracker = OnlineBeatTracker::new(BeatTrackerConfig::default(), 100);
        let beats = run(&mut tracker, &pulses(1500, 50), 100);
        assert!(beats.len() >= 20, "only {} beats", beats.len());
        for pair in beats.windows(2) {
            assert!((pair[1] - pair[0] - 0.5).abs() < 1e-6, "{pair:?}");
        }
        for beat in &beats {
            let frame = (beat * 100.0).round() as usize;
            assert_eq!(frame % 50, 10);
        }
        assert!((tracker.period().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stays_quiet_on_silence() {
        let mut tracker = OnlineBeatTracker::new(BeatTrackerConfig::default(), 100);
        assert!(run(&mut tracker, &vec![0.0; 800], 100).is_empty());
        assert_eq!(tracker.period(), None);
    }

    #[test]
    fn uncorrected_beats_follow_the_grid() {
        let config = BeatTrackerConfig {
            correct: false,
            ..BeatTrackerConfig::default()
        };
        let mut tracker = OnlineBeatTracker::new(config, 100);
        let beats = run(&mut tracker, &pulses(1000, 40), 100);
        assert!(beats.len() >= 10);
        for pair in beats.windows(2) {
            assert!((pair[1] - pair[0] - 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn stops_predicting_once_the_activation_falls_silent() {
        let config = BeatTrackerConfig {
            threshold: 0.5,
            ..BeatTrackerConfig::default()
        };
        let mut values = pulses(1500, 50);
        values.extend(vec![0.0; 1500]);
        values.extend(pulses(1000, 50));

        for correct in [true, false] {
            let config = BeatTrackerConfig {
                correct,
                ..config.clone()
            };
            let mut tracker = OnlineBeatTracker::new(config, 100);
            let beats = run(&mut tracker, &values, 100);

            assert!(beats.iter().any(|&t| t < 15.0));
            let quiet: Vec<_> = beats.iter().filter(|&&t| (15.0..30.0).contains(&t)).collect();
            assert!(quiet.is_empty(), "correct={correct}: {quiet:?}");
            assert!(beats.iter().any(|&t| t > 30.0), "correct={correct}");
        }
    }

    #[test]
    fn low_activation_never_fills_in() {
        let config = BeatTrackerConfig {
            threshold: 0.5,
            ..BeatTrackerConfig::default()
        };
        let mut tracker = OnlineBeatTracker::new(config, 100);
        let mut values = pulses(1500, 50);
        // Weak pulses on the same grid, all under the threshold.
        values.extend(pulses(1000, 50).into_iter().map(|v| v * 0.4));
        let beats = run(&mut tracker, &values, 100);
        assert!(beats.iter().all(|&t| t < 15.1), "{beats:?}");
    }

    #[test]
    fn reset_forgets_the_period() {
        let mut tracker = OnlineBeatTracker::new(BeatTrackerConfig::default(), 100);
        run(&mut tracker, &pulses(600, 50), 100);
        assert!(tracker.period().is_some());
        tracker.reset();
        assert_eq!(tracker.period(), None);
        assert!(run(&mut tracker, &pulses(100, 50), 100).is_empty());
    }
}
