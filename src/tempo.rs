//! Tempo
//!
//! Online tempo estimation with a bank of feedback comb filters, one per
//! candidate beat period. Each frame the filter with the strongest response
//! votes for its period; votes from the last few seconds form a histogram
//! whose peaks are the tempo estimates.

use std::{cmp::Ordering, collections::VecDeque, f64::consts::PI};

use crate::{
    params::{Params, TEMPO_ESTIMATION_DEFAULTS},
    stage::{Activation, Stage, StageError},
};

/// Tempo estimator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TempoConfig {
    /// Slowest tempo considered, in bpm.
    pub min_bpm: f64,
    /// Fastest tempo considered, in bpm.
    pub max_bpm: f64,
    /// Activation smoothing window, in seconds.
    pub act_smooth: f64,
    /// Histogram smoothing window, in bins.
    pub hist_smooth: usize,
    /// How much history the histogram covers, in seconds.
    pub hist_buffer: f64,
    /// Comb filter feedback gain.
    pub alpha: f64,
}

impl TempoConfig {
    /// Read settings from a pipeline parameter set, falling back to the tempo
    /// estimation defaults for missing keys.
    pub fn from_params(params: &Params) -> Self {
        let defaults = Params::from_table(TEMPO_ESTIMATION_DEFAULTS);
        let number = |name: &str| {
            params
                .get_f64(name)
                .or_else(|| defaults.get_f64(name))
                .unwrap_or_default()
        };
        TempoConfig {
            min_bpm: number("min_bpm"),
            max_bpm: number("max_bpm"),
            act_smooth: number("act_smooth"),
            hist_smooth: number("hist_smooth").round() as usize,
            hist_buffer: number("hist_buffer"),
            alpha: number("alpha"),
        }
    }
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self::from_params(&Params::new())
    }
}

/// Comb filter tempo estimator decode stage.
///
/// Output rows are `(bpm, strength)` pairs flattened into one buffer,
/// strongest first, strengths summing to one. With no estimate yet the
/// output is the single row `(NaN, 0)`.
pub struct CombTempoEstimator {
    fps: f64,
    min_lag: usize,
    alpha: f32,
    smooth_window: Vec<f32>,
    smooth_history: VecDeque<f32>,
    /// One ring of past outputs per lag; ring `k` has length `min_lag + k`.
    combs: Vec<Vec<f32>>,
    frame: usize,
    votes: VecDeque<(usize, f32)>,
    vote_capacity: usize,
    histogram: Vec<f64>,
    hist_window: Vec<f64>,
}

impl CombTempoEstimator {
    /// Create a cold estimator for an analysis grid of `fps` frames per second.
    pub fn new(config: TempoConfig, fps: u32) -> Self {
        let fps = f64::from(fps.max(1));
        let min_lag = ((60.0 * fps / config.max_bpm).floor() as usize).max(1);
        let max_lag = ((60.0 * fps / config.min_bpm).ceil() as usize).max(min_lag);
        let smooth_len = ((config.act_smooth * fps).round() as usize).max(1);
        let vote_capacity = ((config.hist_buffer * fps).round() as usize).max(1);

        CombTempoEstimator {
            fps,
            min_lag,
            alpha: config.alpha as f32,
            smooth_window: hamming_window(smooth_len)
                .into_iter()
                .map(|w| w as f32)
                .collect(),
            smooth_history: VecDeque::with_capacity(smooth_len),
            combs: (min_lag..=max_lag).map(|lag| vec![0.0; lag]).collect(),
            frame: 0,
            votes: VecDeque::with_capacity(vote_capacity),
            vote_capacity,
            histogram: vec![0.0; max_lag - min_lag + 1],
            hist_window: hamming_window(config.hist_smooth.max(1)),
        }
    }

    /// The raw vote histogram, indexed from the shortest lag.
    pub fn histogram(&self) -> &[f64] {
        &self.histogram
    }

    fn smooth(&mut self, value: f32) -> f32 {
        if self.smooth_history.len() == self.smooth_window.len() {
            self.smooth_history.pop_front();
        }
        self.smooth_history.push_back(value);

        let offset = self.smooth_window.len() - self.smooth_history.len();
        let (sum, norm) = self
            .smooth_history
            .iter()
            .zip(&self.smooth_window[offset..])
            .fold((0.0f32, 0.0f32), |(s, n), (&v, &w)| (s + v * w, n + w));
        if norm > 0.0 {
            sum / norm
        } else {
            0.0
        }
    }

    fn step(&mut self, value: f32) {
        let x = self.smooth(value);

        let mut best: Option<(usize, f32)> = None;
        for (k, ring) in self.combs.iter_mut().enumerate() {
            let pos = self.frame % ring.len();
            let y = x + self.alpha * ring[pos];
            ring[pos] = y;
            let better = match best {
                Some((_, b)) => y > b,
                None => true,
            };
            if better {
                best = Some((k, y));
            }
        }
        self.frame += 1;

        if self.votes.len() == self.vote_capacity {
            if let Some((k, v)) = self.votes.pop_front() {
                self.histogram[k] -= f64::from(v);
            }
        }
        if let Some((k, y)) = best.filter(|&(_, y)| y > 0.0) {
            self.votes.push_back((k, y));
            self.histogram[k] += f64::from(y);
        } else {
            self.votes.push_back((0, 0.0));
        }
    }

    fn smoothed_histogram(&self) -> Vec<f64> {
        let half = self.hist_window.len() / 2;
        let len = self.histogram.len();
        (0..len)
            .map(|i| {
                self.hist_window
                    .iter()
                    .enumerate()
                    .filter_map(|(j, &w)| {
                        let idx = (i + j).checked_sub(half)?;
                        self.histogram.get(idx).map(|&h| h * w)
                    })
                    .sum::<f64>()
            })
            .collect()
    }

    fn tempi(&self) -> Vec<f64> {
        let hist = self.smoothed_histogram();
        let last = hist.len().saturating_sub(1);
        let mut peaks: Vec<(f64, f64)> = (0..hist.len())
            .filter(|&i| {
                let h = hist[i];
                h > 1e-9
                    && (i == 0 || h > hist[i - 1])
                    && (i == last || h >= hist[i + 1])
            })
            .map(|i| (60.0 * self.fps / (self.min_lag + i) as f64, hist[i]))
            .collect();

        if peaks.is_empty() {
            return vec![f64::NAN, 0.0];
        }

        let total: f64 = peaks.iter().map(|&(_, s)| s).sum();
        peaks.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        peaks
            .into_iter()
            .flat_map(|(bpm, strength)| [bpm, strength / total])
            .collect()
    }
}

impl Stage<Activation> for CombTempoEstimator {
    type Output = Vec<f64>;

    fn name(&self) -> &'static str {
        "tempo_estimator"
    }

    fn transform(
        &mut self,
        activation: &Activation,
        _params: &Params,
    ) -> Result<Vec<f64>, StageError> {
        for &value in activation.values() {
            if !value.is_finite() {
                return Err(StageError::NumericInstability(
                    "non-finite activation".into(),
                ));
            }
            self.step(value);
        }
        Ok(self.tempi())
    }

    fn reset(&mut self) {
        self.smooth_history.clear();
        for ring in &mut self.combs {
            ring.fill(0.0);
        }
        self.frame = 0;
        self.votes.clear();
        self.histogram.fill(0.0);
    }
}

/// A tempo in beats per minute.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd)]
pub struct Tempo {
    /// Beats per minute.
    pub bpm: f64,
}

impl Tempo {
    /// Wrap a bpm value.
    pub const fn new(bpm: f64) -> Self {
        Tempo { bpm }
    }

    /// Duration of one beat, in seconds.
    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.bpm
    }
}

/// A value with the strength the estimator assigned to it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Prediction<T> {
    /// Relative strength, `0..=1`.
    pub strength: f64,
    /// The predicted value.
    pub value: T,
}

/// Pick the two strongest tempi from a tempo estimator result and order
/// them: a present estimate before a missing one, and the slower tempo
/// first when both are present.
pub fn dominant_tempi(rows: &[f64]) -> (Option<Prediction<Tempo>>, Option<Prediction<Tempo>>) {
    let mut rows = rows.chunks_exact(2).map(|row| {
        if row[0].is_nan() {
            None
        } else {
            Some(Prediction {
                strength: row[1],
                value: Tempo::new(row[0]),
            })
        }
    });
    let t1 = rows.next().flatten();
    let t2 = rows.next().flatten();

    match (t1, t2) {
        (None, t2) => (t2, None),
        (t1, None) => (t1, None),
        (Some(a), Some(b)) if b.value.bpm > a.value.bpm => (Some(a), Some(b)),
        (Some(a), Some(b)) => (Some(b), Some(a)),
    }
}

fn hamming_window(size: usize) -> Vec<f64> {
    if size == 1 {
        return vec![1.0];
    }
    (0..size)
        .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f64 / (size - 1) as f64).cos())
        .collect()
}
