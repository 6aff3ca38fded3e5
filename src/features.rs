//! Features
//!
//! Spectral flux activation for live audio: how much new energy entered the
//! log magnitude spectrum since the previous analysis frame.

use std::{collections::VecDeque, f32::consts::PI, sync::Arc};

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::{
    params::Params,
    pipeline::FeatureKind,
    stage::{Activation, Signal, Stage, StageError},
};

/// Per-frame decay of the running peak used for normalisation.
const PEAK_DECAY: f32 = 0.999;

/// Frames averaged by the beat activation.
const BEAT_SMOOTH_FRAMES: usize = 3;

/// Streaming spectral flux feature stage.
///
/// Keeps the newest `frame_size` samples in a sliding window, so callers may
/// deliver either bare hops or whole overlapping frames. Emits one
/// activation value in `[0, 1]` per call.
pub struct SpectralFlux {
    kind: FeatureKind,
    fps: u32,
    window: Vec<f32>,
    hann: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_buffer: Vec<Complex<f32>>,
    spectrum: Vec<f32>,
    prev_spectrum: Vec<f32>,
    primed: bool,
    peak: f32,
    recent: VecDeque<f32>,
}

impl SpectralFlux {
    /// Create a cold feature stage.
    pub fn new(kind: FeatureKind, fps: u32, frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(frame_size);
        let bins = frame_size / 2 + 1;

        SpectralFlux {
            kind,
            fps,
            window: vec![0.0; frame_size],
            hann: hann_window(frame_size),
            fft,
            fft_buffer: vec![Complex { re: 0.0, im: 0.0 }; frame_size],
            spectrum: vec![0.0; bins],
            prev_spectrum: vec![0.0; bins],
            primed: false,
            peak: 0.0,
            recent: VecDeque::with_capacity(BEAT_SMOOTH_FRAMES),
        }
    }

    /// Analysis window size in samples.
    pub fn frame_size(&self) -> usize {
        self.window.len()
    }

    fn push(&mut self, samples: &[f32]) {
        let n = self.window.len();
        if samples.len() >= n {
            self.window.copy_from_slice(&samples[samples.len() - n..]);
        } else {
            self.window.copy_within(samples.len().., 0);
            self.window[n - samples.len()..].copy_from_slice(samples);
        }
    }

    fn flux(&mut self) -> f32 {
        for ((slot, &s), &w) in self
            .fft_buffer
            .iter_mut()
            .zip(self.window.iter())
            .zip(self.hann.iter())
        {
            slot.re = s * w;
            slot.im = 0.0;
        }

        self.fft.process(&mut self.fft_buffer);

        for (mag, c) in self.spectrum.iter_mut().zip(self.fft_buffer.iter()) {
            *mag = (c.re * c.re + c.im * c.im).sqrt().ln_1p();
        }

        let flux = if self.primed {
            let rise: f32 = self
                .spectrum
                .iter()
                .zip(self.prev_spectrum.iter())
                .map(|(&cur, &prev)| (cur - prev).max(0.0))
                .sum();
            rise / self.spectrum.len() as f32
        } else {
            0.0
        };

        std::mem::swap(&mut self.spectrum, &mut self.prev_spectrum);
        self.primed = true;
        flux
    }
}

impl<'a> Stage<Signal<'a>> for SpectralFlux {
    type Output = Activation;

    fn name(&self) -> &'static str {
        match self.kind {
            FeatureKind::BeatActivation => "beat_activation",
            FeatureKind::OnsetActivation => "onset_activation",
        }
    }

    fn transform(
        &mut self,
        signal: &Signal<'a>,
        _params: &Params,
    ) -> Result<Activation, StageError> {
        let samples = signal.samples();
        if samples.is_empty() {
            return Err(StageError::InvalidInput("empty signal".into()));
        }
        if let Some(i) = samples.iter().position(|s| !s.is_finite()) {
            return Err(StageError::NumericInstability(format!(
                "sample {i} is not finite"
            )));
        }

        self.push(samples);
        let flux = self.flux();
        if !flux.is_finite() {
            return Err(StageError::NumericInstability("spectral flux".into()));
        }

        self.peak = flux.max(self.peak * PEAK_DECAY);
        let mut value = if self.peak > f32::EPSILON {
            flux / self.peak
        } else {
            0.0
        };

        if self.kind == FeatureKind::BeatActivation {
            if self.recent.len() == BEAT_SMOOTH_FRAMES {
                self.recent.pop_front();
            }
            self.recent.push_back(value);
            value = self.recent.iter().sum::<f32>() / self.recent.len() as f32;
        }

        Ok(Activation::new(signal.start_time(), self.fps, vec![value]))
    }

    fn reset(&mut self) {
        self.window.fill(0.0);
        self.spectrum.fill(0.0);
        self.prev_spectrum.fill(0.0);
        self.primed = false;
        self.peak = 0.0;
        self.recent.clear();
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    if size == 1 {
        return vec![1.0];
    }
    (0..size)
        .map(|i| {
            let angle = 2.0 * PI * i as f32 / (size - 1) as f32;
            0.5 * (1.0 - angle.cos())
        })
        .collect()
}
