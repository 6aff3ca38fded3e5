//! Stage
//!
//! The seam between the streaming layer and the analysis models. A stage is
//! anything that can `transform` an input into an output while keeping its
//! own history, and `reset` that history on request.

use thiserror::Error;

use crate::params::Params;

/// Errors raised by a stage while transforming a hop.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StageError {
    /// The input cannot be processed, e.g. an empty signal.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// NaN or infinite values appeared in the input or the internal state.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// Internal state is unusable; reset the session.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// Any other model fault.
    #[error("{0}")]
    Other(String),
}

/// A stateful transform.
///
/// `params` is the pipeline's shared parameter set. Built-in stages read it
/// once when they are created; external model stages may consult it on
/// every call.
pub trait Stage<I: ?Sized> {
    /// What the stage produces.
    type Output;

    /// Name used in logs and failures.
    fn name(&self) -> &'static str;

    /// Advance the stage by one input.
    fn transform(&mut self, input: &I, params: &Params) -> Result<Self::Output, StageError>;

    /// Discard all history so the next `transform` starts cold.
    fn reset(&mut self);
}

/// A feature stage: timestamped signal in, activation out.
pub type FeatureStage = dyn for<'a> Stage<Signal<'a>, Output = Activation> + Send;

/// A decode stage: activation in, result buffer out.
pub type DecodeStage = dyn Stage<Activation, Output = Vec<f64>> + Send;

/// A timestamped view over one hop of mono samples.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Signal<'a> {
    samples: &'a [f32],
    sample_rate: u32,
    start_time: f64,
    hop_size: usize,
    frame_size: usize,
}

impl<'a> Signal<'a> {
    /// Wrap `samples` starting at `start_time` seconds.
    pub fn new(
        samples: &'a [f32],
        sample_rate: u32,
        start_time: f64,
        hop_size: usize,
        frame_size: usize,
    ) -> Self {
        Signal {
            samples,
            sample_rate,
            start_time,
            hop_size,
            frame_size,
        }
    }

    /// The samples.
    pub fn samples(&self) -> &'a [f32] {
        self.samples
    }

    /// Samples per second.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Absolute time of the hop start, in seconds.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Samples per analysis grid step.
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Analysis window size in samples.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// Feature stage output: activation values on the analysis grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    start_time: f64,
    fps: u32,
    values: Vec<f32>,
}

impl Activation {
    /// Activation `values`, the first one at `start_time` seconds.
    pub fn new(start_time: f64, fps: u32, values: Vec<f32>) -> Self {
        Activation {
            start_time,
            fps,
            values,
        }
    }

    /// Time of the first frame, in seconds.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Analysis grid rate.
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Activation values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Absolute time of frame `i`, in seconds.
    pub fn frame_time(&self, i: usize) -> f64 {
        self.start_time + i as f64 / f64::from(self.fps.max(1))
    }

    /// `(time, value)` for every frame.
    pub fn frames(&self) -> impl Iterator<Item = (f64, f32)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(move |(i, &v)| (self.frame_time(i), v))
    }
}
