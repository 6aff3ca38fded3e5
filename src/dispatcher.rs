//! Dispatcher
//!
//! The per-hop entry point. Each call timestamps one hop, runs the feature
//! stage once and fans its activation out to every decode stage in the order
//! the descriptor declares them.

use std::fmt;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    beats::{BeatTrackerConfig, OnlineBeatTracker},
    features::SpectralFlux,
    onsets::{OnsetConfig, OnsetPeakPicker},
    pcm::{self, PcmFormat, UnsupportedFormatError},
    pipeline::{ConfigurationError, DecoderKind, PipelineDescriptor, SAMPLE_RATE},
    stage::{DecodeStage, FeatureStage, Signal, StageError},
    tempo::{CombTempoEstimator, TempoConfig},
};

/// Where in a pipeline a stage sits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StagePosition {
    /// The feature stage.
    Feature,
    /// The decode stage at this index of the fan-out.
    Decoder(usize),
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagePosition::Feature => f.write_str("feature stage"),
            StagePosition::Decoder(i) => write!(f, "decode stage {i}"),
        }
    }
}

/// A stage fault, tagged with the stage that raised it.
///
/// Session state is indeterminate afterwards; pass `reset = true` on the
/// next call.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{stage} ({position}) failed")]
pub struct StageFailure {
    /// Name of the failing stage.
    pub stage: &'static str,
    /// Position of the failing stage.
    pub position: StagePosition,
    /// The fault itself.
    #[source]
    pub source: StageError,
}

/// Errors raised while processing a hop.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessError {
    /// The hop does not match the supported PCM profile. Nothing was touched.
    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormatError),

    /// A stage faulted.
    #[error(transparent)]
    Stage(#[from] StageFailure),
}

/// Absolute start of hop `hop_index`, in seconds.
///
/// Assumes hops arrive without gaps.
pub fn start_time(hop_index: u64, hop_size: usize, sample_rate: u32) -> f64 {
    hop_index as f64 * hop_size as f64 / f64::from(sample_rate)
}

/// One hop of mono float samples.
///
/// `hop_size` places the hop on the timeline. Both sizes are handed to the
/// feature stage through [`Signal`]; the built-in [`SpectralFlux`] keeps the
/// frame size it was created with, so only custom stages act on them.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Hop<'a> {
    /// Ordinal of the hop within its stream.
    pub index: u64,
    /// Samples per hop.
    pub hop_size: usize,
    /// Analysis window size in samples, as seen by custom feature stages.
    pub frame_size: usize,
    /// The samples.
    pub samples: &'a [f32],
}

impl<'a> Hop<'a> {
    /// Describe hop `index`.
    pub fn new(index: u64, hop_size: usize, frame_size: usize, samples: &'a [f32]) -> Self {
        Hop {
            index,
            hop_size,
            frame_size,
            samples,
        }
    }

    /// Describe hop `index` on the analysis grid of `descriptor`.
    pub fn on_grid(descriptor: &PipelineDescriptor, index: u64, samples: &'a [f32]) -> Self {
        Hop::new(index, descriptor.hop_size(), descriptor.frame_size(), samples)
    }

    /// Absolute start of this hop, in seconds.
    pub fn start_time(&self) -> f64 {
        start_time(self.index, self.hop_size, SAMPLE_RATE)
    }
}

/// One hop as raw bytes, as it arrives across a process boundary.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RawHop<'a> {
    /// Ordinal of the hop within its stream.
    pub index: u64,
    /// Samples per hop.
    pub hop_size: usize,
    /// Analysis window size in samples.
    pub frame_size: usize,
    /// Little-endian sample bytes.
    pub bytes: &'a [u8],
    /// Declared layout of `bytes`.
    pub format: PcmFormat,
}

/// The mutable half of a pipeline: one set of live stages.
///
/// A session is fed by a single stream of hops. It may move between threads
/// but must not be shared.
pub struct Session {
    feature: Box<FeatureStage>,
    decoders: Vec<Box<DecodeStage>>,
    last_start_time: Option<f64>,
    hops: u64,
}

impl Session {
    /// Instantiate cold built-in stages for `descriptor`.
    pub fn new(descriptor: &PipelineDescriptor) -> Self {
        let fps = descriptor.fps();
        let params = descriptor.params();
        let feature = Box::new(SpectralFlux::new(
            descriptor.feature(),
            fps,
            descriptor.frame_size(),
        ));
        let decoders = descriptor
            .decoders()
            .iter()
            .map(|kind| -> Box<DecodeStage> {
                match kind {
                    DecoderKind::BeatTracker => Box::new(OnlineBeatTracker::new(
                        BeatTrackerConfig::from_params(params),
                        fps,
                    )),
                    DecoderKind::TempoEstimator => Box::new(CombTempoEstimator::new(
                        TempoConfig::from_params(params),
                        fps,
                    )),
                    DecoderKind::OnsetPeakPicker => Box::new(OnsetPeakPicker::new(
                        OnsetConfig::from_params(params, fps),
                        fps,
                    )),
                }
            })
            .collect();

        Session {
            feature,
            decoders,
            last_start_time: None,
            hops: 0,
        }
    }

    /// Assemble a session from custom stages, e.g. an external model.
    pub fn with_stages(
        feature: Box<FeatureStage>,
        decoders: Vec<Box<DecodeStage>>,
    ) -> Result<Self, ConfigurationError> {
        if decoders.is_empty() {
            return Err(ConfigurationError::NoDecodeStages);
        }
        Ok(Session {
            feature,
            decoders,
            last_start_time: None,
            hops: 0,
        })
    }

    /// Discard the history of every stage.
    pub fn reset(&mut self) {
        debug!(
            "resetting session after {} hops ({} decode stages)",
            self.hops,
            self.decoders.len()
        );
        self.feature.reset();
        for decoder in &mut self.decoders {
            decoder.reset();
        }
        self.last_start_time = None;
        self.hops = 0;
    }

    /// Start time of the last hop processed since the last reset.
    pub fn last_start_time(&self) -> Option<f64> {
        self.last_start_time
    }

    /// Hops processed since the last reset.
    pub fn hops_processed(&self) -> u64 {
        self.hops
    }

    /// Number of decode stages, and so of result buffers per call.
    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("feature", &self.feature.name())
            .field(
                "decoders",
                &self.decoders.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("last_start_time", &self.last_start_time)
            .field("hops", &self.hops)
            .finish()
    }
}

/// Process one hop and return one result buffer per decode stage.
///
/// The format is checked before any stage is touched, so a rejected hop
/// leaves `session` as it was. With `reset` set every stage starts cold
/// before seeing this hop.
pub fn process(
    descriptor: &PipelineDescriptor,
    session: &mut Session,
    format: &PcmFormat,
    hop: &Hop<'_>,
    reset: bool,
) -> Result<Vec<Vec<f64>>, ProcessError> {
    format.validate()?;

    if reset {
        session.reset();
    }

    let start = hop.start_time();
    trace!(
        "hop {} at {:.3}s: {} samples",
        hop.index,
        start,
        hop.samples.len()
    );
    let signal = Signal::new(
        hop.samples,
        SAMPLE_RATE,
        start,
        hop.hop_size,
        hop.frame_size,
    );
    let params = descriptor.params();

    let activation = session
        .feature
        .transform(&signal, params)
        .map_err(|source| failure(session.feature.name(), StagePosition::Feature, source))?;

    let mut results = Vec::with_capacity(session.decoders.len());
    for (i, decoder) in session.decoders.iter_mut().enumerate() {
        let out = decoder
            .transform(&activation, params)
            .map_err(|source| failure(decoder.name(), StagePosition::Decoder(i), source))?;
        results.push(out);
    }

    session.last_start_time = Some(start);
    session.hops += 1;
    Ok(results)
}

/// Byte-level twin of [`process`]: decodes the hop, processes it and encodes
/// every result buffer as little-endian `f64`s.
pub fn process_bytes(
    descriptor: &PipelineDescriptor,
    session: &mut Session,
    hop: &RawHop<'_>,
    reset: bool,
) -> Result<Vec<Vec<u8>>, ProcessError> {
    let samples = pcm::decode(hop.bytes, &hop.format)?;
    let view = Hop::new(hop.index, hop.hop_size, hop.frame_size, &samples);
    let results = process(descriptor, session, &hop.format, &view, reset)?;
    Ok(results.iter().map(|r| pcm::encode(r)).collect())
}

fn failure(stage: &'static str, position: StagePosition, source: StageError) -> StageFailure {
    warn!("{stage} ({position}) failed: {source}");
    StageFailure {
        stage,
        position,
        source,
    }
}
