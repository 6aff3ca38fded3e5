//! Pipeline
//!
//! Descriptors for one analysis task and the factory that builds them.
//!
//! A descriptor names one feature stage and an ordered list of decode stages
//! that all consume that feature stage's output. It is plain data: the
//! stateful stages themselves live in a [`Session`](crate::Session).

use std::{fmt::Display, str::FromStr};

use log::debug;
use thiserror::Error;

use crate::params::{
    ParamValue, Params, BEAT_TRACKING_DEFAULTS, ONSET_DETECTION_DEFAULTS,
    TEMPO_ESTIMATION_DEFAULTS,
};

/// The only supported audio sample rate, in Hz.
pub const SAMPLE_RATE: u32 = 44_100;

/// Default analysis window, in samples.
pub const FRAME_SIZE: usize = 2048;

/// Default analysis grid rate, in frames per second.
pub const DEFAULT_FPS: u32 = 100;

/// Fastest accepted analysis grid rate. The decoders keep state per
/// candidate beat period, and the period range in frames grows with fps.
pub const MAX_FPS: u32 = 1_000;

/// Errors raised while building a pipeline descriptor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    /// The analysis kind name is not recognised.
    #[error("unknown analysis kind `{0}`")]
    UnknownKind(String),

    /// The analysis grid rate must lie in `1..=MAX_FPS`.
    #[error("fps must lie between 1 and {}, got {fps}", MAX_FPS)]
    InvalidFps {
        /// The rejected rate.
        fps: u32,
    },

    /// The sample rate is not a whole multiple of the analysis grid rate.
    #[error("fps {fps} does not divide the {sample_rate} Hz sample rate into whole hops")]
    FpsHopMismatch {
        /// The rejected rate.
        fps: u32,
        /// The fixed sample rate.
        sample_rate: u32,
    },

    /// A parameter has the wrong type or an out-of-range value.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// The parameter name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A session needs at least one decode stage.
    #[error("a pipeline needs at least one decode stage")]
    NoDecodeStages,
}

/// Supported analysis tasks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum AnalysisKind {
    /// Beat positions.
    BeatTracking,
    /// Tempo histogram.
    TempoEstimation,
    /// Onset positions.
    OnsetDetection,
    /// Beat positions and tempo from one shared activation.
    CombinedBeatTempo,
}

impl AnalysisKind {
    /// Every supported kind.
    pub const ALL: [AnalysisKind; 4] = [
        AnalysisKind::BeatTracking,
        AnalysisKind::TempoEstimation,
        AnalysisKind::OnsetDetection,
        AnalysisKind::CombinedBeatTempo,
    ];

    /// Short name, as accepted by [`FromStr`].
    pub const fn name(self) -> &'static str {
        match self {
            AnalysisKind::BeatTracking => "beat",
            AnalysisKind::TempoEstimation => "tempo",
            AnalysisKind::OnsetDetection => "onset",
            AnalysisKind::CombinedBeatTempo => "beat+tempo",
        }
    }

    /// The feature stage this kind extracts.
    pub const fn feature(self) -> FeatureKind {
        match self {
            AnalysisKind::OnsetDetection => FeatureKind::OnsetActivation,
            _ => FeatureKind::BeatActivation,
        }
    }

    /// The decode stages this kind fans out to, in result order.
    pub const fn decoders(self) -> &'static [DecoderKind] {
        match self {
            AnalysisKind::BeatTracking => &[DecoderKind::BeatTracker],
            AnalysisKind::TempoEstimation => &[DecoderKind::TempoEstimator],
            AnalysisKind::OnsetDetection => &[DecoderKind::OnsetPeakPicker],
            AnalysisKind::CombinedBeatTempo => {
                &[DecoderKind::BeatTracker, DecoderKind::TempoEstimator]
            }
        }
    }
}

impl Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AnalysisKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigurationError::UnknownKind(s.to_owned()))
    }
}

/// Feature stage variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    /// Beat activation, smoothed over a few frames.
    BeatActivation,
    /// Onset activation, unsmoothed.
    OnsetActivation,
}

/// Decode stage variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DecoderKind {
    /// Online beat tracker; yields beat times.
    BeatTracker,
    /// Comb filter tempo estimator; yields `(bpm, strength)` rows.
    TempoEstimator,
    /// Online peak picker; yields onset times.
    OnsetPeakPicker,
}

impl DecoderKind {
    /// Stage name used in logs and failures.
    pub const fn name(self) -> &'static str {
        match self {
            DecoderKind::BeatTracker => "beat_tracker",
            DecoderKind::TempoEstimator => "tempo_estimator",
            DecoderKind::OnsetPeakPicker => "onset_peak_picker",
        }
    }
}

/// Immutable description of one analysis task.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDescriptor {
    kind: AnalysisKind,
    fps: u32,
    hop_size: usize,
    frame_size: usize,
    params: Params,
    feature: FeatureKind,
    decoders: Vec<DecoderKind>,
}

impl PipelineDescriptor {
    /// Start customizing with a builder.
    pub fn builder(kind: AnalysisKind) -> PipelineBuilder {
        PipelineBuilder::new(kind)
    }

    /// The analysis kind.
    pub fn kind(&self) -> AnalysisKind {
        self.kind
    }

    /// Analysis grid rate shared by every stage.
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Samples per analysis grid step, `SAMPLE_RATE / fps`.
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Analysis window size in samples.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// The parameter set handed to every stage.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Whether stages run online. Always true for built descriptors.
    pub fn online(&self) -> bool {
        self.params.get_bool("online").unwrap_or(false)
    }

    /// The feature stage.
    pub fn feature(&self) -> FeatureKind {
        self.feature
    }

    /// The decode stages, in result order.
    pub fn decoders(&self) -> &[DecoderKind] {
        &self.decoders
    }
}

/// Builder for a [`PipelineDescriptor`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    kind: AnalysisKind,
    fps: u32,
    frame_size: usize,
    overrides: Params,
}

impl PipelineBuilder {
    /// Start with defaults: fps = 100, frame_size = 2048, no overrides.
    pub fn new(kind: AnalysisKind) -> Self {
        PipelineBuilder {
            kind,
            fps: DEFAULT_FPS,
            frame_size: FRAME_SIZE,
            overrides: Params::new(),
        }
    }

    /// Set the analysis grid rate.
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set the analysis window size in samples.
    pub fn frame_size(mut self, size: usize) -> Self {
        self.frame_size = size;
        self
    }

    /// Override a single parameter.
    pub fn param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.overrides.insert(name, value);
        self
    }

    /// Layer a whole override set on top of the ones already given.
    pub fn overrides(mut self, overrides: &Params) -> Self {
        self.overrides.layer(overrides);
        self
    }

    /// Validate and create the descriptor.
    pub fn build(self) -> Result<PipelineDescriptor, ConfigurationError> {
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(ConfigurationError::InvalidFps { fps: self.fps });
        }
        if SAMPLE_RATE % self.fps != 0 {
            return Err(ConfigurationError::FpsHopMismatch {
                fps: self.fps,
                sample_rate: SAMPLE_RATE,
            });
        }
        if self.frame_size == 0 {
            return Err(invalid("frame_size", "cannot be zero"));
        }

        // Online mode and the grid rate are forced; an override may restate
        // them but never change them.
        if let Some(online) = self.overrides.get("online") {
            if online.as_bool() != Some(true) {
                return Err(invalid("online", "only online processing is supported"));
            }
        }
        if let Some(fps) = self.overrides.get("fps") {
            if fps.as_f64() != Some(f64::from(self.fps)) {
                return Err(invalid("fps", "must match the pipeline fps"));
            }
        }

        let mut params = default_params(self.kind, self.fps);
        params.layer(&self.overrides);
        params.insert("online", true);
        params.insert("fps", self.fps);
        validate(&params, self.kind)?;

        let descriptor = PipelineDescriptor {
            kind: self.kind,
            fps: self.fps,
            hop_size: (SAMPLE_RATE / self.fps) as usize,
            frame_size: self.frame_size,
            params,
            feature: self.kind.feature(),
            decoders: self.kind.decoders().to_vec(),
        };
        debug!(
            "built {} pipeline: fps={} hop_size={} frame_size={} decoders={:?}",
            descriptor.kind,
            descriptor.fps,
            descriptor.hop_size,
            descriptor.frame_size,
            descriptor.decoders
        );
        Ok(descriptor)
    }
}

/// Build the descriptor for `kind` at `fps`, with `overrides` layered over
/// the kind's defaults.
pub fn build(
    kind: AnalysisKind,
    fps: u32,
    overrides: &Params,
) -> Result<PipelineDescriptor, ConfigurationError> {
    PipelineBuilder::new(kind).fps(fps).overrides(overrides).build()
}

/// The default parameter set of `kind` before overrides.
///
/// The combined kind takes the beat table first and the tempo table on top,
/// so the tempo bpm bounds win.
pub fn default_params(kind: AnalysisKind, fps: u32) -> Params {
    let mut params = match kind {
        AnalysisKind::BeatTracking => Params::from_table(BEAT_TRACKING_DEFAULTS),
        AnalysisKind::TempoEstimation => Params::from_table(TEMPO_ESTIMATION_DEFAULTS),
        AnalysisKind::OnsetDetection => {
            let mut params = Params::from_table(ONSET_DETECTION_DEFAULTS);
            params.insert("pre_max", 1.0 / f64::from(fps.max(1)));
            params
        }
        AnalysisKind::CombinedBeatTempo => {
            let mut params = Params::from_table(BEAT_TRACKING_DEFAULTS);
            params.layer(&Params::from_table(TEMPO_ESTIMATION_DEFAULTS));
            params
        }
    };
    params.insert("online", true);
    params.insert("fps", fps);
    params
}

const NON_NEGATIVE: &[&str] = &[
    "threshold",
    "transition_lambda",
    "act_smooth",
    "hist_smooth",
    "hist_buffer",
    "pre_max",
    "post_max",
    "pre_avg",
    "post_avg",
    "combine",
];

fn validate(params: &Params, kind: AnalysisKind) -> Result<(), ConfigurationError> {
    for &name in NON_NEGATIVE {
        if params.contains(name) {
            let value = number(params, name)?;
            if value < 0.0 {
                return Err(invalid(name, "must not be negative"));
            }
        }
    }
    if params.contains("delay") {
        number(params, "delay")?;
    }
    if params.contains("observation_lambda") && number(params, "observation_lambda")? <= 0.0 {
        return Err(invalid("observation_lambda", "must be positive"));
    }
    if params.contains("alpha") {
        let alpha = number(params, "alpha")?;
        if alpha <= 0.0 || alpha >= 1.0 {
            return Err(invalid("alpha", "must lie strictly between 0 and 1"));
        }
    }
    if params.contains("correct") && params.get_bool("correct").is_none() {
        return Err(invalid("correct", "expected a boolean"));
    }

    // The bounds only mean something to the tempo-aware decoders; other
    // kinds carry them through untouched.
    let uses_bpm = kind
        .decoders()
        .iter()
        .any(|d| matches!(d, DecoderKind::BeatTracker | DecoderKind::TempoEstimator));
    if uses_bpm {
        let min_bpm = number(params, "min_bpm")?;
        let max_bpm = number(params, "max_bpm")?;
        if min_bpm <= 0.0 {
            return Err(invalid("min_bpm", "must be positive"));
        }
        if max_bpm <= min_bpm {
            return Err(invalid("max_bpm", "must exceed min_bpm"));
        }
    }

    if kind.decoders().contains(&DecoderKind::TempoEstimator) {
        match params.get_str("method") {
            Some("comb") => {}
            Some(other) => {
                return Err(invalid(
                    "method",
                    &format!("tempo method `{other}` is not available, use `comb`"),
                ))
            }
            None => return Err(invalid("method", "expected a text value")),
        }
    }
    Ok(())
}

fn number(params: &Params, name: &str) -> Result<f64, ConfigurationError> {
    match params.get_f64(name) {
        Some(v) if v.is_finite() => Ok(v),
        Some(_) => Err(invalid(name, "must be finite")),
        None => Err(invalid(name, "expected a number")),
    }
}

fn invalid(name: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidParameter {
        name: name.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_forces_fps_and_online() {
        for kind in AnalysisKind::ALL {
            for fps in [50, 100, 441] {
                let d = build(kind, fps, &Params::new()).unwrap();
                assert_eq!(d.fps(), fps);
                assert!(d.online());
                assert_eq!(d.params().get_f64("fps"), Some(f64::from(fps)));
                assert_eq!(d.hop_size() * fps as usize, SAMPLE_RATE as usize);
            }
        }
    }

    #[test]
    fn beat_defaults_are_exact() {
        let d = build(AnalysisKind::BeatTracking, 100, &Params::new()).unwrap();
        let p = d.params();
        assert_eq!(p.get_f64("min_bpm"), Some(55.0));
        assert_eq!(p.get_f64("max_bpm"), Some(215.0));
        assert_eq!(p.get("transition_lambda"), Some(&ParamValue::Int(100)));
        assert_eq!(p.get("observation_lambda"), Some(&ParamValue::Int(16)));
        assert_eq!(p.get_f64("threshold"), Some(0.0));
        assert_eq!(p.get_bool("correct"), Some(true));
        assert_eq!(d.decoders(), &[DecoderKind::BeatTracker]);
    }

    #[test]
    fn onset_pre_max_is_one_frame() {
        let d = build(AnalysisKind::OnsetDetection, 50, &Params::new()).unwrap();
        assert_eq!(d.params().get_f64("pre_max"), Some(0.02));
        assert_eq!(d.params().get_f64("threshold"), Some(0.23));
        assert_eq!(d.feature(), FeatureKind::OnsetActivation);
    }

    #[test]
    fn combined_takes_tempo_bounds_and_orders_beat_first() {
        let d = build(AnalysisKind::CombinedBeatTempo, 100, &Params::new()).unwrap();
        assert_eq!(d.params().get_f64("min_bpm"), Some(40.0));
        assert_eq!(d.params().get_f64("max_bpm"), Some(250.0));
        assert_eq!(d.params().get_f64("transition_lambda"), Some(100.0));
        assert_eq!(d.params().get_f64("alpha"), Some(0.79));
        assert_eq!(
            d.decoders(),
            &[DecoderKind::BeatTracker, DecoderKind::TempoEstimator]
        );
    }

    #[test]
    fn overrides_win_and_unknown_keys_pass_through() {
        let d = PipelineDescriptor::builder(AnalysisKind::TempoEstimation)
            .param("alpha", 0.5)
            .param("my_model_knob", "fast")
            .build()
            .unwrap();
        assert_eq!(d.params().get_f64("alpha"), Some(0.5));
        assert_eq!(d.params().get_str("my_model_knob"), Some("fast"));
    }

    #[test]
    fn rejects_bad_fps() {
        assert_eq!(
            build(AnalysisKind::BeatTracking, 0, &Params::new()),
            Err(ConfigurationError::InvalidFps { fps: 0 })
        );
        assert!(matches!(
            build(AnalysisKind::BeatTracking, 11, &Params::new()),
            Err(ConfigurationError::FpsHopMismatch { fps: 11, .. })
        ));
        // Divides the sample rate, but the decoders would need gigabytes.
        assert_eq!(
            build(AnalysisKind::TempoEstimation, 44_100, &Params::new()),
            Err(ConfigurationError::InvalidFps { fps: 44_100 })
        );
        assert!(build(AnalysisKind::CombinedBeatTempo, 900, &Params::new()).is_ok());
    }

    #[test]
    fn bpm_keys_pass_through_kinds_without_tempo_decoders() {
        let lone = Params::new().with("min_bpm", 100.0);
        let d = build(AnalysisKind::OnsetDetection, 100, &lone).unwrap();
        assert_eq!(d.params().get_f64("min_bpm"), Some(100.0));
        assert_eq!(d.params().get("max_bpm"), None);

        let text = Params::new().with("max_bpm", "fast");
        assert!(build(AnalysisKind::OnsetDetection, 100, &text).is_ok());
        assert!(build(AnalysisKind::BeatTracking, 100, &text).is_err());
        assert!(build(AnalysisKind::BeatTracking, 100, &lone).is_ok());
    }

    #[test]
    fn rejects_offline_and_conflicting_fps() {
        let offline = Params::new().with("online", false);
        assert!(matches!(
            build(AnalysisKind::OnsetDetection, 100, &offline),
            Err(ConfigurationError::InvalidParameter { name, .. }) if name == "online"
        ));
        let other_fps = Params::new().with("fps", 50);
        assert!(build(AnalysisKind::OnsetDetection, 100, &other_fps).is_err());
        let same_fps = Params::new().with("fps", 100);
        assert!(build(AnalysisKind::OnsetDetection, 100, &same_fps).is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            Params::new().with("min_bpm", 300.0),
            Params::new().with("alpha", 1.0),
            Params::new().with("threshold", -0.1),
            Params::new().with("threshold", "high"),
            Params::new().with("method", "acf"),
            Params::new().with("hist_buffer", f64::NAN),
        ];
        for overrides in cases {
            assert!(
                build(AnalysisKind::TempoEstimation, 100, &overrides).is_err(),
                "{overrides:?}"
            );
        }
    }

    #[test]
    fn parses_kind_names() {
        assert_eq!("beat".parse::<AnalysisKind>(), Ok(AnalysisKind::BeatTracking));
        assert_eq!(" Beat+Tempo ".parse::<AnalysisKind>(), Ok(AnalysisKind::CombinedBeatTempo));
        assert_eq!(
            "chords".parse::<AnalysisKind>(),
            Err(ConfigurationError::UnknownKind("chords".into()))
        );
    }
}
