//! # beat_stream
//!
//! Hop-by-hop rhythmic analysis of a live mono audio stream: beat positions,
//! tempo and onsets, computed online so every hop advances the analysis
//! without re-reading the past.
//!
//! A [`PipelineDescriptor`] describes one analysis task and is immutable.
//! A [`Session`] holds the live stages for one stream. [`process`] drives a
//! single hop through the feature stage and fans the activation out to every
//! decode stage.
//!
//! ## Example
//! ```rust
//! use beat_stream::{process, AnalysisKind, Hop, PcmFormat, PipelineDescriptor, Session};
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1) Describe the task
//!     let descriptor = PipelineDescriptor::builder(AnalysisKind::CombinedBeatTempo)
//!         .fps(100)
//!         .param("alpha", 0.8)
//!         .build()?;
//!
//!     // 2) One session per stream
//!     let mut session = Session::new(&descriptor);
//!
//!     // 3) In your audio loop:
//!     let samples = vec![0.0f32; descriptor.hop_size()]; // fill with actual samples
//!     for index in 0..10 {
//!         let hop = Hop::on_grid(&descriptor, index, &samples);
//!         let results = process(&descriptor, &mut session, &PcmFormat::SUPPORTED, &hop, false)?;
//!         println!("beats: {:?}, tempo rows: {:?}", results[0], results[1]);
//!     }
//!
//!     Ok(())
//! }
//! # run().unwrap();
//! ```
//!
//! ## Features
//! - `serialization`: `serde` support for parameters and analysis kinds

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rust_2018_idioms)]
#![deny(clippy::all)]

/// Per-hop entry points and sessions.
pub use dispatcher::{
    process, process_bytes, start_time, Hop, ProcessError, RawHop, Session, StageFailure,
    StagePosition,
};

/// Descriptors and the factory that builds them.
pub use pipeline::{
    build, default_params, AnalysisKind, ConfigurationError, DecoderKind, FeatureKind,
    PipelineBuilder, PipelineDescriptor, DEFAULT_FPS, FRAME_SIZE, MAX_FPS, SAMPLE_RATE,
};

/// The fixed audio contract.
pub use pcm::{PcmFormat, UnsupportedFormatError};

/// Parameter sets.
pub use params::{ParamValue, Params};

/// The stage seam.
pub use stage::{Activation, DecodeStage, FeatureStage, Signal, Stage, StageError};

/// Host-side streaming helpers.
pub use stream::{BeatTempoAnalyzer, BeatTempoResult, HopAssembler};

/// Tempo results.
pub use tempo::{dominant_tempi, Prediction, Tempo};

/// Silence detection.
pub use silence::SilenceDetector;

/// Online beat tracking.
pub mod beats;

/// Streaming dispatcher.
pub mod dispatcher;

/// Spectral flux feature extraction.
pub mod features;

/// Online onset detection.
pub mod onsets;

/// Typed analysis parameters and default tables.
pub mod params;

/// PCM boundary adapter.
pub mod pcm;

/// Pipeline descriptors and factory.
pub mod pipeline;

/// Silence detection.
pub mod silence;

/// Stage trait and its data types.
pub mod stage;

/// Hop assembly and rolling results.
pub mod stream;

/// Comb filter tempo estimation.
pub mod tempo;
