//! Stream
//!
//! Glue for hosts that capture audio in arbitrary chunk sizes: cut the
//! stream into hops on the analysis grid, keep a rolling result, and reset
//! the analysis after a stretch of silence.

use log::{debug, warn};

use crate::{
    dispatcher::{process, Hop, ProcessError, Session},
    pcm::{downmix_stereo_i16, PcmFormat},
    pipeline::{AnalysisKind, ConfigurationError, PipelineDescriptor, SAMPLE_RATE},
    silence::{SilenceDetector, DEFAULT_SILENCE},
    tempo::{dominant_tempi, Prediction, Tempo},
};

/// Cuts a continuous sample stream into hops.
///
/// Every emitted hop carries the newest `frame_size` samples, so consecutive
/// hops overlap whenever the frame is longer than the hop.
#[derive(Debug, Clone)]
pub struct HopAssembler {
    hop_size: usize,
    window: Vec<f32>,
    hop_index: u64,
    hop_offset: usize,
    pending_reset: bool,
}

impl HopAssembler {
    /// Assemble hops on the grid of `descriptor`.
    pub fn new(descriptor: &PipelineDescriptor) -> Self {
        HopAssembler::with_sizes(descriptor.hop_size(), descriptor.frame_size())
    }

    /// Assemble hops of `hop_size` samples into frames of `frame_size`.
    pub fn with_sizes(hop_size: usize, frame_size: usize) -> Self {
        HopAssembler {
            hop_size: hop_size.max(1),
            window: vec![0.0; frame_size.max(1)],
            hop_index: 0,
            hop_offset: 0,
            pending_reset: false,
        }
    }

    /// Index of the next hop to be emitted.
    pub fn hop_index(&self) -> u64 {
        self.hop_index
    }

    /// Stream position in seconds, counting samples not yet emitted.
    pub fn current_time(&self) -> f64 {
        (self.hop_index as f64 * self.hop_size as f64 + self.hop_offset as f64)
            / f64::from(SAMPLE_RATE)
    }

    /// Have the next emitted hop restart the analysis at index zero.
    pub fn request_reset(&mut self) {
        self.pending_reset = true;
    }

    /// Append `chunk` and call `on_hop` for every hop it completes, with the
    /// reset flag for that hop.
    ///
    /// A reset applies to the next emitted hop, which restarts at index zero;
    /// if `chunk` completes no hop the request carries over to a later call.
    ///
    /// When `on_hop` fails the whole chunk is still taken in, but no further
    /// hops are emitted for it. The frame window is cleared and the next hop
    /// is emitted with a reset.
    pub fn push<E>(
        &mut self,
        chunk: &[f32],
        reset: bool,
        mut on_hop: impl FnMut(Hop<'_>, bool) -> Result<(), E>,
    ) -> Result<(), E> {
        self.pending_reset |= reset;

        let mut outcome = Ok(());
        let mut rest = chunk;
        while !rest.is_empty() {
            let take = (self.hop_size - self.hop_offset).min(rest.len());
            let (head, tail) = rest.split_at(take);
            self.write(head);
            self.hop_offset += take;
            rest = tail;

            if self.hop_offset < self.hop_size {
                continue;
            }
            self.hop_offset = 0;
            if outcome.is_err() {
                self.hop_index += 1;
                continue;
            }

            let reset = std::mem::take(&mut self.pending_reset);
            if reset {
                self.hop_index = 0;
            }
            let hop = Hop::new(self.hop_index, self.hop_size, self.window.len(), &self.window);
            self.hop_index += 1;
            if let Err(err) = on_hop(hop, reset) {
                self.window.fill(0.0);
                self.pending_reset = true;
                outcome = Err(err);
            }
        }
        outcome
    }

    fn write(&mut self, data: &[f32]) {
        let n = self.window.len();
        if data.len() >= n {
            self.window.copy_from_slice(&data[data.len() - n..]);
        } else {
            self.window.copy_within(data.len().., 0);
            self.window[n - data.len()..].copy_from_slice(data);
        }
    }
}

/// Rolling beat and tempo result of a [`BeatTempoAnalyzer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeatTempoResult {
    t1: Option<Prediction<Tempo>>,
    t2: Option<Prediction<Tempo>>,
    beats: Vec<f64>,
    was_reset: bool,
}

impl BeatTempoResult {
    /// The slower of the two dominant tempi, or the only one.
    pub fn t1(&self) -> Option<Prediction<Tempo>> {
        self.t1
    }

    /// The faster of the two dominant tempi.
    pub fn t2(&self) -> Option<Prediction<Tempo>> {
        self.t2
    }

    /// Every beat since the last reset, in seconds.
    pub fn beats(&self) -> &[f64] {
        &self.beats
    }

    /// Whether the last chunk restarted the analysis.
    pub fn was_reset(&self) -> bool {
        self.was_reset
    }

    /// Beats from the last one at or before `time` onwards. Empty when no
    /// beat is that early.
    pub fn beats_after(&self, time: f64) -> &[f64] {
        match self.beats.iter().rposition(|&b| b <= time) {
            Some(i) => &self.beats[i..],
            None => &[],
        }
    }

    /// Mark the start of a new chunk.
    pub fn before_chunk(&mut self) {
        self.was_reset = false;
    }

    /// Fold in the outcome of one hop.
    pub fn after_hop(
        &mut self,
        t1: Option<Prediction<Tempo>>,
        t2: Option<Prediction<Tempo>>,
        beats: &[f64],
        reset: bool,
    ) {
        if reset {
            self.beats.clear();
            self.was_reset = true;
        }
        self.t1 = t1;
        self.t2 = t2;
        self.beats.extend_from_slice(beats);
    }
}

/// Live beat and tempo analysis of a mono sample stream.
///
/// Wraps a combined beat and tempo pipeline with hop assembly and silence
/// detection: after [`DEFAULT_SILENCE`] of quiet input the next hop restarts
/// the analysis.
#[derive(Debug)]
pub struct BeatTempoAnalyzer {
    descriptor: PipelineDescriptor,
    session: Session,
    assembler: HopAssembler,
    silence: SilenceDetector,
    result: BeatTempoResult,
}

impl BeatTempoAnalyzer {
    /// Analyze with the default combined pipeline.
    pub fn new() -> Result<Self, ConfigurationError> {
        Self::with_descriptor(PipelineDescriptor::builder(AnalysisKind::CombinedBeatTempo).build()?)
    }

    /// Analyze with a custom combined pipeline.
    pub fn with_descriptor(descriptor: PipelineDescriptor) -> Result<Self, ConfigurationError> {
        if descriptor.kind() != AnalysisKind::CombinedBeatTempo {
            return Err(ConfigurationError::InvalidParameter {
                name: "kind".to_owned(),
                reason: format!(
                    "expected a {} pipeline, got {}",
                    AnalysisKind::CombinedBeatTempo,
                    descriptor.kind()
                ),
            });
        }
        Ok(BeatTempoAnalyzer {
            session: Session::new(&descriptor),
            assembler: HopAssembler::new(&descriptor),
            silence: SilenceDetector::new(DEFAULT_SILENCE, SAMPLE_RATE),
            result: BeatTempoResult::default(),
            descriptor,
        })
    }

    /// The pipeline in use.
    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }

    /// The result so far.
    pub fn result(&self) -> &BeatTempoResult {
        &self.result
    }

    /// Stream position in seconds.
    pub fn current_time(&self) -> f64 {
        self.assembler.current_time()
    }

    /// Restart the analysis on the next hop.
    pub fn reset(&mut self) {
        self.assembler.request_reset();
        self.silence.reset();
    }

    /// Feed mono samples at 44.1 kHz.
    ///
    /// After an error the chunk is still buffered and the next hop restarts
    /// the analysis, so a host can keep pushing.
    pub fn push(&mut self, chunk: &[f32]) -> Result<&BeatTempoResult, ProcessError> {
        self.silence.update(chunk);
        self.feed(chunk)
    }

    /// Feed interleaved 16-bit little-endian stereo bytes at 44.1 kHz.
    pub fn push_stereo_i16(&mut self, bytes: &[u8]) -> Result<&BeatTempoResult, ProcessError> {
        let mono = downmix_stereo_i16(bytes)?;
        self.silence.update_stereo_i16(bytes);
        self.feed(&mono)
    }

    fn feed(&mut self, chunk: &[f32]) -> Result<&BeatTempoResult, ProcessError> {
        let silent = self.silence.is_silence();
        if silent {
            debug!("input silent for {:?}, restarting analysis", DEFAULT_SILENCE);
        }

        self.result.before_chunk();
        let descriptor = &self.descriptor;
        let session = &mut self.session;
        let result = &mut self.result;
        let pushed = self.assembler.push(chunk, silent, |hop, reset| {
            let out = process(descriptor, session, &PcmFormat::SUPPORTED, &hop, reset)?;
            let (t1, t2) = dominant_tempi(&out[1]);
            result.after_hop(t1, t2, &out[0], reset);
            Ok::<_, ProcessError>(())
        });
        if let Err(err) = pushed {
            warn!("{err}, restarting analysis on the next hop");
            return Err(err);
        }

        if silent && self.result.was_reset() {
            warn!("analysis restarted after silence");
            self.silence.reset();
        }
        Ok(&self.result)
    }
}
