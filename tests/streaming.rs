//! Integration tests for beat, tempo and onset analysis on synthesized click tracks.

use beat_stream::{
    dominant_tempi, process, AnalysisKind, BeatTempoAnalyzer, HopAssembler, Params, PcmFormat,
    PipelineDescriptor, Session, SAMPLE_RATE,
};
use lazy_static::lazy_static;
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use std::sync::{Arc, Mutex};

const SECONDS: usize = 15;
const BPM: f64 = 120.0;
const FIRST_CLICK: f64 = 0.25;

/// A 1 kHz blip every beat, decaying within a few milliseconds.
fn click_track(seconds: usize, bpm: f64) -> Vec<f32> {
    let sr = SAMPLE_RATE as usize;
    let mut out = vec![0.0f32; seconds * sr];
    let period = 60.0 / bpm;
    let mut t = FIRST_CLICK;
    while t < seconds as f64 {
        let start = (t * sr as f64).round() as usize;
        for i in 0..400 {
            if let Some(s) = out.get_mut(start + i) {
                let phase = 2.0 * std::f32::consts::PI * 1000.0 * i as f32 / sr as f32;
                *s = 0.8 * phase.sin() * (-(i as f32) / 80.0).exp();
            }
        }
        t += period;
    }
    out
}

lazy_static! {
    static ref CLICKS: Vec<f32> = click_track(SECONDS, BPM);
}

/// Run `samples` through a fresh session, returning every hop's results.
fn analyze(descriptor: &PipelineDescriptor, samples: &[f32], chunk: usize) -> Vec<Vec<Vec<f64>>> {
    let mut session = Session::new(descriptor);
    let mut assembler = HopAssembler::new(descriptor);
    let mut out = Vec::new();
    for piece in samples.chunks(chunk) {
        assembler
            .push(piece, false, |hop, reset| {
                let results = process(descriptor, &mut session, &PcmFormat::SUPPORTED, &hop, reset)?;
                // Hops arrive in lockstep.
                assert_eq!(session.last_start_time(), Some(hop.start_time()));
                assert_eq!(session.hops_processed(), hop.index + 1);
                out.push(results);
                Ok::<_, beat_stream::ProcessError>(())
            })
            .unwrap();
    }
    out
}

fn bits(results: &[Vec<Vec<f64>>]) -> Vec<Vec<Vec<u64>>> {
    results
        .iter()
        .map(|hop| {
            hop.iter()
                .map(|buf| buf.iter().map(|v| v.to_bits()).collect())
                .collect()
        })
        .collect()
}

#[test]
fn tempo_locks_onto_the_click_rate() {
    let descriptor = PipelineDescriptor::builder(AnalysisKind::TempoEstimation)
        .build()
        .unwrap();
    let results = analyze(&descriptor, &CLICKS, 1024);
    let rows = &results.last().unwrap()[0];

    assert!(rows.len() >= 2 && rows.len() % 2 == 0);
    let strongest = rows[0];
    assert!(
        (strongest - BPM).abs() < 6.0,
        "strongest tempo {strongest} bpm, rows {rows:?}"
    );
    let total: f64 = rows.chunks(2).map(|r| r[1]).sum();
    approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
}

#[test]
fn beats_fall_on_the_clicks() {
    let descriptor = PipelineDescriptor::builder(AnalysisKind::CombinedBeatTempo)
        .build()
        .unwrap();
    let results = analyze(&descriptor, &CLICKS, 4096);
    let beats: Vec<f64> = results.iter().flat_map(|hop| hop[0].clone()).collect();

    assert!(beats.len() >= 15, "only {} beats: {beats:?}", beats.len());
    for pair in beats.windows(2) {
        assert!(pair[1] > pair[0]);
        assert!(
            (pair[1] - pair[0] - 60.0 / BPM).abs() < 0.025,
            "beat interval {pair:?}"
        );
    }

    let (t1, t2) = dominant_tempi(&results.last().unwrap()[1]);
    let near = |t: Option<beat_stream::Prediction<beat_stream::Tempo>>| {
        t.is_some_and(|p| (p.value.bpm - BPM).abs() < 6.0)
    };
    assert!(near(t1) || near(t2), "{t1:?} {t2:?}");
}

#[test]
fn one_onset_per_click() {
    let descriptor = PipelineDescriptor::builder(AnalysisKind::OnsetDetection)
        .build()
        .unwrap();
    let results = analyze(&descriptor, &CLICKS, 512);
    let onsets: Vec<f64> = results.iter().flat_map(|hop| hop[0].clone()).collect();

    let clicks = ((SECONDS as f64 - FIRST_CLICK) * BPM / 60.0).ceil() as usize;
    assert!(
        onsets.len().abs_diff(clicks) <= 2,
        "{} onsets for {clicks} clicks: {onsets:?}",
        onsets.len()
    );
    let steady = onsets
        .windows(2)
        .filter(|pair| (pair[1] - pair[0] - 60.0 / BPM).abs() < 0.03)
        .count();
    assert!(steady * 10 >= (onsets.len() - 1) * 9, "{onsets:?}");
}

#[test]
fn chunking_does_not_change_results() {
    let descriptor = PipelineDescriptor::builder(AnalysisKind::OnsetDetection)
        .build()
        .unwrap();
    let samples = &CLICKS[..SAMPLE_RATE as usize * 3];
    let small = analyze(&descriptor, samples, 100);
    let large = analyze(&descriptor, samples, 44_100);
    assert_eq!(bits(&small), bits(&large));
}

#[test]
fn parallel_sessions_are_independent() {
    let kinds = AnalysisKind::ALL.to_vec();
    let samples = &CLICKS[..SAMPLE_RATE as usize * 4];

    let sequential: Vec<_> = kinds
        .iter()
        .map(|&kind| {
            let descriptor = beat_stream::build(kind, 100, &Params::new()).unwrap();
            bits(&analyze(&descriptor, samples, 2048))
        })
        .collect();

    let mismatches = Arc::new(Mutex::new(Vec::new()));
    kinds.par_iter().enumerate().for_each(|(i, &kind)| {
        let descriptor = beat_stream::build(kind, 100, &Params::new()).unwrap();
        if bits(&analyze(&descriptor, samples, 2048)) != sequential[i] {
            mismatches.lock().unwrap().push(kind);
        }
    });

    let mismatches = Arc::try_unwrap(mismatches).unwrap().into_inner().unwrap();
    assert!(mismatches.is_empty(), "diverged: {mismatches:?}");
}

#[test]
fn carried_state_differs_from_reset() {
    let descriptor = PipelineDescriptor::builder(AnalysisKind::CombinedBeatTempo)
        .build()
        .unwrap();
    let mut warm = Session::new(&descriptor);
    let mut cold = Session::new(&descriptor);
    let mut assembler = HopAssembler::new(&descriptor);
    let mut last = None;

    assembler
        .push(&CLICKS[..SAMPLE_RATE as usize * 8], false, |hop, _| {
            let carried = process(&descriptor, &mut warm, &PcmFormat::SUPPORTED, &hop, false)?;
            let fresh = process(&descriptor, &mut cold, &PcmFormat::SUPPORTED, &hop, true)?;
            last = Some((carried, fresh));
            Ok::<_, beat_stream::ProcessError>(())
        })
        .unwrap();

    let (carried, fresh) = last.unwrap();
    assert!(fresh[0].is_empty());
    assert!(fresh[1][0].is_nan());
    assert!(!carried[1][0].is_nan());
    assert_eq!(cold.hops_processed(), 1);
}

#[test]
fn analyzer_follows_a_stereo_capture() {
    let mut analyzer = BeatTempoAnalyzer::new().unwrap();
    let bytes: Vec<u8> = CLICKS
        .iter()
        .flat_map(|&s| {
            let v = (s * f32::from(i16::MAX)) as i16;
            let le = v.to_le_bytes();
            [le[0], le[1], le[0], le[1]]
        })
        .collect();

    for chunk in bytes.chunks(4 * 1024) {
        let result = analyzer.push_stereo_i16(chunk).unwrap();
        assert!(!result.was_reset());
    }

    let now = analyzer.current_time();
    approx::assert_abs_diff_eq!(now, SECONDS as f64, epsilon = 1e-9);
    let result = analyzer.result();
    assert!(!result.beats_after(now - 2.0).is_empty());
    let tempi = [result.t1(), result.t2()];
    assert!(
        tempi
            .iter()
            .flatten()
            .any(|p| (p.value.bpm - BPM).abs() < 6.0),
        "{tempi:?}"
    );
}
