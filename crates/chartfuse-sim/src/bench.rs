//! Flicker, accuracy and latency benchmark.
//!
//! Runs a scenario through a real pipeline and compares what a naive
//! per-frame threshold on the fused posterior would have shown against the
//! stabilized output.

use crate::SimError;
use crate::chart::ChartRenderer;
use crate::detectors::SyntheticDetectors;
use crate::scenarios::Scenario;
use chartfuse::calibration::{Correction, ReliabilityTracker};
use chartfuse::policy::PowerGovernor;
use chartfuse::{FramePipeline, LearningChannel, PatternLabel, PipelineConfig, ReliabilityProfiles};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub scenario: String,
    pub frames: u64,
    pub processed: u64,
    pub cache_hits: u64,
    pub hit_rate: f64,
    pub average_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Label appearances plus disappearances when thresholding each
    /// processed frame's fused posterior.
    pub raw_flicker: usize,
    /// The same count over the stable set reported to the caller.
    pub stable_flicker: usize,
    /// Per-frame count of stable labels that were really on screen.
    pub true_stable_frames: u64,
    /// Per-frame count of stable labels that were not.
    pub false_stable_frames: u64,
    /// Per-frame count of on-screen labels that were not stable.
    pub missed_frames: u64,
    /// Mean time from a pattern appearing to it being reported stable.
    pub mean_time_to_stable_ms: Option<f64>,
    /// Profiles re-estimated from the processed frames, scored against the
    /// scenario's ground truth as if a user had corrected every detection.
    pub calibrated: ReliabilityProfiles,
}

fn toggles(prev: &BTreeSet<PatternLabel>, next: &BTreeSet<PatternLabel>) -> usize {
    prev.symmetric_difference(next).count()
}

/// Detectors behave exactly as `config.reliability` describes.
pub fn run_benchmark(
    scenario: &Scenario,
    config: PipelineConfig,
    seed: u64,
) -> Result<BenchmarkReport, SimError> {
    let actual = config.reliability;
    run_benchmark_with(scenario, config, actual, seed)
}

/// Detectors behave as `actual` while the pipeline fuses with the profiles
/// in `config`, e.g. ones calibrated on an earlier run.
pub fn run_benchmark_with(
    scenario: &Scenario,
    config: PipelineConfig,
    actual: ReliabilityProfiles,
    seed: u64,
) -> Result<BenchmarkReport, SimError> {
    let threshold = config.stabilizer.confidence_threshold;
    let base_profiles = config.reliability;
    let detectors = SyntheticDetectors::new(scenario.clone(), actual, seed)?;
    let channel = LearningChannel::new(scenario.frame_count() as usize + 1);
    let mut pipeline = FramePipeline::new(config, detectors)?.with_learning_sink(channel.sink());
    let mut governor = PowerGovernor::new(pipeline.delta_tolerance());
    let mut renderer = ChartRenderer::new(
        scenario.width,
        scenario.height,
        scenario.motion,
        scenario.sensor_noise,
        seed,
    );

    let mut stable_prev = BTreeSet::new();
    let mut stable_flicker = 0;
    let (mut true_stable, mut false_stable, mut missed) = (0u64, 0u64, 0u64);
    let mut max_latency_ms: f64 = 0.0;
    let mut first_stable: Vec<Option<u64>> = vec![None; scenario.patterns.len()];

    for index in 0..scenario.frame_count() {
        let ts = scenario.timestamp_of(index);
        if let Some(device) = scenario.device_at(ts) {
            governor.observe(&device);
        }
        let frame = renderer.render(index, ts)?;
        let result = pipeline.handle_frame(&frame);
        max_latency_ms = max_latency_ms.max(result.processing_latency_ms);

        let stable: BTreeSet<PatternLabel> = result.stable().map(|d| d.label.clone()).collect();
        stable_flicker += toggles(&stable_prev, &stable);

        for label in &stable {
            if scenario.is_active(label, ts) {
                true_stable += 1;
            } else {
                false_stable += 1;
            }
        }
        for label in scenario.active_at(ts) {
            if !stable.contains(label) {
                missed += 1;
            }
        }
        for (span, seen) in scenario.patterns.iter().zip(first_stable.iter_mut()) {
            if seen.is_none() && span.is_active(ts) && stable.contains(&span.label) {
                *seen = Some(ts - span.start_ms);
            }
        }
        stable_prev = stable;
    }

    let mut raw_prev = BTreeSet::new();
    let mut raw_flicker = 0;
    let mut tracker = ReliabilityTracker::default();
    for record in channel.receiver().drain() {
        let ts = record.frame.timestamp_ms;
        for fused in &record.fused {
            tracker.record(&if scenario.is_active(&fused.label, ts) {
                Correction::confirm(fused)
            } else {
                Correction::reject(fused)
            });
        }
        for label in scenario.active_at(ts) {
            if !record.fused.iter().any(|f| &f.label == label) {
                tracker.record(&Correction::missed(label.clone()));
            }
        }

        let raw: BTreeSet<PatternLabel> = record
            .fused
            .iter()
            .filter(|f| f.posterior >= threshold)
            .map(|f| f.label.clone())
            .collect();
        raw_flicker += toggles(&raw_prev, &raw);
        raw_prev = raw;
    }

    let delays: Vec<u64> = first_stable.into_iter().flatten().collect();
    let mean_time_to_stable_ms = if delays.is_empty() {
        None
    } else {
        Some(delays.iter().sum::<u64>() as f64 / delays.len() as f64)
    };

    let stats = pipeline.stats();
    let report = BenchmarkReport {
        scenario: scenario.name.to_string(),
        frames: stats.frames,
        processed: stats.processed,
        cache_hits: stats.cache_hits,
        hit_rate: stats.hit_rate(),
        average_latency_ms: stats.average_latency_ms(),
        max_latency_ms,
        raw_flicker,
        stable_flicker,
        true_stable_frames: true_stable,
        false_stable_frames: false_stable,
        missed_frames: missed,
        mean_time_to_stable_ms,
        calibrated: tracker.calibrated(&base_profiles),
    };
    info!(
        scenario = scenario.name,
        raw_flicker,
        stable_flicker,
        hit_rate = report.hit_rate,
        "benchmark finished"
    );
    Ok(report)
}
