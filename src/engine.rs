//! Frame Pipeline Controller
//!
//! `FramePipeline` owns one stream's state (delta baseline, stabilization
//! window, last fused output) and runs every frame through
//! delta check -> detectors -> fusion -> stabilizer. Frames must arrive one at
//! a time in timestamp order; a pipeline is never shared between streams.

use crate::config::PipelineConfig;
use crate::delta::{DeltaDecision, DeltaOptimizer, DeltaStats, DeltaTolerance, ProcessReason};
use crate::detection::{
    CandidateDetection, DetectorSource, FusedDetection, PipelineResult, StabilizedDetection,
};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::fusion::BayesianFusion;
use crate::learning::{LearningRecord, LearningSink};
use crate::metrics;
use crate::stabilizer::TemporalStabilizer;
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

// --- Detector seam ---

/// Wraps the ML model and the template matcher. Resource management (model
/// loading, accelerator delegates, tensor pools) stays behind this trait.
pub trait DetectorAdapter: Send {
    fn name(&self) -> &str {
        "detector-adapter"
    }

    /// Candidates `source` finds in `frame`.
    fn detect(
        &mut self,
        frame: &Frame,
        source: DetectorSource,
    ) -> Result<Vec<CandidateDetection>, PipelineError>;
}

impl<F> DetectorAdapter for F
where
    F: FnMut(&Frame, DetectorSource) -> Result<Vec<CandidateDetection>, PipelineError> + Send,
{
    fn detect(
        &mut self,
        frame: &Frame,
        source: DetectorSource,
    ) -> Result<Vec<CandidateDetection>, PipelineError> {
        self(frame, source)
    }
}

/// Adapter for hosts that run their own detectors and hand the candidates
/// in with each frame (C ABI, replay files).
#[derive(Debug, Default, Clone)]
pub struct PrecomputedDetections {
    pending: Vec<CandidateDetection>,
    failure: Option<String>,
}

impl PrecomputedDetections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates for the next processed frame. Replaces anything loaded
    /// before.
    pub fn load(&mut self, candidates: Vec<CandidateDetection>) {
        self.pending = candidates;
        self.failure = None;
    }

    /// Like `load`, from a JSON array. An unparsable payload makes both
    /// sources report unavailable for the next frame.
    pub fn load_json(&mut self, json: &str) {
        match serde_json::from_str::<Vec<CandidateDetection>>(json) {
            Ok(candidates) => self.load(candidates),
            Err(e) => {
                self.pending.clear();
                self.failure = Some(format!("malformed candidates: {e}"));
            }
        }
    }

    pub fn pending(&self) -> &[CandidateDetection] {
        &self.pending
    }
}

impl DetectorAdapter for PrecomputedDetections {
    fn name(&self) -> &str {
        "precomputed"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        source: DetectorSource,
    ) -> Result<Vec<CandidateDetection>, PipelineError> {
        if let Some(reason) = &self.failure {
            return Err(PipelineError::DetectorUnavailable {
                detector: source,
                reason: reason.clone(),
            });
        }
        Ok(self
            .pending
            .iter()
            .filter(|c| c.source == source)
            .map(|c| CandidateDetection {
                frame_timestamp_ms: frame.timestamp_ms(),
                ..c.clone()
            })
            .collect())
    }
}

fn run_adapter<D: DetectorAdapter>(
    adapter: &mut D,
    frame: &Frame,
    source: DetectorSource,
    errors: &mut Vec<PipelineError>,
) -> Vec<CandidateDetection> {
    match adapter.detect(frame, source) {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(adapter = adapter.name(), source = %source, error = %err, "detector failed");
            errors.push(err);
            Vec::new()
        }
    }
}

// --- Stats ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub processed: u64,
    pub cache_hits: u64,
    pub forced: u64,
    pub stale_frames: u64,
    /// Frames whose result carried at least one error.
    pub degraded_frames: u64,
    pub total_latency_ms: f64,
}

impl PipelineStats {
    pub fn hit_rate(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.frames as f64
        }
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.total_latency_ms / self.frames as f64
        }
    }
}

// --- Controller ---

pub struct FramePipeline<D: DetectorAdapter> {
    id: Uuid,
    config: PipelineConfig,
    adapter: D,
    fusion: BayesianFusion,
    stabilizer: TemporalStabilizer,
    optimizer: DeltaOptimizer,
    learning: Option<LearningSink>,
    last_fused: Vec<FusedDetection>,
    last_stabilized: Vec<StabilizedDetection>,
    /// Labels that decayed while frames were being reused; reported with the
    /// next processed frame.
    pending_retired: Vec<StabilizedDetection>,
    sequence: u64,
    stats: PipelineStats,
}

impl<D: DetectorAdapter> FramePipeline<D> {
    /// Validates `config` and fails fast with `ConfigurationError`.
    pub fn new(config: PipelineConfig, adapter: D) -> Result<Self, PipelineError> {
        config.validate()?;
        let fusion = BayesianFusion::new(config.reliability, config.priors.clone())?;
        let stabilizer = TemporalStabilizer::new(config.stabilizer.clone())?;
        let optimizer = DeltaOptimizer::new(&config.delta)?;
        let id = Uuid::new_v4();
        metrics::init();

        info!(
            pipeline = %id,
            adapter = adapter.name(),
            window_frames = config.stabilizer.window_frames,
            consensus_votes = stabilizer.consensus_votes(),
            window_ms = config.stabilizer.window_duration_ms,
            tolerance_bits = config.delta.tolerance_bits,
            "pipeline configured"
        );

        Ok(Self {
            id,
            config,
            adapter,
            fusion,
            stabilizer,
            optimizer,
            learning: None,
            last_fused: Vec::new(),
            last_stabilized: Vec::new(),
            pending_retired: Vec::new(),
            sequence: 0,
            stats: PipelineStats::default(),
        })
    }

    pub fn with_learning_sink(mut self, sink: LearningSink) -> Self {
        self.learning = Some(sink);
        self
    }

    pub fn set_learning_sink(&mut self, sink: Option<LearningSink>) {
        self.learning = sink;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn adapter(&self) -> &D {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut D {
        &mut self.adapter
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn delta_stats(&self) -> DeltaStats {
        self.optimizer.stats()
    }

    /// Shared handle to the reuse tolerance, for a power/thermal policy.
    pub fn delta_tolerance(&self) -> DeltaTolerance {
        self.optimizer.tolerance()
    }

    pub fn set_delta_tolerance(&self, bits: u32) {
        self.optimizer.tolerance().set(bits);
    }

    pub fn last_stabilized(&self) -> &[StabilizedDetection] {
        &self.last_stabilized
    }

    /// Run one frame through the pipeline. Never fails: problems are reported
    /// in `PipelineResult::errors` next to whatever output could be produced.
    pub fn handle_frame(&mut self, frame: &Frame) -> PipelineResult {
        let started = Instant::now();
        let ts = frame.timestamp_ms();
        self.stats.frames += 1;
        metrics::FRAMES_TOTAL.inc();

        let mut result = match self.stabilizer.check_timestamp(ts) {
            Err(err) => {
                warn!(pipeline = %self.id, error = %err, "out-of-order frame ignored");
                self.stats.stale_frames += 1;
                let mut result = PipelineResult::empty(ts);
                result.stabilized = self.last_stabilized.clone();
                result.errors.push(err);
                result
            }
            Ok(()) => match self.optimizer.should_process(frame) {
                DeltaDecision::Reuse { distance } => {
                    trace!(pipeline = %self.id, timestamp_ms = ts, distance, "reusing previous result");
                    self.reuse(ts)
                }
                DeltaDecision::Process(reason) => self.process(frame, reason),
            },
        };

        let elapsed = started.elapsed();
        result.processing_latency_ms = elapsed.as_secs_f64() * 1000.0;
        self.stats.total_latency_ms += result.processing_latency_ms;
        metrics::FRAME_LATENCY.observe(elapsed.as_secs_f64());
        if result.is_degraded() {
            self.stats.degraded_frames += 1;
            for err in &result.errors {
                metrics::REJECTED_INPUTS_TOTAL
                    .with_label_values(&[err.kind()])
                    .inc();
            }
        }
        result
    }

    fn reuse(&mut self, ts: u64) -> PipelineResult {
        self.stats.cache_hits += 1;
        metrics::CACHE_HITS_TOTAL.inc();

        let mut result = PipelineResult::empty(ts);
        let replay: Vec<FusedDetection> =
            self.last_fused.iter().map(|f| f.restamped(ts)).collect();
        match self.stabilizer.update(&replay, ts) {
            Ok(output) => self.pending_retired.extend(output.retired),
            Err(err) => result.errors.push(err),
        }
        result.stabilized = self.last_stabilized.clone();
        result.was_cache_hit = true;
        result
    }

    fn process(&mut self, frame: &Frame, reason: ProcessReason) -> PipelineResult {
        let ts = frame.timestamp_ms();
        self.stats.processed += 1;
        if let ProcessReason::Forced { consecutive_reuse } = reason {
            self.stats.forced += 1;
            metrics::FORCED_PROCESS_TOTAL.inc();
            debug!(pipeline = %self.id, consecutive_reuse, "reuse budget exhausted");
        }

        let mut result = PipelineResult::empty(ts);
        let ml = run_adapter(&mut self.adapter, frame, DetectorSource::Ml, &mut result.errors);
        let template = run_adapter(
            &mut self.adapter,
            frame,
            DetectorSource::Template,
            &mut result.errors,
        );

        let report = self.fusion.fuse(&ml, &template, ts);
        result.errors.extend(report.rejected.iter().cloned());
        let fused = report.into_detections();

        let (active, retired) = match self.stabilizer.update(&fused, ts) {
            Ok(output) => (output.active, output.retired),
            Err(err) => {
                result.errors.push(err);
                (self.last_stabilized.clone(), Vec::new())
            }
        };

        result.retired = std::mem::take(&mut self.pending_retired);
        result.retired.extend(retired);
        result.stabilized = active;

        let stable = result.stable().count();
        metrics::STABLE_DETECTIONS.set(stable as i64);
        debug!(
            pipeline = %self.id,
            timestamp_ms = ts,
            fused = fused.len(),
            stable,
            retired = result.retired.len(),
            "frame processed"
        );

        if let Some(sink) = &self.learning {
            sink.emit(LearningRecord {
                frame: frame.reference(self.id, self.sequence),
                fused: fused.clone(),
                stabilized: result.stabilized.clone(),
                recorded_at: Utc::now(),
            });
        }
        self.sequence += 1;

        self.last_fused = fused;
        self.last_stabilized = result.stabilized.clone();
        result
    }

    /// Drop all per-stream state. Statistics are kept.
    pub fn reset(&mut self) {
        self.stabilizer.reset();
        self.optimizer.reset();
        self.last_fused.clear();
        self.last_stabilized.clear();
        self.pending_retired.clear();
        debug!(pipeline = %self.id, "pipeline reset");
    }
}

impl<D: DetectorAdapter> std::fmt::Debug for FramePipeline<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePipeline")
            .field("id", &self.id)
            .field("adapter", &self.adapter.name())
            .field("stats", &self.stats)
            .finish()
    }
}
