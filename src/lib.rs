//! chartfuse: real-time fusion and stabilization of chart pattern detections.
//!
//! Two detectors (an ML model and a template matcher) look at successive
//! frames of a chart. Per frame the pipeline
//!
//! 1. decides whether the frame changed enough to be worth processing (`delta`),
//! 2. fuses both detectors' candidates into one posterior per pattern (`fusion`),
//! 3. votes across a short window of frames to suppress flicker (`stabilizer`),
//!
//! and `engine::FramePipeline::handle_frame` returns the stabilized result.

pub mod calibration;
pub mod config;
pub mod delta;
pub mod detection;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod fusion;
pub mod learning;
pub mod metrics;
pub mod policy;
pub mod stabilizer;

pub use config::{
    Aggregate, DeltaConfig, LabelPriors, PipelineConfig, ReliabilityProfile, ReliabilityProfiles,
    StabilizerConfig,
};
pub use delta::{DeltaDecision, DeltaOptimizer, DeltaTolerance, FrameSignature, ProcessReason};
pub use detection::{
    BoundingBox, CandidateDetection, DetectorSource, FusedDetection, PatternLabel, PipelineResult,
    StabilityState, StabilizedDetection,
};
pub use engine::{DetectorAdapter, FramePipeline, PipelineStats, PrecomputedDetections};
pub use error::PipelineError;
pub use frame::{Frame, FrameRef};
pub use fusion::{BayesianFusion, FusionReport, fuse};
pub use learning::{LearningChannel, LearningRecord, LearningSink};
pub use stabilizer::{StabilizerOutput, TemporalStabilizer};
