//! Detection data model shared by every pipeline stage.
//!
//! Candidates come out of the detector adapter, fused detections out of the
//! fusion engine, stabilized detections out of the temporal stabilizer, and a
//! `PipelineResult` is what the frame controller hands back to the caller.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a chart pattern ("head-and-shoulders", "double-top", ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternLabel(String);

impl PatternLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A label is usable as a fusion key when it is non-blank and free of
    /// control characters.
    pub fn is_well_formed(&self) -> bool {
        !self.0.trim().is_empty() && !self.0.chars().any(char::is_control)
    }
}

impl fmt::Display for PatternLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PatternLabel {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for PatternLabel {
    fn from(label: String) -> Self {
        Self(label)
    }
}

/// The two detectors the fusion math knows about.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorSource {
    /// Machine-learned pattern detector.
    Ml = 0,
    /// Template-matching detector.
    Template = 1,
}

impl DetectorSource {
    pub const ALL: [DetectorSource; 2] = [DetectorSource::Ml, DetectorSource::Template];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ml),
            1 => Some(Self::Template),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ml => "ml",
            Self::Template => "template",
        }
    }
}

impl fmt::Display for DetectorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel region reported by a detector. The core carries it through
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingBox {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// One raw detection from one source for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDetection {
    pub label: PatternLabel,
    /// Raw detector confidence, expected in [0, 1].
    pub confidence: f64,
    pub source: DetectorSource,
    #[serde(default)]
    pub region: Option<BoundingBox>,
    #[serde(default)]
    pub frame_timestamp_ms: u64,
}

impl CandidateDetection {
    pub fn new(
        label: impl Into<PatternLabel>,
        confidence: f64,
        source: DetectorSource,
        frame_timestamp_ms: u64,
    ) -> Self {
        Self {
            label: label.into(),
            confidence,
            source,
            region: None,
            frame_timestamp_ms,
        }
    }

    pub fn with_region(mut self, region: BoundingBox) -> Self {
        self.region = Some(region);
        self
    }
}

/// Posterior belief that a pattern is present in one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedDetection {
    pub label: PatternLabel,
    pub posterior: f64,
    pub frame_timestamp_ms: u64,
    /// Strongest ML confidence seen for the label, if the ML detector reported it.
    pub ml_confidence: Option<f64>,
    /// Strongest template confidence seen for the label, if reported.
    pub template_confidence: Option<f64>,
    pub region: Option<BoundingBox>,
}

impl FusedDetection {
    /// Both detectors reported the label in this frame.
    pub fn is_corroborated(&self) -> bool {
        self.ml_confidence.is_some() && self.template_confidence.is_some()
    }

    /// Same evidence attributed to a later frame. Used when a frame is
    /// skipped but the stabilizer clock still has to advance.
    pub fn restamped(&self, frame_timestamp_ms: u64) -> Self {
        Self {
            frame_timestamp_ms,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityState {
    /// Seen in the window, consensus not reached yet.
    Emerging,
    /// Consensus reached; survives short dropouts up to the grace period.
    Stable,
    /// Grace period expired; reported once and then forgotten.
    Decayed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizedDetection {
    pub label: PatternLabel,
    /// Aggregate of the in-window posteriors.
    pub confidence: f64,
    pub state: StabilityState,
    pub first_seen_ms: u64,
    pub first_stable_ms: Option<u64>,
    pub last_update_ms: u64,
    /// Confirming frames among the last N frames of the window.
    pub votes: usize,
    pub region: Option<BoundingBox>,
}

impl StabilizedDetection {
    pub fn is_stable(&self) -> bool {
        self.state == StabilityState::Stable
    }
}

/// Output of one `handle_frame` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub frame_timestamp_ms: u64,
    /// Live stabilizer entries (emerging and stable), ordered by label.
    pub stabilized: Vec<StabilizedDetection>,
    /// Entries whose grace period expired on this frame.
    pub retired: Vec<StabilizedDetection>,
    pub was_cache_hit: bool,
    pub processing_latency_ms: f64,
    /// Non-fatal problems encountered while handling the frame.
    pub errors: Vec<PipelineError>,
}

impl PipelineResult {
    pub fn empty(frame_timestamp_ms: u64) -> Self {
        Self {
            frame_timestamp_ms,
            stabilized: Vec::new(),
            retired: Vec::new(),
            was_cache_hit: false,
            processing_latency_ms: 0.0,
            errors: Vec::new(),
        }
    }

    /// Only the detections that have reached consensus.
    pub fn stable(&self) -> impl Iterator<Item = &StabilizedDetection> {
        self.stabilized.iter().filter(|d| d.is_stable())
    }

    pub fn find(&self, label: &str) -> Option<&StabilizedDetection> {
        self.stabilized.iter().find(|d| d.label.as_str() == label)
    }

    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}
