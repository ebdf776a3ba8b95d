//! Delta Detection Optimizer
//!
//! Decides, before any detector runs, whether a frame differs enough from the
//! last processed frame to be worth processing. The signature is an 8x8
//! average hash of the luma plane (one pass over the pixels) plus an xxh3
//! digest that short-circuits exact repeats.

use crate::config::DeltaConfig;
use crate::error::PipelineError;
use crate::frame::Frame;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;
use xxhash_rust::xxh3;

const GRID: usize = 8;

/// Largest possible distance between two signatures.
pub const MAX_DISTANCE: u32 = 64;

/// Compact digest of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameSignature {
    /// Bit `i` is set when grid cell `i` (row-major) is brighter than the
    /// frame's mean brightness.
    pub average_hash: u64,
    /// xxh3 of the full luma plane, seeded with the dimensions.
    pub digest: u64,
    pub width: u32,
    pub height: u32,
}

impl FrameSignature {
    pub fn compute(frame: &Frame) -> Self {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let luma = frame.luma();

        let mut sums = [0u64; GRID * GRID];
        let mut counts = [0u32; GRID * GRID];
        for (y, row) in luma.chunks_exact(w).enumerate() {
            let cy = y * GRID / h;
            for (x, &px) in row.iter().enumerate() {
                let cell = cy * GRID + x * GRID / w;
                sums[cell] += px as u64;
                counts[cell] += 1;
            }
        }

        let mut means = [0u64; GRID * GRID];
        for i in 0..GRID * GRID {
            if counts[i] > 0 {
                means[i] = sums[i] / counts[i] as u64;
            }
        }
        let total: u64 = sums.iter().sum();
        let overall = total / luma.len().max(1) as u64;

        let mut average_hash = 0u64;
        for (i, &m) in means.iter().enumerate() {
            if m > overall {
                average_hash |= 1 << i;
            }
        }

        let seed = ((frame.width() as u64) << 32) | frame.height() as u64;
        Self {
            average_hash,
            digest: xxh3::xxh3_64_with_seed(luma, seed),
            width: frame.width(),
            height: frame.height(),
        }
    }

    /// Hamming distance between the average hashes; zero for identical
    /// planes and the maximum for frames of different size.
    pub fn distance(&self, other: &FrameSignature) -> u32 {
        if self.width != other.width || self.height != other.height {
            return MAX_DISTANCE;
        }
        if self.digest == other.digest {
            return 0;
        }
        (self.average_hash ^ other.average_hash).count_ones()
    }
}

/// Shared handle to the reuse tolerance. Cloning shares the value, so a
/// power policy running elsewhere can retune a live pipeline.
#[derive(Debug, Clone)]
pub struct DeltaTolerance(Arc<AtomicU32>);

impl DeltaTolerance {
    pub fn new(bits: u32) -> Self {
        Self(Arc::new(AtomicU32::new(bits.min(MAX_DISTANCE))))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Values above the signature width are clamped.
    pub fn set(&self, bits: u32) {
        self.0.store(bits.min(MAX_DISTANCE), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ProcessReason {
    FirstFrame,
    Changed { distance: u32 },
    /// Reuse budget exhausted (or reuse disabled) on an unchanged scene.
    Forced { consecutive_reuse: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeltaDecision {
    Process(ProcessReason),
    Reuse { distance: u32 },
}

impl DeltaDecision {
    pub fn is_process(&self) -> bool {
        matches!(self, Self::Process(_))
    }

    pub fn is_reuse(&self) -> bool {
        matches!(self, Self::Reuse { .. })
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, Self::Process(ProcessReason::Forced { .. }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DeltaStats {
    pub frames_seen: u64,
    pub reuses: u64,
    pub forced: u64,
    pub changed: u64,
}

impl DeltaStats {
    pub fn hit_rate(&self) -> f64 {
        if self.frames_seen == 0 {
            0.0
        } else {
            self.reuses as f64 / self.frames_seen as f64
        }
    }
}

#[derive(Debug)]
pub struct DeltaOptimizer {
    tolerance: DeltaTolerance,
    max_consecutive_reuse: u32,
    baseline: Option<FrameSignature>,
    consecutive_reuse: u32,
    stats: DeltaStats,
}

impl DeltaOptimizer {
    pub fn new(config: &DeltaConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self::with_tolerance(
            DeltaTolerance::new(config.tolerance_bits),
            config.max_consecutive_reuse,
        ))
    }

    pub fn with_tolerance(tolerance: DeltaTolerance, max_consecutive_reuse: u32) -> Self {
        Self {
            tolerance,
            max_consecutive_reuse,
            baseline: None,
            consecutive_reuse: 0,
            stats: DeltaStats::default(),
        }
    }

    pub fn tolerance(&self) -> DeltaTolerance {
        self.tolerance.clone()
    }

    pub fn baseline(&self) -> Option<&FrameSignature> {
        self.baseline.as_ref()
    }

    pub fn consecutive_reuse(&self) -> u32 {
        self.consecutive_reuse
    }

    pub fn stats(&self) -> DeltaStats {
        self.stats
    }

    /// Compare `frame` with the last processed frame. A PROCESS decision makes
    /// this frame the new baseline; a REUSE leaves the baseline alone.
    pub fn should_process(&mut self, frame: &Frame) -> DeltaDecision {
        let signature = FrameSignature::compute(frame);
        self.stats.frames_seen += 1;

        let decision = match &self.baseline {
            None => DeltaDecision::Process(ProcessReason::FirstFrame),
            Some(baseline) => {
                let distance = signature.distance(baseline);
                let resized =
                    signature.width != baseline.width || signature.height != baseline.height;
                if resized || distance > self.tolerance.get() {
                    DeltaDecision::Process(ProcessReason::Changed { distance })
                } else if self.consecutive_reuse >= self.max_consecutive_reuse {
                    DeltaDecision::Process(ProcessReason::Forced {
                        consecutive_reuse: self.consecutive_reuse,
                    })
                } else {
                    DeltaDecision::Reuse { distance }
                }
            }
        };

        match decision {
            DeltaDecision::Reuse { .. } => {
                self.consecutive_reuse += 1;
                self.stats.reuses += 1;
            }
            DeltaDecision::Process(reason) => {
                match reason {
                    ProcessReason::Forced { .. } => self.stats.forced += 1,
                    ProcessReason::Changed { .. } => self.stats.changed += 1,
                    ProcessReason::FirstFrame => {}
                }
                self.consecutive_reuse = 0;
                self.baseline = Some(signature);
            }
        }
        trace!(timestamp_ms = frame.timestamp_ms(), ?decision, "delta decision");
        decision
    }

    /// Forget the baseline; the next frame is treated as the first.
    pub fn reset(&mut self) {
        self.baseline = None;
        self.consecutive_reuse = 0;
    }
}
