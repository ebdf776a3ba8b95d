//! Re-estimating detector reliability from user corrections.
//!
//! Each correction says whether a pattern really was on screen and what each
//! detector reported for it. The tracker keeps a confusion matrix per source
//! and turns it into hit and false-alarm rates with Beta(1, 1) smoothing.
//! The result feeds the next pipeline built; a running pipeline keeps the
//! profiles it was constructed with.

use crate::config::{ReliabilityProfile, ReliabilityProfiles};
use crate::detection::{DetectorSource, FusedDetection, PatternLabel};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Ground truth for one detection, supplied by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub label: PatternLabel,
    /// Whether the pattern was really present.
    pub present: bool,
    pub ml_confidence: Option<f64>,
    pub template_confidence: Option<f64>,
}

impl Correction {
    /// The user confirmed what the pipeline reported.
    pub fn confirm(detection: &FusedDetection) -> Self {
        Self::from_fused(detection, true)
    }

    /// The user rejected what the pipeline reported.
    pub fn reject(detection: &FusedDetection) -> Self {
        Self::from_fused(detection, false)
    }

    /// The user marked a pattern neither detector reported.
    pub fn missed(label: impl Into<PatternLabel>) -> Self {
        Self {
            label: label.into(),
            present: true,
            ml_confidence: None,
            template_confidence: None,
        }
    }

    fn from_fused(detection: &FusedDetection, present: bool) -> Self {
        Self {
            label: detection.label.clone(),
            present,
            ml_confidence: detection.ml_confidence,
            template_confidence: detection.template_confidence,
        }
    }

    pub fn confidence(&self, source: DetectorSource) -> Option<f64> {
        match source {
            DetectorSource::Ml => self.ml_confidence,
            DetectorSource::Template => self.template_confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub tp: u64,
    pub fp: u64,
    pub tn: u64,
    pub fn_: u64,
}

impl ConfusionCounts {
    fn record(&mut self, fired: bool, present: bool) {
        match (fired, present) {
            (true, true) => self.tp += 1,
            (true, false) => self.fp += 1,
            (false, false) => self.tn += 1,
            (false, true) => self.fn_ += 1,
        }
    }

    pub fn positives(&self) -> u64 {
        self.tp + self.fn_
    }

    pub fn negatives(&self) -> u64 {
        self.fp + self.tn
    }

    /// Smoothed hit rate, (tp + 1) / (tp + fn + 2).
    pub fn true_positive_rate(&self) -> f64 {
        (self.tp as f64 + 1.0) / (self.positives() as f64 + 2.0)
    }

    /// Smoothed false-alarm rate, (fp + 1) / (fp + tn + 2).
    pub fn false_positive_rate(&self) -> f64 {
        (self.fp as f64 + 1.0) / (self.negatives() as f64 + 2.0)
    }

    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 {
            0.5
        } else {
            self.tp as f64 / denom as f64
        }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 {
            0.5
        } else {
            self.tp as f64 / denom as f64
        }
    }

    pub fn f1_score(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourcePerformance {
    pub source: DetectorSource,
    pub counts: ConfusionCounts,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityTracker {
    /// Confidence at which a detector counts as having fired.
    pub fire_threshold: f64,
    /// Observations needed on each side (present / absent) before a rate
    /// replaces the configured one.
    pub min_samples: u64,
    counts: [ConfusionCounts; 2],
}

impl Default for ReliabilityTracker {
    fn default() -> Self {
        Self::new(0.5, 20)
    }
}

impl ReliabilityTracker {
    pub fn new(fire_threshold: f64, min_samples: u64) -> Self {
        Self {
            fire_threshold,
            min_samples,
            counts: [ConfusionCounts::default(); 2],
        }
    }

    pub fn record(&mut self, correction: &Correction) {
        for source in DetectorSource::ALL {
            let fired = correction
                .confidence(source)
                .is_some_and(|c| c >= self.fire_threshold);
            self.counts[source as usize].record(fired, correction.present);
        }
    }

    pub fn record_all<'a>(&mut self, corrections: impl IntoIterator<Item = &'a Correction>) {
        for correction in corrections {
            self.record(correction);
        }
    }

    pub fn counts(&self, source: DetectorSource) -> ConfusionCounts {
        self.counts[source as usize]
    }

    pub fn performance(&self, source: DetectorSource) -> SourcePerformance {
        let counts = self.counts(source);
        SourcePerformance {
            source,
            counts,
            precision: counts.precision(),
            recall: counts.recall(),
            f1_score: counts.f1_score(),
        }
    }

    /// Profiles re-estimated from the corrections seen so far. Rates without
    /// enough evidence fall back to `base`, and a source whose estimate is no
    /// better than chance keeps its `base` profile.
    pub fn calibrated(&self, base: &ReliabilityProfiles) -> ReliabilityProfiles {
        let mut out = *base;
        for source in DetectorSource::ALL {
            let counts = self.counts(source);
            let prior = base.get(source);
            let tpr = if counts.positives() >= self.min_samples {
                counts.true_positive_rate()
            } else {
                prior.true_positive_rate
            };
            let fpr = if counts.negatives() >= self.min_samples {
                counts.false_positive_rate()
            } else {
                prior.false_positive_rate
            };
            let estimate = ReliabilityProfile::new(tpr, fpr);
            if tpr <= fpr {
                warn!(source = %source, tpr, fpr, "calibrated profile no better than chance, keeping configured one");
                continue;
            }
            debug!(source = %source, tpr, fpr, "calibrated reliability");
            match source {
                DetectorSource::Ml => out.ml = estimate,
                DetectorSource::Template => out.template = estimate,
            }
        }
        out
    }

    pub fn reset(&mut self) {
        self.counts = [ConfusionCounts::default(); 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correction(present: bool, ml: Option<f64>, template: Option<f64>) -> Correction {
        Correction {
            label: "flag".into(),
            present,
            ml_confidence: ml,
            template_confidence: template,
        }
    }

    #[test]
    fn test_confusion_counting() {
        let mut tracker = ReliabilityTracker::new(0.5, 1);
        tracker.record(&correction(true, Some(0.9), Some(0.2)));
        tracker.record(&correction(false, Some(0.7), None));
        tracker.record(&Correction::missed("wedge"));

        let ml = tracker.counts(DetectorSource::Ml);
        assert_eq!((ml.tp, ml.fp, ml.tn, ml.fn_), (1, 1, 0, 1));
        let template = tracker.counts(DetectorSource::Template);
        assert_eq!((template.tp, template.fp, template.tn, template.fn_), (0, 0, 1, 2));
    }

    #[test]
    fn test_smoothed_rates() {
        let counts = ConfusionCounts {
            tp: 8,
            fp: 1,
            tn: 7,
            fn_: 0,
        };
        assert!((counts.true_positive_rate() - 0.9).abs() < 1e-12);
        assert!((counts.false_positive_rate() - 0.2).abs() < 1e-12);
        assert!((counts.precision() - 8.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_calibrated_needs_enough_samples() {
        let base = ReliabilityProfiles::default();
        let mut tracker = ReliabilityTracker::new(0.5, 10);
        for _ in 0..5 {
            tracker.record(&correction(true, Some(0.9), Some(0.9)));
        }
        assert_eq!(tracker.calibrated(&base), base);

        for _ in 0..5 {
            tracker.record(&correction(true, Some(0.9), Some(0.9)));
        }
        let calibrated = tracker.calibrated(&base);
        assert!((calibrated.ml.true_positive_rate - 11.0 / 12.0).abs() < 1e-12);
        assert_eq!(calibrated.ml.false_positive_rate, base.ml.false_positive_rate);
        assert!(calibrated.validate().is_ok());
    }

    #[test]
    fn test_chance_level_estimate_is_ignored() {
        let base = ReliabilityProfiles::default();
        let mut tracker = ReliabilityTracker::new(0.5, 4);
        // ML fires on everything: tpr == fpr after smoothing.
        for present in [true, false, true, false, true, false, true, false] {
            tracker.record(&correction(present, Some(0.9), None));
        }
        let calibrated = tracker.calibrated(&base);
        assert_eq!(calibrated.ml, base.ml);
    }

    #[test]
    fn test_from_fused() {
        let fused = FusedDetection {
            label: "triangle".into(),
            posterior: 0.9,
            frame_timestamp_ms: 0,
            ml_confidence: Some(0.8),
            template_confidence: None,
            region: None,
        };
        let c = Correction::reject(&fused);
        assert!(!c.present);
        assert_eq!(c.confidence(DetectorSource::Ml), Some(0.8));
        assert_eq!(c.confidence(DetectorSource::Template), None);
    }
}
