//! Bayesian Fusion Engine
//!
//! Combines the ML and template candidates of one frame into a posterior per
//! pattern label. Each detector is modelled as a noisy witness with a known
//! hit rate `t` and false-alarm rate `f`. A raw confidence `c` is read as soft
//! evidence: the witness fired with probability `c`, so
//!
//! ```text
//! P(c | present) = c·t + (1−c)·(1−t)
//! P(c | absent)  = c·f + (1−c)·(1−f)
//! ```
//!
//! The two likelihood ratios are multiplied onto the label's prior odds in log
//! space. A label seen by one detector only is reported as that detector's
//! confidence discounted by its precision, so a lone witness is never promoted
//! above what it claimed itself.
//!
//! Fusion holds no state between calls: the same inputs always produce
//! bit-identical posteriors.

use crate::config::{LabelPriors, ReliabilityProfile, ReliabilityProfiles};
use crate::detection::{BoundingBox, CandidateDetection, DetectorSource, FusedDetection, PatternLabel};
use crate::error::PipelineError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Confidences and rates are clamped to `[EPSILON, 1 − EPSILON]` before any
/// ratio or logarithm is taken.
pub const EPSILON: f64 = 1e-6;

#[inline]
fn clamp_open(p: f64) -> f64 {
    p.clamp(EPSILON, 1.0 - EPSILON)
}

#[inline]
fn logit(p: f64) -> f64 {
    let p = clamp_open(p);
    (p / (1.0 - p)).ln()
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `P(c | present) / P(c | absent)` for one detector.
pub fn likelihood_ratio(profile: &ReliabilityProfile, confidence: f64) -> f64 {
    let c = clamp_open(confidence);
    let t = clamp_open(profile.true_positive_rate);
    let f = clamp_open(profile.false_positive_rate);
    let given_present = c * t + (1.0 - c) * (1.0 - t);
    let given_absent = c * f + (1.0 - c) * (1.0 - f);
    given_present / given_absent
}

/// Output of one fusion pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionReport {
    pub detections: BTreeMap<PatternLabel, FusedDetection>,
    /// One entry per rejected candidate. A rejected label is absent from
    /// `detections` for this frame.
    pub rejected: Vec<PipelineError>,
}

impl FusionReport {
    pub fn get(&self, label: &str) -> Option<&FusedDetection> {
        self.detections.get(&PatternLabel::from(label))
    }

    pub fn posterior(&self, label: &str) -> Option<f64> {
        self.get(label).map(|d| d.posterior)
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn into_detections(self) -> Vec<FusedDetection> {
        self.detections.into_values().collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Strongest {
    confidence: f64,
    region: Option<BoundingBox>,
}

#[derive(Debug, Default)]
struct Evidence {
    ml: Option<Strongest>,
    template: Option<Strongest>,
}

impl Evidence {
    fn slot(&mut self, source: DetectorSource) -> &mut Option<Strongest> {
        match source {
            DetectorSource::Ml => &mut self.ml,
            DetectorSource::Template => &mut self.template,
        }
    }
}

/// Fusion engine bound to a fixed set of reliability profiles and priors.
#[derive(Debug, Clone)]
pub struct BayesianFusion {
    profiles: ReliabilityProfiles,
    priors: LabelPriors,
}

impl BayesianFusion {
    pub fn new(profiles: ReliabilityProfiles, priors: LabelPriors) -> Result<Self, PipelineError> {
        profiles.validate()?;
        priors.validate()?;
        Ok(Self { profiles, priors })
    }

    pub fn profiles(&self) -> &ReliabilityProfiles {
        &self.profiles
    }

    pub fn priors(&self) -> &LabelPriors {
        &self.priors
    }

    /// Fuse the candidates of one frame. Candidates found in the wrong list,
    /// with a malformed label, or with a confidence that is NaN or outside
    /// [0, 1] reject their label for this frame; other labels are unaffected.
    pub fn fuse(
        &self,
        ml: &[CandidateDetection],
        template: &[CandidateDetection],
        frame_timestamp_ms: u64,
    ) -> FusionReport {
        let mut evidence: BTreeMap<PatternLabel, Evidence> = BTreeMap::new();
        let mut poisoned: BTreeSet<PatternLabel> = BTreeSet::new();
        let mut report = FusionReport::default();

        let tagged = ml
            .iter()
            .map(|c| (DetectorSource::Ml, c))
            .chain(template.iter().map(|c| (DetectorSource::Template, c)));

        for (expected, candidate) in tagged {
            if let Err(err) = check_candidate(candidate, expected) {
                warn!(
                    label = %candidate.label,
                    source = %expected,
                    error = %err,
                    "rejecting detection input"
                );
                poisoned.insert(candidate.label.clone());
                report.rejected.push(err);
                continue;
            }
            let slot = evidence
                .entry(candidate.label.clone())
                .or_default()
                .slot(expected);
            match slot {
                Some(best) if best.confidence >= candidate.confidence => {}
                _ => {
                    *slot = Some(Strongest {
                        confidence: candidate.confidence,
                        region: candidate.region,
                    })
                }
            }
        }

        for (label, ev) in evidence {
            if poisoned.contains(&label) {
                continue;
            }
            let ml_conf = ev.ml.map(|s| s.confidence);
            let template_conf = ev.template.map(|s| s.confidence);
            let posterior = self.posterior(&label, ml_conf, template_conf);
            let region = ev
                .template
                .and_then(|s| s.region)
                .or_else(|| ev.ml.and_then(|s| s.region));
            report.detections.insert(
                label.clone(),
                FusedDetection {
                    label,
                    posterior,
                    frame_timestamp_ms,
                    ml_confidence: ml_conf,
                    template_confidence: template_conf,
                    region,
                },
            );
        }

        report
    }

    /// Posterior for one label given the (already validated) strongest
    /// confidence of each source that reported it.
    pub fn posterior(&self, label: &PatternLabel, ml: Option<f64>, template: Option<f64>) -> f64 {
        let prior = self.priors.prior(label);
        match (ml, template) {
            (Some(m), Some(t)) => {
                let log_odds = logit(prior)
                    + likelihood_ratio(&self.profiles.ml, m).ln()
                    + likelihood_ratio(&self.profiles.template, t).ln();
                sigmoid(log_odds)
            }
            (Some(c), None) => clamp_open(c) * self.profiles.ml.precision(prior),
            (None, Some(c)) => clamp_open(c) * self.profiles.template.precision(prior),
            (None, None) => 0.0,
        }
    }
}

fn check_candidate(
    candidate: &CandidateDetection,
    expected: DetectorSource,
) -> Result<(), PipelineError> {
    let label = candidate.label.as_str();
    if !candidate.label.is_well_formed() {
        return Err(PipelineError::invalid_input(label, "malformed label"));
    }
    if candidate.source != expected {
        return Err(PipelineError::invalid_input(
            label,
            format!(
                "{} candidate delivered as {} output",
                candidate.source, expected
            ),
        ));
    }
    let c = candidate.confidence;
    if c.is_nan() || !(0.0..=1.0).contains(&c) {
        return Err(PipelineError::invalid_input(
            label,
            format!("confidence {c} outside [0, 1]"),
        ));
    }
    Ok(())
}

/// Fuse with a uniform prior. The frame timestamp is taken from the newest
/// candidate.
pub fn fuse(
    ml: &[CandidateDetection],
    template: &[CandidateDetection],
    profiles: &ReliabilityProfiles,
) -> Result<FusionReport, PipelineError> {
    let engine = BayesianFusion::new(*profiles, LabelPriors::default())?;
    let ts = ml
        .iter()
        .chain(template)
        .map(|c| c.frame_timestamp_ms)
        .max()
        .unwrap_or(0);
    Ok(engine.fuse(ml, template, ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ml(label: &str, c: f64) -> CandidateDetection {
        CandidateDetection::new(label, c, DetectorSource::Ml, 0)
    }

    fn tpl(label: &str, c: f64) -> CandidateDetection {
        CandidateDetection::new(label, c, DetectorSource::Template, 0)
    }

    fn engine() -> BayesianFusion {
        BayesianFusion::new(ReliabilityProfiles::default(), LabelPriors::default()).unwrap()
    }

    #[test]
    fn test_template_evidence_dominates() {
        let report = engine().fuse(
            &[ml("head-and-shoulders", 0.6)],
            &[tpl("head-and-shoulders", 0.9)],
            33,
        );
        let fused = report.get("head-and-shoulders").unwrap();
        assert!(fused.posterior > 0.8, "posterior {}", fused.posterior);
        assert!((fused.posterior - 0.8829).abs() < 1e-3);
        assert_eq!(fused.frame_timestamp_ms, 33);
        assert!(fused.is_corroborated());
    }

    #[test]
    fn test_single_source_is_discounted() {
        let report = engine().fuse(&[ml("flag", 0.8)], &[tpl("wedge", 0.8)], 0);
        let flag = report.posterior("flag").unwrap();
        let wedge = report.posterior("wedge").unwrap();
        assert!(flag < 0.8);
        assert!(wedge < 0.8);
        // Template precision at prior 0.5 is 0.95, ML is 0.7/0.9.
        assert!((wedge - 0.8 * 0.95).abs() < 1e-9);
        assert!(wedge > flag);
    }

    #[test]
    fn test_extreme_confidences_are_finite() {
        let report = engine().fuse(&[ml("a", 0.0), ml("b", 1.0)], &[tpl("a", 1.0), tpl("b", 1.0)], 0);
        for fused in report.detections.values() {
            assert!(fused.posterior.is_finite());
            assert!(fused.posterior > 0.0 && fused.posterior < 1.0);
        }
    }

    #[test]
    fn test_rejects_only_offending_label() {
        let report = engine().fuse(
            &[ml("flag", 1.3), ml("wedge", 0.7), ml("pennant", f64::NAN)],
            &[tpl("flag", 0.9), tpl("", 0.9)],
            0,
        );
        assert_eq!(report.len(), 1);
        assert!(report.get("wedge").is_some());
        assert_eq!(report.rejected.len(), 3);
        assert!(
            report
                .rejected
                .iter()
                .all(|e| matches!(e, PipelineError::InvalidDetectionInput { .. }))
        );
    }

    #[test]
    fn test_source_mismatch_rejected() {
        let report = engine().fuse(&[tpl("flag", 0.9)], &[], 0);
        assert!(report.is_empty());
        assert_eq!(report.rejected.len(), 1);
    }

    #[test]
    fn test_strongest_candidate_per_source() {
        let region = BoundingBox::new(1, 2, 3, 4);
        let report = engine().fuse(
            &[ml("triangle", 0.3), ml("triangle", 0.75).with_region(region)],
            &[],
            0,
        );
        let fused = report.get("triangle").unwrap();
        assert_eq!(fused.ml_confidence, Some(0.75));
        assert_eq!(fused.region, Some(region));
    }

    #[test]
    fn test_priors_shift_posterior() {
        let priors = LabelPriors::chart_defaults();
        let skewed = BayesianFusion::new(ReliabilityProfiles::default(), priors).unwrap();
        let rare = skewed.fuse(&[ml("rounding-bottom", 0.7)], &[tpl("rounding-bottom", 0.7)], 0);
        let common = skewed.fuse(&[ml("head-and-shoulders", 0.7)], &[tpl("head-and-shoulders", 0.7)], 0);
        assert!(
            common.posterior("head-and-shoulders").unwrap()
                > rare.posterior("rounding-bottom").unwrap()
        );
    }

    #[test]
    fn test_free_function_uses_newest_timestamp() {
        let a = CandidateDetection::new("flag", 0.8, DetectorSource::Ml, 90);
        let b = CandidateDetection::new("flag", 0.8, DetectorSource::Template, 100);
        let report = fuse(&[a], &[b], &ReliabilityProfiles::default()).unwrap();
        assert_eq!(report.get("flag").unwrap().frame_timestamp_ms, 100);
    }

    #[test]
    fn test_likelihood_ratio_increases_with_confidence() {
        let profile = ReliabilityProfile::new(0.7, 0.2);
        let mut last = 0.0;
        for step in 0..=20 {
            let lr = likelihood_ratio(&profile, step as f64 / 20.0);
            assert!(lr > last);
            last = lr;
        }
    }
}
