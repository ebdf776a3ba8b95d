//! Detectors that behave like the configured reliability profiles.
//!
//! For every frame each source fires on a truly present pattern with
//! probability `tpr` and on each absent distractor with probability `fpr`.
//! Confidences are drawn from Beta distributions: high for true hits,
//! middling for false alarms.

use crate::scenarios::Scenario;
use chartfuse::{
    CandidateDetection, DetectorAdapter, DetectorSource, Frame, PipelineError, ReliabilityProfiles,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};

pub struct SyntheticDetectors {
    scenario: Scenario,
    profiles: ReliabilityProfiles,
    rng: StdRng,
    hit: Beta<f64>,
    false_alarm: Beta<f64>,
}

impl SyntheticDetectors {
    pub fn new(
        scenario: Scenario,
        profiles: ReliabilityProfiles,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        profiles.validate()?;
        let beta = |a: f64, b: f64| {
            Beta::new(a, b).map_err(|e| PipelineError::config(format!("beta({a}, {b}): {e}")))
        };
        Ok(Self {
            scenario,
            profiles,
            rng: StdRng::seed_from_u64(seed),
            hit: beta(8.0, 2.0)?,
            false_alarm: beta(4.0, 4.0)?,
        })
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }
}

impl DetectorAdapter for SyntheticDetectors {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        source: DetectorSource,
    ) -> Result<Vec<CandidateDetection>, PipelineError> {
        let ts = frame.timestamp_ms();
        let profile = *self.profiles.get(source);
        let mut out = Vec::new();

        for span in self.scenario.patterns.iter().filter(|p| p.is_active(ts)) {
            if self.rng.random_bool(profile.true_positive_rate) {
                let confidence = self.hit.sample(&mut self.rng);
                out.push(CandidateDetection::new(span.label.clone(), confidence, source, ts));
            }
        }
        for label in &self.scenario.distractors {
            if self.scenario.is_active(label, ts) {
                continue;
            }
            if self.rng.random_bool(profile.false_positive_rate) {
                let confidence = self.false_alarm.sample(&mut self.rng);
                out.push(CandidateDetection::new(label.clone(), confidence, source, ts));
            }
        }
        Ok(out)
    }
}
