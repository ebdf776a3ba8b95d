//! Pipeline configuration.
//!
//! Everything here is loaded once when a pipeline is constructed and stays
//! fixed for the lifetime of that instance, with the exception of the delta
//! tolerance which is exposed through a runtime handle (see `delta`).

use crate::detection::{DetectorSource, PatternLabel};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Offline-calibrated hit and false-alarm rates of one detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityProfile {
    pub true_positive_rate: f64,
    pub false_positive_rate: f64,
}

impl ReliabilityProfile {
    pub fn new(true_positive_rate: f64, false_positive_rate: f64) -> Self {
        Self {
            true_positive_rate,
            false_positive_rate,
        }
    }

    /// Probability the pattern is present given that this detector fired,
    /// for a pattern with base rate `prior`.
    pub fn precision(&self, prior: f64) -> f64 {
        let hit = self.true_positive_rate * prior;
        let false_alarm = self.false_positive_rate * (1.0 - prior);
        if hit + false_alarm <= 0.0 {
            0.0
        } else {
            hit / (hit + false_alarm)
        }
    }

    fn validate(&self, source: DetectorSource) -> Result<(), PipelineError> {
        let tpr = self.true_positive_rate;
        let fpr = self.false_positive_rate;
        if !(0.0..=1.0).contains(&tpr) {
            return Err(PipelineError::config(format!(
                "{source} true positive rate {tpr} outside [0, 1]"
            )));
        }
        if !(0.0..=1.0).contains(&fpr) {
            return Err(PipelineError::config(format!(
                "{source} false positive rate {fpr} outside [0, 1]"
            )));
        }
        if tpr <= fpr {
            return Err(PipelineError::config(format!(
                "{source} profile is no better than chance (tpr {tpr} <= fpr {fpr})"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityProfiles {
    pub ml: ReliabilityProfile,
    pub template: ReliabilityProfile,
}

impl ReliabilityProfiles {
    pub fn get(&self, source: DetectorSource) -> &ReliabilityProfile {
        match source {
            DetectorSource::Ml => &self.ml,
            DetectorSource::Template => &self.template,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for source in DetectorSource::ALL {
            self.get(source).validate(source)?;
        }
        Ok(())
    }
}

impl Default for ReliabilityProfiles {
    fn default() -> Self {
        Self {
            ml: ReliabilityProfile::new(0.7, 0.2),
            template: ReliabilityProfile::new(0.95, 0.05),
        }
    }
}

/// Base rate of each pattern before any detector has spoken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelPriors {
    pub default_prior: f64,
    pub priors: BTreeMap<PatternLabel, f64>,
}

impl Default for LabelPriors {
    fn default() -> Self {
        Self {
            default_prior: 0.5,
            priors: BTreeMap::new(),
        }
    }
}

impl LabelPriors {
    /// Pattern frequencies observed in the chart training corpus.
    pub fn chart_defaults() -> Self {
        let table = [
            ("head-and-shoulders", 0.75),
            ("double-top", 0.70),
            ("double-bottom", 0.70),
            ("triangle", 0.65),
            ("flag", 0.60),
            ("pennant", 0.60),
            ("cup-and-handle", 0.55),
            ("wedge", 0.55),
            ("channel", 0.50),
            ("triple-top", 0.40),
            ("triple-bottom", 0.40),
            ("rounding-bottom", 0.35),
        ];
        Self {
            default_prior: 0.5,
            priors: table
                .into_iter()
                .map(|(label, p)| (PatternLabel::from(label), p))
                .collect(),
        }
    }

    pub fn prior(&self, label: &PatternLabel) -> f64 {
        self.priors
            .get(label)
            .copied()
            .unwrap_or(self.default_prior)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let open_unit = |p: f64| p > 0.0 && p < 1.0;
        if !open_unit(self.default_prior) {
            return Err(PipelineError::config(format!(
                "default prior {} outside (0, 1)",
                self.default_prior
            )));
        }
        for (label, &p) in &self.priors {
            if !open_unit(p) {
                return Err(PipelineError::config(format!(
                    "prior for '{label}' is {p}, outside (0, 1)"
                )));
            }
        }
        Ok(())
    }
}

/// How the stabilizer summarizes a label's in-window posteriors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    #[default]
    Mean,
    Max,
    /// Linearly increasing weights, newest frame heaviest.
    RecencyWeighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Entries older than this (relative to the newest frame) are evicted.
    pub window_duration_ms: u64,
    /// N: how many of the most recent frames take part in the vote.
    pub window_frames: usize,
    /// K / N.
    pub consensus_fraction: f64,
    /// Posterior a frame must reach to count as a confirming vote.
    pub confidence_threshold: f64,
    /// Minimum time between the earliest confirming vote and the current
    /// frame before a label may become stable.
    pub min_stable_span_ms: u64,
    /// G: consecutive non-confirming frames a stable label tolerates.
    pub grace_period_frames: usize,
    pub aggregate: Aggregate,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            window_duration_ms: 250,
            window_frames: 5,
            consensus_fraction: 0.6,
            confidence_threshold: 0.5,
            min_stable_span_ms: 80,
            grace_period_frames: 3,
            aggregate: Aggregate::Mean,
        }
    }
}

impl StabilizerConfig {
    /// K, the number of confirming frames required out of the last N.
    pub fn consensus_votes(&self) -> usize {
        let k = (self.consensus_fraction * self.window_frames as f64 - 1e-9).ceil();
        (k.max(1.0) as usize).min(self.window_frames.max(1))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.window_frames == 0 {
            return Err(PipelineError::config("window_frames must be at least 1"));
        }
        if self.window_duration_ms == 0 {
            return Err(PipelineError::config("window_duration_ms must be positive"));
        }
        if !(self.consensus_fraction > 0.0 && self.consensus_fraction <= 1.0) {
            return Err(PipelineError::config(format!(
                "consensus_fraction {} outside (0, 1]",
                self.consensus_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::config(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.min_stable_span_ms > self.window_duration_ms {
            return Err(PipelineError::config(format!(
                "min_stable_span_ms {} exceeds window_duration_ms {}",
                self.min_stable_span_ms, self.window_duration_ms
            )));
        }
        if self.grace_period_frames == 0 {
            return Err(PipelineError::config("grace_period_frames must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Largest signature distance (in hash bits) still treated as "unchanged".
    pub tolerance_bits: u32,
    /// Consecutive reuses after which a frame is processed regardless.
    /// Zero disables reuse.
    pub max_consecutive_reuse: u32,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            tolerance_bits: 5,
            max_consecutive_reuse: 30,
        }
    }
}

impl DeltaConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.tolerance_bits > 64 {
            return Err(PipelineError::config(format!(
                "tolerance_bits {} exceeds the 64-bit signature",
                self.tolerance_bits
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub reliability: ReliabilityProfiles,
    pub priors: LabelPriors,
    pub stabilizer: StabilizerConfig,
    pub delta: DeltaConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reliability: ReliabilityProfiles::default(),
            priors: LabelPriors::default(),
            stabilizer: StabilizerConfig::default(),
            delta: DeltaConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.reliability.validate()?;
        self.priors.validate()?;
        self.stabilizer.validate()?;
        self.delta.validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stabilizer.consensus_votes(), 3);
    }

    #[test]
    fn test_consensus_votes_rounding() {
        let mut s = StabilizerConfig::default();
        s.window_frames = 5;
        s.consensus_fraction = 0.6;
        assert_eq!(s.consensus_votes(), 3);
        s.consensus_fraction = 0.61;
        assert_eq!(s.consensus_votes(), 4);
        s.consensus_fraction = 1.0;
        assert_eq!(s.consensus_votes(), 5);
        s.consensus_fraction = 0.01;
        assert_eq!(s.consensus_votes(), 1);
    }

    #[test]
    fn test_rejects_out_of_range_fraction() {
        let mut config = PipelineConfig::default();
        config.stabilizer.consensus_fraction = 1.2;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_rejects_bad_rates() {
        let mut config = PipelineConfig::default();
        config.reliability.ml = ReliabilityProfile::new(1.5, 0.1);
        assert!(config.validate().is_err());

        config.reliability.ml = ReliabilityProfile::new(0.3, 0.3);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no better than chance"));

        config.reliability.ml = ReliabilityProfile::new(f64::NAN, 0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_span_longer_than_window() {
        let mut config = PipelineConfig::default();
        config.stabilizer.min_stable_span_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_degenerate_prior() {
        let mut config = PipelineConfig::default();
        config.priors.priors.insert("flag".into(), 1.0);
        assert!(config.validate().is_err());
        assert!(LabelPriors::chart_defaults().validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "stabilizer": { "window_frames": 7, "consensus_fraction": 0.5 },
            "delta": { "tolerance_bits": 0 }
        }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();
        assert_eq!(config.stabilizer.window_frames, 7);
        assert_eq!(config.stabilizer.consensus_votes(), 4);
        assert_eq!(config.stabilizer.grace_period_frames, 3);
        assert_eq!(config.delta.tolerance_bits, 0);
        assert_eq!(config.delta.max_consecutive_reuse, 30);
        assert_eq!(config.reliability, ReliabilityProfiles::default());
    }

    #[test]
    fn test_invalid_json_fails_fast() {
        let json = r#"{ "stabilizer": { "consensus_fraction": 2.0 } }"#;
        assert!(PipelineConfig::from_json_str(json).is_err());
        assert!(PipelineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_precision() {
        let profile = ReliabilityProfile::new(0.95, 0.05);
        assert!((profile.precision(0.5) - 0.95).abs() < 1e-12);
        let weak = ReliabilityProfile::new(0.7, 0.2);
        assert!((weak.precision(0.5) - 0.7 / 0.9).abs() < 1e-12);
    }
}
