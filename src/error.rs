//! Error taxonomy for the detection pipeline.
//!
//! None of these are fatal to a running pipeline. Construction-time problems
//! surface as `ConfigurationError`; everything raised while a frame is in
//! flight is collected into the frame's result instead of aborting it.

use crate::detection::DetectorSource;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PipelineError {
    /// A candidate carried a malformed label or a confidence outside [0, 1].
    #[error("invalid detection input for label '{label}': {reason}")]
    InvalidDetectionInput { label: String, reason: String },

    /// Out-of-range thresholds or rates, rejected when the pipeline is built.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// A frame arrived with a timestamp that does not advance the window.
    #[error("stale window state: frame at {got_ms}ms does not follow {last_ms}ms")]
    StaleWindowState { last_ms: u64, got_ms: u64 },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("{detector} detector unavailable: {reason}")]
    DetectorUnavailable {
        detector: DetectorSource,
        reason: String,
    },
}

impl PipelineError {
    pub fn invalid_input(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDetectionInput {
            label: label.into(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigurationError(reason.into())
    }

    /// Short stable name used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidDetectionInput { .. } => "invalid_detection_input",
            Self::ConfigurationError(_) => "configuration_error",
            Self::StaleWindowState { .. } => "stale_window_state",
            Self::InvalidFrame(_) => "invalid_frame",
            Self::DetectorUnavailable { .. } => "detector_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::invalid_input("double-top", "confidence 1.2 outside [0, 1]");
        let text = err.to_string();
        assert!(text.contains("double-top"));
        assert!(text.contains("outside [0, 1]"));

        let stale = PipelineError::StaleWindowState {
            last_ms: 100,
            got_ms: 90,
        };
        assert!(stale.to_string().contains("90ms"));
    }

    #[test]
    fn test_detector_unavailable_names_source() {
        let err = PipelineError::DetectorUnavailable {
            detector: DetectorSource::Template,
            reason: "no templates loaded".to_string(),
        };
        assert!(err.to_string().starts_with("template detector unavailable"));
        assert_eq!(err.kind(), "detector_unavailable");
    }
}
