//! # chartfuse-sim
//!
//! Synthetic chart sessions with ground truth, for exercising the
//! `chartfuse` pipeline without a camera or real detectors.
//!
//! - [`chart`] renders seeded random-walk charts into luma frames.
//! - [`scenarios`] scripts which patterns are on screen and when.
//! - [`detectors`] fakes the ML and template detectors at the configured
//!   reliability.
//! - [`stream`] writes a session as JSON lines for the `replay` binary.
//! - [`bench`] runs a session end to end and reports flicker, accuracy and
//!   cache behaviour.
//!
//! ```rust,no_run
//! use chartfuse::PipelineConfig;
//! use chartfuse_sim::{bench, scenarios};
//!
//! let scenario = scenarios::by_name("pattern_handoff").unwrap();
//! let report = bench::run_benchmark(&scenario, PipelineConfig::default(), 7).unwrap();
//! println!("{} -> {}", report.raw_flicker, report.stable_flicker);
//! ```

pub mod bench;
pub mod chart;
pub mod detectors;
pub mod scenarios;
pub mod stream;

pub use bench::{BenchmarkReport, run_benchmark, run_benchmark_with};
pub use chart::{ChartRenderer, Motion};
pub use detectors::SyntheticDetectors;
pub use scenarios::{PatternSpan, Scenario};
pub use stream::write_stream;

use chartfuse::PipelineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
