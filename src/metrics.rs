//! Prometheus metrics for frame processing.
//!
//! Metrics live in a crate-local registry so a host that embeds several
//! libraries does not collide on the default registry. All pipelines in the
//! process share these series.

use once_cell::sync::Lazy;
use prometheus::{
    Counter, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static FRAMES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("chartfuse_frames_total", "Total frames handled").unwrap();
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
});

pub static CACHE_HITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "chartfuse_cache_hits_total",
        "Frames answered from the previous result",
    )
    .unwrap();
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
});

pub static FORCED_PROCESS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "chartfuse_forced_process_total",
        "Frames processed because the reuse budget ran out",
    )
    .unwrap();
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
});

pub static REJECTED_INPUTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "chartfuse_rejected_inputs_total",
            "Per-frame problems by error kind",
        ),
        &["kind"],
    )
    .unwrap();
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
});

pub static STABLE_DETECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "chartfuse_stable_detections",
        "Stable detections reported by the most recent frame",
    )
    .unwrap();
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
});

pub static FRAME_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "chartfuse_frame_latency_seconds",
            "Wall-clock time spent in handle_frame",
        )
        .buckets(vec![
            0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05,
        ]),
    )
    .unwrap();
    let _ = REGISTRY.register(Box::new(h.clone()));
    h
});

/// Touch every series so they show up in the exposition before the first
/// frame is handled.
pub fn init() {
    Lazy::force(&FRAMES_TOTAL);
    Lazy::force(&CACHE_HITS_TOTAL);
    Lazy::force(&FORCED_PROCESS_TOTAL);
    Lazy::force(&REJECTED_INPUTS_TOTAL);
    Lazy::force(&STABLE_DETECTIONS);
    Lazy::force(&FRAME_LATENCY);
}

/// Render all chartfuse metrics in the Prometheus text format.
pub fn gather_text() -> String {
    init();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_lists_series() {
        REJECTED_INPUTS_TOTAL
            .with_label_values(&["invalid_detection_input"])
            .inc();
        let text = gather_text();
        assert!(text.contains("chartfuse_frames_total"));
        assert!(text.contains("chartfuse_frame_latency_seconds"));
        assert!(text.contains("invalid_detection_input"));
    }
}
