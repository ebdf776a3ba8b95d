//! C ABI for mobile and desktop hosts.
//!
//! The host owns the camera and the detectors. For every frame it passes the
//! luma plane plus the candidates its detectors produced (a JSON array of
//! `CandidateDetection`), and gets a JSON `PipelineResult` back. Strings
//! returned by this module must be released with `chartfuse_free_string`.

use crate::config::PipelineConfig;
use crate::detection::PipelineResult;
use crate::engine::{FramePipeline, PrecomputedDetections};
use crate::frame::Frame;
use crate::metrics;
use std::ffi::{CStr, CString, c_char, c_uint, c_ulonglong};
use tracing::warn;

pub type FfiPipeline = FramePipeline<PrecomputedDetections>;

fn into_c_string(json: String) -> *mut c_char {
    CString::new(json)
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Build a pipeline from a JSON `PipelineConfig` (null for defaults).
/// Returns null when the configuration is rejected.
#[unsafe(no_mangle)]
pub extern "C" fn chartfuse_pipeline_create(config_json: *const c_char) -> *mut FfiPipeline {
    let config = if config_json.is_null() {
        Ok(PipelineConfig::default())
    } else {
        match read_str(config_json) {
            Some(json) => PipelineConfig::from_json_str(json),
            None => {
                warn!("pipeline config is not valid UTF-8");
                return std::ptr::null_mut();
            }
        }
    };

    match config.and_then(|c| FramePipeline::new(c, PrecomputedDetections::new())) {
        Ok(pipeline) => Box::into_raw(Box::new(pipeline)),
        Err(err) => {
            warn!(error = %err, "pipeline creation rejected");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn chartfuse_pipeline_free(ptr: *mut FfiPipeline) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(ptr);
    }
}

/// Handle one frame. `candidates_json` may be null when the host's detectors
/// did not run. Returns the `PipelineResult` as JSON, or null when `ptr` or
/// `luma` is null.
#[unsafe(no_mangle)]
pub extern "C" fn chartfuse_pipeline_process(
    ptr: *mut FfiPipeline,
    timestamp_ms: c_ulonglong,
    width: c_uint,
    height: c_uint,
    luma: *const u8,
    luma_len: usize,
    candidates_json: *const c_char,
) -> *mut c_char {
    if ptr.is_null() || luma.is_null() {
        return std::ptr::null_mut();
    }
    let pipeline = unsafe { &mut *ptr };
    let pixels = unsafe { std::slice::from_raw_parts(luma, luma_len) };

    match read_str(candidates_json) {
        Some(json) => pipeline.adapter_mut().load_json(json),
        None => pipeline.adapter_mut().load(Vec::new()),
    }

    let result = match Frame::new(timestamp_ms, width, height, pixels.to_vec()) {
        Ok(frame) => pipeline.handle_frame(&frame),
        Err(err) => {
            let mut result = PipelineResult::empty(timestamp_ms);
            result.errors.push(err);
            result
        }
    };

    match serde_json::to_string(&result) {
        Ok(json) => into_c_string(json),
        Err(err) => {
            warn!(error = %err, "failed to encode pipeline result");
            std::ptr::null_mut()
        }
    }
}

/// Widen or tighten the reuse tolerance of a live pipeline.
#[unsafe(no_mangle)]
pub extern "C" fn chartfuse_pipeline_set_tolerance(ptr: *mut FfiPipeline, bits: c_uint) {
    if ptr.is_null() {
        return;
    }
    let pipeline = unsafe { &*ptr };
    pipeline.set_delta_tolerance(bits);
}

/// `PipelineStats` as JSON.
#[unsafe(no_mangle)]
pub extern "C" fn chartfuse_pipeline_stats(ptr: *const FfiPipeline) -> *mut c_char {
    if ptr.is_null() {
        return std::ptr::null_mut();
    }
    let pipeline = unsafe { &*ptr };
    let stats = serde_json::json!({
        "pipeline": pipeline.stats(),
        "delta": pipeline.delta_stats(),
        "hit_rate": pipeline.stats().hit_rate(),
        "average_latency_ms": pipeline.stats().average_latency_ms(),
    });
    into_c_string(stats.to_string())
}

/// Prometheus text exposition of all pipelines in the process.
#[unsafe(no_mangle)]
pub extern "C" fn chartfuse_metrics() -> *mut c_char {
    into_c_string(metrics::gather_text())
}

#[unsafe(no_mangle)]
pub extern "C" fn chartfuse_free_string(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}
