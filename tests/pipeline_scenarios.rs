use chartfuse::{
    CandidateDetection, DeltaDecision, DeltaOptimizer, DetectorSource, Frame, FramePipeline,
    FusedDetection, PipelineConfig, PipelineError, PrecomputedDetections, ProcessReason,
    StabilityState, StabilizerConfig, TemporalStabilizer,
};

/// 16x16 frame of 2x2 checker cells; odd and even `phase` are inverses.
fn checker(ts: u64, phase: u8) -> Frame {
    let luma: Vec<u8> = (0..256u32)
        .map(|i| {
            let (x, y) = (i % 16, i / 16);
            if (x / 2 + y / 2 + phase as u32) % 2 == 0 { 25 } else { 215 }
        })
        .collect();
    Frame::new(ts, 16, 16, luma).unwrap()
}

fn both(label: &str, ml: f64, template: f64) -> Vec<CandidateDetection> {
    vec![
        CandidateDetection::new(label, ml, DetectorSource::Ml, 0),
        CandidateDetection::new(label, template, DetectorSource::Template, 0),
    ]
}

fn fused(label: &str, posterior: f64, ts: u64) -> FusedDetection {
    FusedDetection {
        label: label.into(),
        posterior,
        frame_timestamp_ms: ts,
        ml_confidence: Some(posterior),
        template_confidence: Some(posterior),
        region: None,
    }
}

fn state_of(out: &chartfuse::StabilizerOutput, label: &str) -> Option<StabilityState> {
    out.active
        .iter()
        .chain(&out.retired)
        .find(|d| d.label.as_str() == label)
        .map(|d| d.state)
}

#[test]
fn scenario_b_becomes_stable_on_third_frame() {
    // Defaults: N = 5, K = 3, 80ms minimum span.
    let config = PipelineConfig::default();
    assert_eq!(config.stabilizer.consensus_votes(), 3);
    let mut pipeline = FramePipeline::new(config, PrecomputedDetections::new()).unwrap();

    let mut states = Vec::new();
    for (i, ts) in [0u64, 45, 90].into_iter().enumerate() {
        pipeline.adapter_mut().load(both("double-top", 0.8, 0.9));
        let result = pipeline.handle_frame(&checker(ts, i as u8));
        assert!(!result.was_cache_hit);
        assert!(result.errors.is_empty());
        states.push(result.find("double-top").map(|d| d.state));
    }
    assert_eq!(
        states,
        vec![
            Some(StabilityState::Emerging),
            Some(StabilityState::Emerging),
            Some(StabilityState::Stable),
        ]
    );
}

#[test]
fn scenario_c_reuses_until_the_scene_changes() {
    let mut config = PipelineConfig::default();
    config.delta.tolerance_bits = 0;
    let mut optimizer = DeltaOptimizer::new(&config.delta).unwrap();

    let mut decisions: Vec<DeltaDecision> = (0..10u64)
        .map(|i| optimizer.should_process(&checker(i * 33, 0)))
        .collect();
    decisions.push(optimizer.should_process(&checker(330, 1)));

    assert_eq!(decisions[0], DeltaDecision::Process(ProcessReason::FirstFrame));
    for (i, d) in decisions.iter().enumerate().take(10).skip(1) {
        assert!(d.is_reuse(), "frame {} was {d:?}", i + 1);
    }
    assert!(matches!(
        decisions[10],
        DeltaDecision::Process(ProcessReason::Changed { distance }) if distance > 0
    ));
}

#[test]
fn identical_frames_return_the_cached_result() {
    let mut config = PipelineConfig::default();
    config.stabilizer.min_stable_span_ms = 0;
    let mut pipeline = FramePipeline::new(config, PrecomputedDetections::new()).unwrap();

    pipeline.adapter_mut().load(both("wedge", 0.7, 0.9));
    let first = pipeline.handle_frame(&checker(0, 0));
    // Whatever the adapter would say now must not matter on a cache hit.
    pipeline.adapter_mut().load(both("flag", 0.9, 0.9));
    let second = pipeline.handle_frame(&checker(33, 0));

    assert!(!first.was_cache_hit);
    assert!(second.was_cache_hit);
    assert_eq!(second.stabilized, first.stabilized);
    assert_eq!(second.frame_timestamp_ms, 33);
}

#[test]
fn forced_process_happens_exactly_at_the_reuse_budget() {
    let mut config = PipelineConfig::default();
    config.delta.max_consecutive_reuse = 4;
    let mut pipeline = FramePipeline::new(config, PrecomputedDetections::new()).unwrap();

    let hits: Vec<bool> = (0..11u64)
        .map(|i| pipeline.handle_frame(&checker(i * 33, 0)).was_cache_hit)
        .collect();
    // process, 4 reuses, forced process, 4 reuses, forced process
    assert_eq!(
        hits,
        vec![false, true, true, true, true, false, true, true, true, true, false]
    );
    assert_eq!(pipeline.stats().forced, 2);
    assert_eq!(pipeline.stats().cache_hits, 8);
}

#[test]
fn out_of_order_frame_keeps_previous_output() {
    let mut config = PipelineConfig::default();
    config.stabilizer.min_stable_span_ms = 0;
    let mut pipeline = FramePipeline::new(config, PrecomputedDetections::new()).unwrap();

    for (i, ts) in [100u64, 133, 166].into_iter().enumerate() {
        pipeline.adapter_mut().load(both("flag", 0.8, 0.9));
        pipeline.handle_frame(&checker(ts, i as u8));
    }
    let before = pipeline.last_stabilized().to_vec();
    let stale = pipeline.handle_frame(&checker(50, 1));

    assert!(matches!(
        stale.errors.as_slice(),
        [PipelineError::StaleWindowState { last_ms: 166, got_ms: 50 }]
    ));
    assert_eq!(stale.stabilized, before);
    assert_eq!(pipeline.stats().stale_frames, 1);
}

#[test]
fn invalid_candidate_only_drops_its_label() {
    let mut config = PipelineConfig::default();
    config.stabilizer.min_stable_span_ms = 0;
    let mut pipeline = FramePipeline::new(config, PrecomputedDetections::new()).unwrap();

    let mut candidates = both("flag", 0.8, 0.9);
    candidates.push(CandidateDetection::new("wedge", 1.7, DetectorSource::Ml, 0));
    candidates.push(CandidateDetection::new("wedge", 0.9, DetectorSource::Template, 0));
    pipeline.adapter_mut().load(candidates);
    let result = pipeline.handle_frame(&checker(0, 0));

    assert!(result.find("flag").is_some());
    assert!(result.find("wedge").is_none());
    assert_eq!(result.errors.len(), 1);
    assert!(result.is_degraded());
}

fn stabilizer() -> TemporalStabilizer {
    TemporalStabilizer::new(StabilizerConfig {
        min_stable_span_ms: 0,
        ..StabilizerConfig::default()
    })
    .unwrap()
}

#[test]
fn k_of_n_frames_is_enough_and_k_minus_one_is_not() {
    // N = 5, K = 3; confirm on alternating frames.
    let mut s = stabilizer();
    let mut last = None;
    for (i, ts) in (0..5u64).map(|i| i * 20).enumerate() {
        let frame = if i % 2 == 0 { vec![fused("flag", 0.9, ts)] } else { vec![fused("flag", 0.2, ts)] };
        last = Some(s.update(&frame, ts).unwrap());
    }
    assert_eq!(state_of(&last.unwrap(), "flag"), Some(StabilityState::Stable));

    let mut s = stabilizer();
    let mut last = None;
    for (i, ts) in (0..5u64).map(|i| i * 20).enumerate() {
        let posterior = if i == 1 || i == 3 { 0.9 } else { 0.2 };
        last = Some(s.update(&[fused("flag", posterior, ts)], ts).unwrap());
    }
    assert_eq!(state_of(&last.unwrap(), "flag"), Some(StabilityState::Emerging));
}

#[test]
fn votes_outside_the_time_window_do_not_count() {
    // Three confirmations, but the first falls out of the 250ms window.
    let mut s = stabilizer();
    s.update(&[fused("flag", 0.9, 0)], 0).unwrap();
    s.update(&[fused("flag", 0.9, 200)], 200).unwrap();
    let out = s.update(&[fused("flag", 0.9, 300)], 300).unwrap();
    assert_eq!(state_of(&out, "flag"), Some(StabilityState::Emerging));
}

#[test]
fn grace_period_holds_for_g_minus_one_misses_and_expires_at_g() {
    let mut s = stabilizer();
    let grace = s.config().grace_period_frames as u64;
    assert_eq!(grace, 3);

    let mut ts = 0;
    for _ in 0..3 {
        s.update(&[fused("flag", 0.9, ts)], ts).unwrap();
        ts += 10;
    }

    let none: &[FusedDetection] = &[];
    for _ in 0..grace - 1 {
        let out = s.update(none, ts).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
        ts += 10;
    }

    let out = s.update(none, ts).unwrap();
    assert!(out.active.iter().all(|d| d.label.as_str() != "flag"));
    assert_eq!(out.retired.len(), 1);
    assert_eq!(out.retired[0].state, StabilityState::Decayed);

    // Forgotten: the next frame no longer mentions it at all.
    let out = s.update(none, ts + 10).unwrap();
    assert!(state_of(&out, "flag").is_none());
}

#[test]
fn stable_label_survives_a_frame_gap_until_the_grace_period_runs_out() {
    // Default window: 250ms, N = 5, K = 3, 80ms span, G = 3.
    let mut s = TemporalStabilizer::new(StabilizerConfig::default()).unwrap();
    let mut out = None;
    for ts in [0u64, 45, 90] {
        out = Some(s.update(&[fused("flag", 0.9, ts)], ts).unwrap());
    }
    assert_eq!(state_of(&out.unwrap(), "flag"), Some(StabilityState::Stable));

    // A stall pushes every confirming entry out of the 250ms window.
    let none: &[FusedDetection] = &[];
    let out = s.update(none, 400).unwrap();
    assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
    assert!(out.retired.is_empty());
    let out = s.update(none, 433).unwrap();
    assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));

    let out = s.update(none, 466).unwrap();
    assert!(out.active.iter().all(|d| d.label.as_str() != "flag"));
    assert_eq!(out.retired.len(), 1);
}

#[test]
fn resized_frame_is_processed_even_at_widest_tolerance() {
    let mut config = PipelineConfig::default();
    config.delta.tolerance_bits = 64;
    let mut pipeline = FramePipeline::new(config, PrecomputedDetections::new()).unwrap();

    assert!(!pipeline.handle_frame(&checker(0, 0)).was_cache_hit);
    assert!(pipeline.handle_frame(&checker(33, 1)).was_cache_hit);

    let larger = Frame::new(66, 32, 32, vec![120; 32 * 32]).unwrap();
    let result = pipeline.handle_frame(&larger);
    assert!(!result.was_cache_hit);
    assert_eq!(pipeline.delta_stats().changed, 1);
}
