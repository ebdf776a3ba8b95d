//! Temporal Stabilizer
//!
//! Keeps a short window of recent frames and, per pattern label, the fused
//! posteriors those frames produced. A label becomes STABLE once at least
//! `K` of the last `N` frames confirm it (posterior at or above the
//! confidence threshold) over at least `min_stable_span_ms`. A stable label
//! survives up to `G - 1` consecutive non-confirming frames; on the `G`-th it
//! is reported once as DECAYED and forgotten, so a later re-detection starts
//! over from EMERGING.
//!
//! Votes and misses are recounted from the window on every update. The only
//! state carried outside the window is whether a label has already been
//! promoted, and when.

use crate::config::{Aggregate, StabilizerConfig};
use crate::detection::{BoundingBox, FusedDetection, PatternLabel, StabilityState, StabilizedDetection};
use crate::error::PipelineError;
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    timestamp_ms: u64,
    posterior: f64,
}

#[derive(Debug, Clone)]
struct LabelTrack {
    entries: VecDeque<WindowEntry>,
    state: StabilityState,
    first_seen_ms: u64,
    first_stable_ms: Option<u64>,
    region: Option<BoundingBox>,
    /// Aggregate from the last update that still had entries; reported while
    /// a stable label rides out a gap with nothing left in the window.
    last_confidence: f64,
}

impl LabelTrack {
    fn new(first_seen_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            state: StabilityState::Emerging,
            first_seen_ms,
            first_stable_ms: None,
            region: None,
            last_confidence: 0.0,
        }
    }

    fn push(&mut self, timestamp_ms: u64, posterior: f64) {
        if let Some(last) = self.entries.back_mut() {
            if last.timestamp_ms == timestamp_ms {
                last.posterior = last.posterior.max(posterior);
                return;
            }
        }
        self.entries.push_back(WindowEntry {
            timestamp_ms,
            posterior,
        });
    }

    fn evict_before(&mut self, oldest_ms: u64) {
        while self
            .entries
            .front()
            .is_some_and(|e| e.timestamp_ms < oldest_ms)
        {
            self.entries.pop_front();
        }
    }

    fn aggregate(&self, how: Aggregate) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        match how {
            Aggregate::Mean => {
                self.entries.iter().map(|e| e.posterior).sum::<f64>() / self.entries.len() as f64
            }
            Aggregate::Max => self
                .entries
                .iter()
                .map(|e| e.posterior)
                .fold(0.0, f64::max),
            Aggregate::RecencyWeighted => {
                let mut weighted = 0.0;
                let mut total = 0.0;
                for (i, e) in self.entries.iter().enumerate() {
                    let w = (i + 1) as f64;
                    weighted += w * e.posterior;
                    total += w;
                }
                weighted / total
            }
        }
    }
}

/// What one update produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StabilizerOutput {
    /// Emerging and stable labels, ordered by label.
    pub active: Vec<StabilizedDetection>,
    /// Labels whose grace period ran out on this frame.
    pub retired: Vec<StabilizedDetection>,
}

/// Counts derived from the window for one label.
#[derive(Debug, Clone, Copy)]
struct Tally {
    votes: usize,
    earliest_vote_ms: Option<u64>,
    misses: usize,
}

#[derive(Debug, Clone)]
pub struct TemporalStabilizer {
    config: StabilizerConfig,
    consensus_votes: usize,
    frame_capacity: usize,
    frames: VecDeque<u64>,
    tracks: BTreeMap<PatternLabel, LabelTrack>,
}

impl TemporalStabilizer {
    pub fn new(config: StabilizerConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let frame_capacity = config.window_frames.max(config.grace_period_frames) + 1;
        Ok(Self {
            consensus_votes: config.consensus_votes(),
            frame_capacity,
            frames: VecDeque::with_capacity(frame_capacity),
            tracks: BTreeMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &StabilizerConfig {
        &self.config
    }

    pub fn consensus_votes(&self) -> usize {
        self.consensus_votes
    }

    /// Number of frames currently inside the window.
    pub fn window_len(&self) -> usize {
        self.frames.len()
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.frames.back().copied()
    }

    pub fn tracked_labels(&self) -> impl Iterator<Item = &PatternLabel> {
        self.tracks.keys()
    }

    /// A frame must be strictly newer than the last one accepted.
    pub fn check_timestamp(&self, timestamp_ms: u64) -> Result<(), PipelineError> {
        match self.last_timestamp() {
            Some(last_ms) if timestamp_ms <= last_ms => Err(PipelineError::StaleWindowState {
                last_ms,
                got_ms: timestamp_ms,
            }),
            _ => Ok(()),
        }
    }

    /// Advance the window by one frame carrying `fused`.
    ///
    /// A stale timestamp is rejected and leaves the window untouched.
    pub fn update<'a, I>(&mut self, fused: I, timestamp_ms: u64) -> Result<StabilizerOutput, PipelineError>
    where
        I: IntoIterator<Item = &'a FusedDetection>,
    {
        if let Err(err) = self.check_timestamp(timestamp_ms) {
            warn!(error = %err, "dropping out-of-order stabilizer update");
            return Err(err);
        }

        self.advance_frames(timestamp_ms);
        let oldest_ms = self.frames.front().copied().unwrap_or(timestamp_ms);
        for track in self.tracks.values_mut() {
            track.evict_before(oldest_ms);
        }

        for detection in fused {
            let track = self
                .tracks
                .entry(detection.label.clone())
                .or_insert_with(|| LabelTrack::new(timestamp_ms));
            track.push(timestamp_ms, detection.posterior);
            if detection.region.is_some() {
                track.region = detection.region;
            }
        }

        Ok(self.evaluate(timestamp_ms))
    }

    fn advance_frames(&mut self, timestamp_ms: u64) {
        self.frames.push_back(timestamp_ms);
        let horizon = self.config.window_duration_ms;
        while self
            .frames
            .front()
            .is_some_and(|&ts| timestamp_ms - ts > horizon)
        {
            self.frames.pop_front();
        }
        while self.frames.len() > self.frame_capacity {
            self.frames.pop_front();
        }
    }

    fn tally(&self, track: &LabelTrack) -> Tally {
        let threshold = self.config.confidence_threshold;
        let recent_start = self
            .frames
            .iter()
            .rev()
            .take(self.config.window_frames)
            .last()
            .copied()
            .unwrap_or(0);

        let mut votes = 0;
        let mut earliest_vote_ms = None;
        let mut last_confirm_ms = None;
        for entry in track.entries.iter().filter(|e| e.posterior >= threshold) {
            if entry.timestamp_ms >= recent_start {
                votes += 1;
                earliest_vote_ms.get_or_insert(entry.timestamp_ms);
            }
            last_confirm_ms = Some(entry.timestamp_ms);
        }
        let misses = match last_confirm_ms {
            Some(at) => self.frames.iter().filter(|&&ts| ts > at).count(),
            None => self.frames.len(),
        };

        Tally {
            votes,
            earliest_vote_ms,
            misses,
        }
    }

    fn evaluate(&mut self, now_ms: u64) -> StabilizerOutput {
        let mut output = StabilizerOutput::default();
        let mut forget: SmallVec<[PatternLabel; 4]> = SmallVec::new();

        let tallies: Vec<(PatternLabel, Tally)> = self
            .tracks
            .iter()
            .map(|(label, track)| (label.clone(), self.tally(track)))
            .collect();

        for (label, tally) in tallies {
            let Some(track) = self.tracks.get_mut(&label) else {
                continue;
            };
            match track.state {
                StabilityState::Emerging => {
                    if track.entries.is_empty() {
                        forget.push(label);
                        continue;
                    }
                    let span_ok = tally
                        .earliest_vote_ms
                        .is_some_and(|t| now_ms - t >= self.config.min_stable_span_ms);
                    if tally.votes >= self.consensus_votes && span_ok {
                        track.state = StabilityState::Stable;
                        track.first_stable_ms = Some(now_ms);
                        debug!(label = %label, votes = tally.votes, "detection stable");
                    }
                }
                StabilityState::Stable => {
                    if tally.misses >= self.config.grace_period_frames {
                        track.state = StabilityState::Decayed;
                        debug!(label = %label, misses = tally.misses, "detection decayed");
                    }
                }
                StabilityState::Decayed => {}
            }

            if !track.entries.is_empty() {
                track.last_confidence = track.aggregate(self.config.aggregate);
            }
            let snapshot = StabilizedDetection {
                label: label.clone(),
                confidence: track.last_confidence,
                state: track.state,
                first_seen_ms: track.first_seen_ms,
                first_stable_ms: track.first_stable_ms,
                last_update_ms: now_ms,
                votes: tally.votes,
                region: track.region,
            };
            if track.state == StabilityState::Decayed {
                output.retired.push(snapshot);
                forget.push(label);
            } else {
                output.active.push(snapshot);
            }
        }

        for label in forget {
            self.tracks.remove(&label);
        }
        output
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[FusedDetection] = &[];

    fn config() -> StabilizerConfig {
        StabilizerConfig {
            min_stable_span_ms: 0,
            ..StabilizerConfig::default()
        }
    }

    fn seen(label: &str, posterior: f64) -> Vec<FusedDetection> {
        vec![FusedDetection {
            label: label.into(),
            posterior,
            frame_timestamp_ms: 0,
            ml_confidence: Some(posterior),
            template_confidence: None,
            region: None,
        }]
    }

    fn state_of(output: &StabilizerOutput, label: &str) -> Option<StabilityState> {
        output
            .active
            .iter()
            .find(|d| d.label.as_str() == label)
            .map(|d| d.state)
    }

    #[test]
    fn test_emerging_then_stable() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        let out = stab.update(&seen("flag", 0.9), 0).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Emerging));
        stab.update(&seen("flag", 0.9), 33).unwrap();
        let out = stab.update(&seen("flag", 0.9), 66).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
        assert_eq!(out.active[0].first_stable_ms, Some(66));
        assert_eq!(out.active[0].first_seen_ms, 0);
    }

    #[test]
    fn test_below_threshold_does_not_vote() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        let mut out = StabilizerOutput::default();
        for i in 0..5 {
            out = stab.update(&seen("flag", 0.3), i * 33).unwrap();
        }
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Emerging));
        assert_eq!(out.active[0].votes, 0);
    }

    #[test]
    fn test_span_requirement() {
        let mut stab = TemporalStabilizer::new(StabilizerConfig::default()).unwrap();
        stab.update(&seen("wedge", 0.9), 0).unwrap();
        stab.update(&seen("wedge", 0.9), 30).unwrap();
        let out = stab.update(&seen("wedge", 0.9), 60).unwrap();
        assert_eq!(state_of(&out, "wedge"), Some(StabilityState::Emerging));
        let out = stab.update(&seen("wedge", 0.9), 90).unwrap();
        assert_eq!(state_of(&out, "wedge"), Some(StabilityState::Stable));
    }

    #[test]
    fn test_stale_timestamp_leaves_window_untouched() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        stab.update(&seen("flag", 0.9), 100).unwrap();
        let err = stab.update(&seen("flag", 0.9), 100).unwrap_err();
        assert!(matches!(err, PipelineError::StaleWindowState { last_ms: 100, got_ms: 100 }));
        assert!(stab.update(&seen("flag", 0.9), 50).is_err());
        assert_eq!(stab.window_len(), 1);
    }

    #[test]
    fn test_time_eviction() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        stab.update(&seen("flag", 0.9), 0).unwrap();
        stab.update(&seen("flag", 0.9), 100).unwrap();
        let out = stab.update(NONE, 400).unwrap();
        assert_eq!(stab.window_len(), 1);
        // Emerging label with nothing left in the window is dropped.
        assert!(out.active.is_empty());
        assert!(out.retired.is_empty());
        assert_eq!(stab.tracked_labels().count(), 0);
    }

    #[test]
    fn test_decay_after_grace_period() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        let mut ts = 0;
        for _ in 0..3 {
            stab.update(&seen("flag", 0.9), ts).unwrap();
            ts += 33;
        }
        // G = 3: two misses keep it, the third retires it.
        for _ in 0..2 {
            let out = stab.update(NONE, ts).unwrap();
            assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
            ts += 33;
        }
        let out = stab.update(NONE, ts).unwrap();
        assert!(out.active.is_empty());
        assert_eq!(out.retired.len(), 1);
        assert_eq!(out.retired[0].state, StabilityState::Decayed);

        // Re-detection starts from scratch.
        let out = stab.update(&seen("flag", 0.9), ts + 33).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Emerging));
        assert_eq!(out.active[0].first_seen_ms, ts + 33);
    }

    #[test]
    fn test_gap_longer_than_window_counts_frames_not_time() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        for i in 0..3 {
            stab.update(&seen("flag", 0.9), i * 33).unwrap();
        }
        // Every confirming entry ages out, but only one frame was missed.
        let out = stab.update(NONE, 1_000).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
        assert!((out.active[0].confidence - 0.9).abs() < 1e-12);
        assert!(out.retired.is_empty());

        let out = stab.update(NONE, 1_033).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
        let out = stab.update(NONE, 1_066).unwrap();
        assert!(out.active.is_empty());
        assert_eq!(out.retired.len(), 1);
    }

    #[test]
    fn test_stable_rides_out_low_frames() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        for i in 0..3 {
            stab.update(&seen("flag", 0.9), i * 33).unwrap();
        }
        let out = stab.update(&seen("flag", 0.2), 99).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
        let out = stab.update(&seen("flag", 0.9), 132).unwrap();
        assert_eq!(state_of(&out, "flag"), Some(StabilityState::Stable));
    }

    #[test]
    fn test_aggregates() {
        let mut cfg = config();
        for (aggregate, expected) in [
            (Aggregate::Mean, 0.6),
            (Aggregate::Max, 0.8),
            (Aggregate::RecencyWeighted, (0.4 + 2.0 * 0.8) / 3.0),
        ] {
            cfg.aggregate = aggregate;
            let mut stab = TemporalStabilizer::new(cfg.clone()).unwrap();
            stab.update(&seen("flag", 0.4), 0).unwrap();
            let out = stab.update(&seen("flag", 0.8), 33).unwrap();
            assert!((out.active[0].confidence - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reset() {
        let mut stab = TemporalStabilizer::new(config()).unwrap();
        stab.update(&seen("flag", 0.9), 500).unwrap();
        stab.reset();
        assert_eq!(stab.window_len(), 0);
        assert!(stab.update(&seen("flag", 0.9), 10).is_ok());
    }
}
