//! Scripted chart sessions with ground truth.

use crate::chart::Motion;
use chartfuse::PatternLabel;
use chartfuse::policy::{DeviceState, ThermalStatus};

/// A pattern that is truly on screen during `[start_ms, end_ms)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSpan {
    pub label: PatternLabel,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl PatternSpan {
    pub fn new(label: &str, start_ms: u64, end_ms: u64) -> Self {
        Self {
            label: label.into(),
            start_ms,
            end_ms,
        }
    }

    pub fn is_active(&self, timestamp_ms: u64) -> bool {
        (self.start_ms..self.end_ms).contains(&timestamp_ms)
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub duration_ms: u64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub motion: Motion,
    pub sensor_noise: u8,
    pub patterns: Vec<PatternSpan>,
    /// Labels that are never present but that detectors may hallucinate.
    pub distractors: Vec<PatternLabel>,
    /// From this point on the device reports heavy thermal throttling.
    pub thermal_from_ms: Option<u64>,
}

impl Scenario {
    pub fn frame_interval_ms(&self) -> u64 {
        1000 / self.fps.max(1) as u64
    }

    pub fn frame_count(&self) -> u64 {
        self.duration_ms / self.frame_interval_ms()
    }

    pub fn timestamp_of(&self, frame_index: u64) -> u64 {
        frame_index * self.frame_interval_ms()
    }

    pub fn active_at(&self, timestamp_ms: u64) -> impl Iterator<Item = &PatternLabel> {
        self.patterns
            .iter()
            .filter(move |p| p.is_active(timestamp_ms))
            .map(|p| &p.label)
    }

    pub fn is_active(&self, label: &PatternLabel, timestamp_ms: u64) -> bool {
        self.active_at(timestamp_ms).any(|l| l == label)
    }

    pub fn device_at(&self, timestamp_ms: u64) -> Option<DeviceState> {
        let from = self.thermal_from_ms?;
        Some(DeviceState {
            battery_percent: 60,
            charging: false,
            power_save: false,
            thermal: if timestamp_ms >= from {
                ThermalStatus::Severe
            } else {
                ThermalStatus::None
            },
        })
    }
}

fn labels(names: &[&str]) -> Vec<PatternLabel> {
    names.iter().map(|&n| PatternLabel::from(n)).collect()
}

pub fn all() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "static_head_and_shoulders",
            description: "Still chart, one pattern throughout",
            duration_ms: 3_000,
            fps: 30,
            width: 96,
            height: 64,
            motion: Motion::Static,
            sensor_noise: 2,
            patterns: vec![PatternSpan::new("head-and-shoulders", 0, 3_000)],
            distractors: labels(&["flag", "wedge"]),
            thermal_from_ms: None,
        },
        Scenario {
            name: "scrolling_double_top",
            description: "Live chart scrolling, pattern appears then leaves",
            duration_ms: 4_000,
            fps: 30,
            width: 96,
            height: 64,
            motion: Motion::Scrolling { every_frames: 3 },
            sensor_noise: 1,
            patterns: vec![PatternSpan::new("double-top", 1_000, 3_000)],
            distractors: labels(&["triangle", "pennant"]),
            thermal_from_ms: None,
        },
        Scenario {
            name: "pattern_handoff",
            description: "One pattern replaced by another mid-session",
            duration_ms: 4_000,
            fps: 30,
            width: 96,
            height: 64,
            motion: Motion::Scrolling { every_frames: 6 },
            sensor_noise: 2,
            patterns: vec![
                PatternSpan::new("triangle", 0, 2_000),
                PatternSpan::new("flag", 2_000, 4_000),
            ],
            distractors: labels(&["wedge"]),
            thermal_from_ms: None,
        },
        Scenario {
            name: "noisy_no_pattern",
            description: "No pattern; detectors only produce false alarms",
            duration_ms: 3_000,
            fps: 30,
            width: 96,
            height: 64,
            motion: Motion::Static,
            sensor_noise: 4,
            patterns: Vec::new(),
            distractors: labels(&["flag", "wedge", "triangle", "double-bottom"]),
            thermal_from_ms: None,
        },
        Scenario {
            name: "thermal_throttle",
            description: "Scrolling chart; device overheats halfway through",
            duration_ms: 4_000,
            fps: 30,
            width: 96,
            height: 64,
            motion: Motion::Scrolling { every_frames: 2 },
            sensor_noise: 2,
            patterns: vec![PatternSpan::new("cup-and-handle", 0, 4_000)],
            distractors: labels(&["channel"]),
            thermal_from_ms: Some(2_000),
        },
    ]
}

pub fn by_name(name: &str) -> Option<Scenario> {
    all().into_iter().find(|s| s.name == name)
}

pub fn list_scenarios() -> Vec<(&'static str, &'static str)> {
    all().iter().map(|s| (s.name, s.description)).collect()
}
