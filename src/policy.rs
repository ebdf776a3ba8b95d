//! Power and thermal presets.
//!
//! The host reports battery, charging and thermal state; the governor maps
//! it to an `InferencePolicy` and retunes the delta tolerance of every
//! pipeline sharing its `DeltaTolerance` handle. Wider tolerance under
//! pressure means more frames are answered from the previous result.

use crate::config::DeltaConfig;
use crate::delta::DeltaTolerance;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Device thermal state, in increasing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalStatus {
    #[default]
    None,
    Light,
    Moderate,
    Severe,
    Critical,
    Emergency,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// 0 to 100.
    pub battery_percent: u8,
    pub charging: bool,
    pub power_save: bool,
    #[serde(default)]
    pub thermal: ThermalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePolicy {
    UltraLowPower,
    LowPower,
    Balanced,
    HighPerformance,
}

impl InferencePolicy {
    pub fn for_state(state: &DeviceState) -> Self {
        if state.battery_percent < 15 && !state.charging {
            Self::UltraLowPower
        } else if state.power_save || state.thermal >= ThermalStatus::Moderate {
            Self::LowPower
        } else if state.charging || state.battery_percent > 80 {
            Self::HighPerformance
        } else {
            Self::Balanced
        }
    }

    pub fn target_fps(&self) -> u32 {
        match self {
            Self::UltraLowPower => 10,
            Self::LowPower => 20,
            Self::Balanced => 30,
            Self::HighPerformance => 60,
        }
    }

    pub fn frame_interval_ms(&self) -> u64 {
        1000 / self.target_fps() as u64
    }

    /// Square input size the detector adapter should downscale to.
    pub fn input_size_px(&self) -> u32 {
        match self {
            Self::UltraLowPower => 384,
            Self::LowPower => 416,
            Self::Balanced => 512,
            Self::HighPerformance => 640,
        }
    }

    pub fn tolerance_bits(&self) -> u32 {
        match self {
            Self::UltraLowPower => 12,
            Self::LowPower => 8,
            Self::Balanced => 5,
            Self::HighPerformance => 2,
        }
    }

    pub fn reuse_budget(&self) -> u32 {
        match self {
            Self::UltraLowPower => 60,
            Self::LowPower => 45,
            Self::Balanced => 30,
            Self::HighPerformance => 10,
        }
    }

    /// Delta settings for a pipeline built under this policy.
    pub fn delta_config(&self) -> DeltaConfig {
        DeltaConfig {
            tolerance_bits: self.tolerance_bits(),
            max_consecutive_reuse: self.reuse_budget(),
        }
    }

    /// Retune a running pipeline. Only the tolerance is adjustable live.
    pub fn apply(&self, tolerance: &DeltaTolerance) {
        tolerance.set(self.tolerance_bits());
    }
}

/// Tracks the active policy and pushes changes into a tolerance handle.
#[derive(Debug)]
pub struct PowerGovernor {
    tolerance: DeltaTolerance,
    current: Option<InferencePolicy>,
}

impl PowerGovernor {
    pub fn new(tolerance: DeltaTolerance) -> Self {
        Self {
            tolerance,
            current: None,
        }
    }

    pub fn current(&self) -> Option<InferencePolicy> {
        self.current
    }

    /// Returns the new policy when the device state caused a switch.
    pub fn observe(&mut self, state: &DeviceState) -> Option<InferencePolicy> {
        let policy = InferencePolicy::for_state(state);
        if self.current == Some(policy) {
            return None;
        }
        policy.apply(&self.tolerance);
        info!(
            ?policy,
            battery = state.battery_percent,
            charging = state.charging,
            thermal = ?state.thermal,
            tolerance_bits = policy.tolerance_bits(),
            "power policy changed"
        );
        self.current = Some(policy);
        Some(policy)
    }
}
