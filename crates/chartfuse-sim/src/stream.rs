//! Recorded-session output in the format `replay` reads back.

use crate::SimError;
use crate::chart::ChartRenderer;
use crate::detectors::SyntheticDetectors;
use crate::scenarios::Scenario;
use chartfuse::policy::DeviceState;
use chartfuse::{CandidateDetection, DetectorAdapter, DetectorSource, ReliabilityProfiles};
use serde::Serialize;
use std::io::Write;

/// One JSON line: a frame, what both detectors said about it and,
/// when the scenario models it, the device state.
#[derive(Debug, Serialize)]
pub struct StreamRecord<'a> {
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub luma: &'a [u8],
    pub candidates: Vec<CandidateDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceState>,
}

/// Writes the whole scenario as JSON lines and returns the frame count.
pub fn write_stream<W: Write>(
    scenario: &Scenario,
    profiles: ReliabilityProfiles,
    seed: u64,
    mut out: W,
) -> Result<u64, SimError> {
    let mut renderer = ChartRenderer::new(
        scenario.width,
        scenario.height,
        scenario.motion,
        scenario.sensor_noise,
        seed,
    );
    // Offset so pixel noise and detector draws are independent streams.
    let mut detectors = SyntheticDetectors::new(scenario.clone(), profiles, seed ^ 0x5eed)?;

    let count = scenario.frame_count();
    for index in 0..count {
        let ts = scenario.timestamp_of(index);
        let frame = renderer.render(index, ts)?;
        let mut candidates = Vec::new();
        for source in DetectorSource::ALL {
            candidates.extend(detectors.detect(&frame, source)?);
        }
        let record = StreamRecord {
            timestamp_ms: ts,
            width: frame.width(),
            height: frame.height(),
            luma: frame.luma(),
            candidates,
            device: scenario.device_at(ts),
        };
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(count)
}
