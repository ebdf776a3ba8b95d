//! Incoming video frames.

use crate::error::PipelineError;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// One captured frame of the chart: an 8-bit luma plane plus its capture time.
///
/// The pixel buffer is reference counted so the frame can be handed to the
/// detector adapter and kept as a learning reference without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    timestamp_ms: u64,
    width: u32,
    height: u32,
    luma: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        timestamp_ms: u64,
        width: u32,
        height: u32,
        luma: impl Into<Arc<[u8]>>,
    ) -> Result<Self, PipelineError> {
        let luma = luma.into();
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidFrame(format!(
                "empty frame {width}x{height}"
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| PipelineError::InvalidFrame("frame dimensions overflow".to_string()))?;
        if luma.len() != expected {
            return Err(PipelineError::InvalidFrame(format!(
                "luma plane has {} bytes, expected {expected} for {width}x{height}",
                luma.len()
            )));
        }
        Ok(Self {
            timestamp_ms,
            width,
            height,
            luma,
        })
    }

    /// Convert interleaved RGB(A) pixels to luma (BT.601 integer weights).
    pub fn from_rgb(
        timestamp_ms: u64,
        width: u32,
        height: u32,
        pixels: &[u8],
        channels: usize,
    ) -> Result<Self, PipelineError> {
        if channels < 3 {
            return Err(PipelineError::InvalidFrame(format!(
                "{channels} channels is not RGB"
            )));
        }
        let luma: Vec<u8> = pixels
            .chunks_exact(channels)
            .map(|px| {
                let y = 77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32;
                (y >> 8) as u8
            })
            .collect();
        Self::new(timestamp_ms, width, height, luma)
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    /// Handle on this frame for consumers outside the pipeline. Shares the
    /// pixel buffer.
    pub fn reference(&self, pipeline_id: Uuid, sequence: u64) -> FrameRef {
        FrameRef {
            pipeline_id,
            sequence,
            timestamp_ms: self.timestamp_ms,
            width: self.width,
            height: self.height,
            luma: Arc::clone(&self.luma),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.luma
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

/// Identifies a processed frame: which pipeline saw it, its position in that
/// pipeline's stream, and its pixels.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRef {
    pub pipeline_id: Uuid,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub luma: Arc<[u8]>,
}
