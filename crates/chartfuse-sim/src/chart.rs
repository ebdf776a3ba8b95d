//! Synthetic chart frames.
//!
//! A seeded random-walk price series drawn as a dark line on a light
//! background, optionally scrolling and with per-pixel sensor noise.

use chartfuse::{Frame, PipelineError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const BACKGROUND: u8 = 235;
const INK: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    /// The chart never moves.
    Static,
    /// Shift left by one pixel every `every_frames` frames.
    Scrolling { every_frames: u32 },
}

#[derive(Debug)]
pub struct ChartRenderer {
    width: u32,
    height: u32,
    motion: Motion,
    sensor_noise: u8,
    series: Vec<f64>,
    rng: StdRng,
}

impl ChartRenderer {
    pub fn new(width: u32, height: u32, motion: Motion, sensor_noise: u8, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = width as usize * 4;
        let mut series = Vec::with_capacity(len);
        let mut price = 0.0f64;
        for _ in 0..len {
            let step: f64 = rng.sample(StandardNormal);
            price += step;
            series.push(price);
        }

        let (lo, hi) = series
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), &p| (lo.min(p), hi.max(p)));
        let span = (hi - lo).max(1e-9);
        for p in &mut series {
            *p = (*p - lo) / span;
        }

        Self {
            width,
            height,
            motion,
            sensor_noise,
            series,
            rng,
        }
    }

    fn row_of(&self, value: f64) -> u32 {
        let usable = self.height as f64 * 0.8;
        let top = self.height as f64 * 0.1;
        let y = top + (1.0 - value) * usable;
        (y as u32).min(self.height - 1)
    }

    pub fn render(&mut self, frame_index: u64, timestamp_ms: u64) -> Result<Frame, PipelineError> {
        let w = self.width as usize;
        let mut luma = vec![BACKGROUND; w * self.height as usize];

        let offset = match self.motion {
            Motion::Static => 0,
            Motion::Scrolling { every_frames } => {
                (frame_index / every_frames.max(1) as u64) as usize
            }
        };

        let mut prev_row = None;
        for x in 0..w {
            let value = self.series[(x + offset) % self.series.len()];
            let row = self.row_of(value);
            let (from, to) = match prev_row {
                Some(p) if p < row => (p, row),
                Some(p) => (row, p),
                None => (row, row),
            };
            for y in from..=to {
                luma[y as usize * w + x] = INK;
            }
            prev_row = Some(row);
        }

        if self.sensor_noise > 0 {
            let amplitude = self.sensor_noise as i16;
            for px in &mut luma {
                let n = self.rng.random_range(-amplitude..=amplitude);
                *px = (*px as i16 + n).clamp(0, 255) as u8;
            }
        }

        Frame::new(timestamp_ms, self.width, self.height, luma)
    }
}
