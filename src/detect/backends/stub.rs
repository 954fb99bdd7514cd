use anyhow::{bail, Result};
use image::GrayImage;

use crate::detect::backend::TagDetector;
use crate::readout::TagReadout;

/// Tag positions of the synthetic scene at `step`.
///
/// Tags walk along ellipses around the image center. The synthetic frame
/// source draws markers at these positions and `StubBackend` reports them back.
pub fn constellation(step: u64, width: u32, height: u32, count: u32) -> Vec<TagReadout> {
    let (cx, cy) = (f64::from(width) / 2.0, f64::from(height) / 2.0);
    (0..count)
        .map(|i| {
            let phase = step as f64 * 0.02 + f64::from(i) * std::f64::consts::TAU / f64::from(count.max(1));
            let radius = 0.15 + 0.3 * f64::from(i % 3 + 1) / 3.0;
            TagReadout {
                id: i,
                x: cx + radius * cx * phase.cos(),
                y: cy + radius * cy * phase.sin(),
                theta: phase,
            }
        })
        .collect()
}

/// Stub backend for the synthetic source. Replays the synthetic constellation.
pub struct StubBackend {
    tags: u32,
    calls: u64,
}

impl StubBackend {
    pub fn new(tags: u32) -> Self {
        Self { tags, calls: 0 }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(8)
    }
}

impl TagDetector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &GrayImage, threads: usize) -> Result<Vec<TagReadout>> {
        if threads == 0 {
            bail!("detector needs at least one thread");
        }
        self.calls += 1;
        Ok(constellation(self.calls, image.width(), image.height(), self.tags))
    }
}
