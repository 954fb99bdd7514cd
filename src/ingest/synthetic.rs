use anyhow::Result;
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::SystemTime;

use super::{FrameSource, SourceConfig, SourceStats};
use crate::detect::constellation;
use crate::frame::Frame;

const SYNTHETIC_TAGS: u32 = 8;
const MARKER_HALF_SIZE: i64 = 6;
const BACKGROUND: u8 = 170;

/// Synthetic scene: noisy background with dark square markers that follow
/// the stub detector's constellation.
pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        log::info!("SyntheticSource: connected to {} (synthetic)", config.url);
        Self {
            config,
            frame_count: 0,
            rng: StdRng::seed_from_u64(0x7a6),
        }
    }

    fn render(&mut self, step: u64) -> GrayImage {
        let (width, height) = (self.config.width, self.config.height);
        let mut image = GrayImage::from_fn(width, height, |_, _| {
            Luma([BACKGROUND + self.rng.gen_range(0..16)])
        });
        for tag in constellation(step, width, height, SYNTHETIC_TAGS) {
            let (cx, cy) = (tag.x.round() as i64, tag.y.round() as i64);
            for y in cy - MARKER_HALF_SIZE..=cy + MARKER_HALF_SIZE {
                for x in cx - MARKER_HALF_SIZE..=cx + MARKER_HALF_SIZE {
                    if x < 0 || y < 0 || x >= i64::from(width) || y >= i64::from(height) {
                        continue;
                    }
                    image.put_pixel(x as u32, y as u32, Luma([20]));
                }
            }
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.config.frames.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        let id = self.frame_count;
        self.frame_count += 1;

        let timestamp = id * 1_000_000 / u64::from(self.config.fps.max(1));
        let image = self.render(id);
        Ok(Some(Frame::new(id, timestamp, SystemTime::now(), image)))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_limited_sequence_with_markers() {
        let mut source = SyntheticSource::new(SourceConfig {
            width: 200,
            height: 100,
            fps: 10,
            frames: Some(2),
            ..SourceConfig::default()
        });

        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert!(source.next_frame().unwrap().is_none());

        assert_eq!((first.id(), second.id()), (0, 1));
        assert_eq!(second.timestamp(), 100_000);
        assert_eq!((first.width(), first.height()), (200, 100));

        let tag = &constellation(0, 200, 100, SYNTHETIC_TAGS)[0];
        let marker = first.image().get_pixel(tag.x.round() as u32, tag.y.round() as u32);
        assert_eq!(marker, &Luma([20]));
        assert_eq!(source.stats().frames_captured, 2);
    }
}
