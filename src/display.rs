use image::RgbImage;
use std::sync::{Mutex, PoisonError};

/// Receives the final image of each completed stage chain.
///
/// Called from a worker thread while the stage executor holds its slot
/// lock, so implementations must return quickly.
pub trait DisplaySink: Send + Sync {
    fn show(&self, frame_id: u64, image: &RgbImage);
}

/// Keeps the most recent rendered frame for a UI to poll.
#[derive(Default)]
pub struct LatestFrameDisplay {
    latest: Mutex<Option<(u64, RgbImage)>>,
}

impl LatestFrameDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the last frame shown, if any.
    pub fn latest_id(&self) -> Option<u64> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(id, _)| *id)
    }

    /// Copies the last frame shown.
    pub fn snapshot(&self) -> Option<(u64, RgbImage)> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DisplaySink for LatestFrameDisplay {
    fn show(&self, frame_id: u64, image: &RgbImage) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        match latest.as_mut() {
            // Reuses the previous allocation when the size is unchanged.
            Some((id, buffer)) => {
                *id = frame_id;
                buffer.clone_from(image);
            }
            None => *latest = Some((frame_id, image.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn keeps_only_latest_frame() {
        let display = LatestFrameDisplay::new();
        assert!(display.latest_id().is_none());

        display.show(1, &RgbImage::from_pixel(2, 2, Rgb([1, 1, 1])));
        display.show(2, &RgbImage::from_pixel(2, 2, Rgb([2, 2, 2])));

        let (id, image) = display.snapshot().unwrap();
        assert_eq!(id, 2);
        assert_eq!(image.get_pixel(0, 0), &Rgb([2, 2, 2]));
    }
}
