use image::imageops::{self, FilterType};
use image::GrayImage;

use super::{StageInput, StageOutput, StageSet};
use crate::frame::{gray_to_rgb_into, working_resolution};

/// Stage that produces an RGB image at the working resolution.
///
/// Source priority: a non-empty upstream result, then the controller's
/// downscaled gray copy, then the full frame.
pub fn resize_stage(height: u32, force_integer_scaling: bool) -> StageSet {
    StageSet::single("resize", move |input, output| {
        resize_into(input, output, height, force_integer_scaling)
    })
}

fn resize_into(input: &StageInput<'_>, output: &StageOutput<'_>, height: u32, force: bool) {
    let upstream = input.upstream;
    if upstream.width() > 0 && upstream.height() > 0 {
        let (width, height) = working_resolution(upstream.dimensions(), height, force);
        output.with(|result| {
            if upstream.dimensions() == (width, height) {
                result.clone_from(upstream);
            } else {
                *result = imageops::resize(upstream, width, height, FilterType::Triangle);
            }
        });
        return;
    }

    let source: &GrayImage = input.base.unwrap_or_else(|| input.frame.image());
    let (width, height) = working_resolution(source.dimensions(), height, force);
    if source.dimensions() == (width, height) {
        output.with(|result| gray_to_rgb_into(source, result));
    } else {
        let resized = imageops::resize(source, width, height, FilterType::Triangle);
        output.with(|result| gray_to_rgb_into(&resized, result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::readout::ReadoutMessage;
    use image::{Luma, Rgb, RgbImage};
    use std::sync::RwLock;
    use std::time::SystemTime;

    fn run(stage: &StageSet, frame: &Frame, base: Option<&GrayImage>, upstream: &RgbImage) -> RgbImage {
        let readout = ReadoutMessage::default();
        let buffer = RwLock::new(RgbImage::new(0, 0));
        let input = StageInput {
            frame,
            readout: &readout,
            base,
            upstream,
        };
        (stage.shards[0])(&input, &StageOutput::new(&buffer));
        buffer.into_inner().unwrap()
    }

    #[test]
    fn resizes_frame_to_working_resolution() {
        let frame = Frame::new(1, 0, SystemTime::now(), GrayImage::from_pixel(64, 48, Luma([90])));
        let image = run(&resize_stage(24, false), &frame, None, &RgbImage::new(0, 0));
        assert_eq!(image.dimensions(), (32, 24));
        assert_eq!(image.get_pixel(5, 5), &Rgb([90, 90, 90]));
    }

    #[test]
    fn prefers_downscaled_base_over_frame() {
        let frame = Frame::new(1, 0, SystemTime::now(), GrayImage::from_pixel(64, 48, Luma([10])));
        let base = GrayImage::from_pixel(32, 24, Luma([200]));
        let image = run(&resize_stage(24, false), &frame, Some(&base), &RgbImage::new(0, 0));
        assert_eq!(image.dimensions(), (32, 24));
        assert_eq!(image.get_pixel(0, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn prefers_upstream_when_present() {
        let frame = Frame::new(1, 0, SystemTime::now(), GrayImage::new(64, 48));
        let upstream = RgbImage::from_pixel(32, 24, Rgb([1, 2, 3]));
        let image = run(&resize_stage(12, false), &frame, None, &upstream);
        assert_eq!(image.dimensions(), (16, 12));
        assert_eq!(image.get_pixel(3, 3), &Rgb([1, 2, 3]));
    }
}
