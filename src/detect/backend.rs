use anyhow::Result;
use image::GrayImage;

use crate::readout::TagReadout;

/// Tag detector collaborator.
///
/// The pipeline only sequences calls into the detector. A failed call is
/// recorded on the frame's readout and processing moves on to the next frame.
pub trait TagDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect tags on a full-resolution frame using at most `threads` worker threads.
    ///
    /// Positions are reported in `image` pixel coordinates, in detection order.
    fn detect(&mut self, image: &GrayImage, threads: usize) -> Result<Vec<TagReadout>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
