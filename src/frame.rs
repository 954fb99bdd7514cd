//! Camera frames and the pixel helpers the cheap paths need.
//!
//! - `Frame`: one captured grayscale image with id and timestamps. Immutable.
//! - `FramePtr`: shared handle; the frame is released when the last holder drops it.
//! - Working resolution and nearest-neighbour conversions into pooled buffers.

use image::{GrayImage, RgbImage};
use std::sync::Arc;
use std::time::SystemTime;

/// Shared, immutable frame handle.
pub type FramePtr = Arc<Frame>;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured camera image.
pub struct Frame {
    id: u64,
    /// Camera clock, in microseconds.
    timestamp: u64,
    /// Wall clock at capture.
    time: SystemTime,
    image: GrayImage,
}

impl Frame {
    pub fn new(id: u64, timestamp: u64, time: SystemTime, image: GrayImage) -> Self {
        Self {
            id,
            timestamp,
            time,
            image,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn time(&self) -> SystemTime {
        self.time
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_ptr(self) -> FramePtr {
        Arc::new(self)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Working resolution
// ----------------------------------------------------------------------------

/// Resolution of the downscaled buffers for a target output `height`.
///
/// With `force_integer_scaling`, the height is snapped so the input height is an
/// integer multiple of it. Both dimensions are kept even for video encoders.
pub fn working_resolution(
    input: (u32, u32),
    height: u32,
    force_integer_scaling: bool,
) -> (u32, u32) {
    let (in_width, in_height) = input;
    if in_width == 0 || in_height == 0 {
        return (0, 0);
    }
    let mut height = height.clamp(1, in_height);
    if force_integer_scaling {
        let factor = (f64::from(in_height) / f64::from(height)).round().max(1.0);
        height = (f64::from(in_height) / factor).round() as u32;
    }
    if height % 2 == 1 && height > 1 {
        height -= 1;
    }
    let mut width = ((u64::from(in_width) * u64::from(height)) / u64::from(in_height)) as u32;
    if width % 2 == 1 && width > 1 {
        width -= 1;
    }
    (width.max(1), height.max(1))
}

// ----------------------------------------------------------------------------
// Conversions into pre-allocated buffers
// ----------------------------------------------------------------------------

/// Nearest-neighbour resample of `src` into `dst` at `dst`'s size. Does not allocate.
pub fn downscale_nearest_into(src: &GrayImage, dst: &mut GrayImage) {
    let (sw, sh) = src.dimensions();
    let (dw, dh) = dst.dimensions();
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return;
    }
    let src_raw = src.as_raw();
    let dst_raw: &mut [u8] = dst;
    for y in 0..dh {
        let sy = (u64::from(y) * u64::from(sh) / u64::from(dh)) as usize;
        let src_row = &src_raw[sy * sw as usize..(sy + 1) * sw as usize];
        let dst_row = &mut dst_raw[(y * dw) as usize..((y + 1) * dw) as usize];
        for (x, out) in dst_row.iter_mut().enumerate() {
            let sx = (x as u64 * u64::from(sw) / u64::from(dw)) as usize;
            *out = src_row[sx];
        }
    }
}

/// Expands grayscale `src` into RGB `dst`, reallocating `dst` only if the sizes differ.
pub fn gray_to_rgb_into(src: &GrayImage, dst: &mut RgbImage) {
    if dst.dimensions() != src.dimensions() {
        *dst = RgbImage::new(src.width(), src.height());
    }
    let dst_raw: &mut [u8] = dst;
    for (rgb, &luma) in dst_raw.chunks_exact_mut(3).zip(src.as_raw().iter()) {
        rgb.fill(luma);
    }
}
