use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::{ShardFn, StageInput, StageOutput, StageSet};
use crate::readout::TagReadout;

const TAG_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const HIGHLIGHT_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const TAG_RADIUS: i32 = 3;
const HIGHLIGHT_RADIUS: i32 = 6;

/// 3x5 digit glyphs, row-major.
const GLYPHS: [[u8; 15]; 10] = [
    [1, 1, 1, 1, 0, 1, 1, 0, 1, 1, 0, 1, 1, 1, 1],
    [0, 1, 0, 1, 1, 0, 0, 1, 0, 0, 1, 0, 1, 1, 1],
    [1, 1, 1, 0, 0, 1, 1, 1, 1, 1, 0, 0, 1, 1, 1],
    [1, 1, 1, 0, 0, 1, 0, 1, 1, 0, 0, 1, 1, 1, 1],
    [1, 0, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 0, 0, 1],
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 0, 0, 1, 1, 1, 1],
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 1, 0, 1, 1, 1, 1],
    [1, 1, 1, 0, 0, 1, 0, 1, 0, 0, 1, 0, 0, 1, 0],
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 1, 0, 1, 1, 1, 1],
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 1, 1, 1],
];

/// Tag ids drawn with the highlight style. Clones share the set.
#[derive(Clone, Debug, Default)]
pub struct Highlights {
    ids: Arc<RwLock<HashSet<u32>>>,
}

impl Highlights {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: Arc::new(RwLock::new(ids.into_iter().collect())),
        }
    }

    pub fn add(&self, id: u32) {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn remove(&self, id: u32) {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Returns whether `id` is highlighted afterwards.
    pub fn toggle(&self, id: u32) -> bool {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        if ids.remove(&id) {
            false
        } else {
            ids.insert(id);
            true
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

/// Runtime switch for the id labels next to each tag. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct IdLabels {
    enabled: Arc<AtomicBool>,
}

impl IdLabels {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Returns whether labels are drawn afterwards.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Stage that marks every detected tag on the upstream image.
///
/// Shard `i` of `n` draws tags `i`, `i + n`, `i + 2n`, ...
pub fn overlay_stage(shards: usize, highlights: Highlights, labels: IdLabels) -> StageSet {
    let count = shards.max(1);
    let shards = (0..count)
        .map(|start| {
            let highlights = highlights.clone();
            let labels = labels.clone();
            Arc::new(move |input: &StageInput<'_>, output: &StageOutput<'_>| {
                draw_tags(input, output, start, count, &highlights, &labels)
            }) as ShardFn
        })
        .collect();
    StageSet::new("overlay", shards)
}

fn draw_tags(
    input: &StageInput<'_>,
    output: &StageOutput<'_>,
    start: usize,
    stride: usize,
    highlights: &Highlights,
    labels: &IdLabels,
) {
    if input.frame.height() == 0 {
        return;
    }
    let tags: Vec<(&TagReadout, bool)> = input
        .readout
        .tags
        .iter()
        .skip(start)
        .step_by(stride)
        .map(|tag| (tag, highlights.contains(tag.id)))
        .collect();
    if tags.is_empty() {
        return;
    }
    let draw_ids = labels.is_enabled();

    output.with(|result| {
        let ratio = f64::from(result.height()) / f64::from(input.frame.height());
        for (tag, highlighted) in tags {
            draw_tag(result, tag, ratio, highlighted, draw_ids);
        }
    });
}

fn draw_tag(image: &mut RgbImage, tag: &TagReadout, ratio: f64, highlighted: bool, draw_id: bool) {
    let center = ((tag.x * ratio).round() as i32, (tag.y * ratio).round() as i32);
    let (radius, color) = if highlighted {
        (HIGHLIGHT_RADIUS, HIGHLIGHT_COLOR)
    } else {
        (TAG_RADIUS, TAG_COLOR)
    };
    draw_filled_circle_mut(image, center, radius, color);

    if draw_id {
        let label = if highlighted { HIGHLIGHT_COLOR } else { LABEL_COLOR };
        draw_number(image, (center.0 + 6, center.1 - 2), tag.id, label);
    }
}

/// Draws `value` in 3x5 glyphs with a one pixel background border.
fn draw_number(image: &mut RgbImage, origin: (i32, i32), value: u32, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let mut left = origin.0;
    for digit in value.to_string().bytes() {
        let glyph = &GLYPHS[usize::from(digit - b'0')];
        for dy in -1..6 {
            for dx in -1..4 {
                let (x, y) = (left + dx, origin.1 + dy);
                if x < 0 || y < 0 || x >= width || y >= height {
                    continue;
                }
                let lit = (0..3).contains(&dx)
                    && (0..5).contains(&dy)
                    && glyph[(dy * 3 + dx) as usize] == 1;
                image.put_pixel(x as u32, y as u32, if lit { color } else { LABEL_BACKGROUND });
            }
        }
        left += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::readout::ReadoutMessage;
    use image::GrayImage;
    use std::time::SystemTime;

    fn tag(id: u32, x: f64, y: f64) -> TagReadout {
        TagReadout {
            id,
            x,
            y,
            theta: 0.0,
        }
    }

    fn render(stage: &StageSet, tags: Vec<TagReadout>) -> RgbImage {
        let frame = Frame::new(1, 0, SystemTime::now(), GrayImage::new(200, 100));
        let readout = ReadoutMessage {
            tags,
            ..ReadoutMessage::default()
        };
        let buffer = RwLock::new(RgbImage::new(100, 50));
        let upstream = RgbImage::new(100, 50);
        let input = StageInput {
            frame: &frame,
            readout: &readout,
            base: None,
            upstream: &upstream,
        };
        let output = StageOutput::new(&buffer);
        for shard in &stage.shards {
            shard(&input, &output);
        }
        buffer.into_inner().unwrap()
    }

    #[test]
    fn marks_tags_scaled_to_result() {
        let image = render(
            &overlay_stage(2, Highlights::default(), IdLabels::default()),
            vec![tag(1, 100.0, 50.0), tag(2, 20.0, 20.0), tag(3, 180.0, 80.0)],
        );
        assert_eq!(image.get_pixel(50, 25), &TAG_COLOR);
        assert_eq!(image.get_pixel(10, 10), &TAG_COLOR);
        assert_eq!(image.get_pixel(90, 40), &TAG_COLOR);
        assert_eq!(image.get_pixel(70, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn highlighted_tags_are_larger() {
        let highlights = Highlights::new([7]);
        let image = render(&overlay_stage(1, highlights, IdLabels::default()), vec![tag(7, 100.0, 50.0)]);
        assert_eq!(image.get_pixel(50, 25), &HIGHLIGHT_COLOR);
        assert_eq!(image.get_pixel(55, 25), &HIGHLIGHT_COLOR);
    }

    #[test]
    fn draws_id_label_next_to_tag() {
        let stage = overlay_stage(1, Highlights::default(), IdLabels::new(true));
        let image = render(&stage, vec![tag(1, 40.0, 40.0)]);
        // Glyph "1" at (26, 18): its top-middle pixel is lit.
        assert_eq!(image.get_pixel(27, 18), &LABEL_COLOR);
        assert_eq!(image.get_pixel(26, 18), &LABEL_BACKGROUND);
    }

    #[test]
    fn id_labels_switch_at_runtime() {
        let labels = IdLabels::new(false);
        let stage = overlay_stage(1, Highlights::default(), labels.clone());

        let image = render(&stage, vec![tag(1, 40.0, 40.0)]);
        assert_eq!(image.get_pixel(27, 18), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(26, 18), &Rgb([0, 0, 0]));

        assert!(labels.toggle());
        let image = render(&stage, vec![tag(1, 40.0, 40.0)]);
        assert_eq!(image.get_pixel(27, 18), &LABEL_COLOR);

        labels.set(false);
        assert!(!labels.is_enabled());
    }

    #[test]
    fn every_shard_draws_its_share_of_tags() {
        let tags: Vec<TagReadout> = (0..7)
            .map(|i| tag(i, 20.0 + 20.0 * f64::from(i), 20.0))
            .collect();
        let image = render(&overlay_stage(3, Highlights::default(), IdLabels::default()), tags);
        for i in 0..7 {
            assert_eq!(image.get_pixel(10 + 10 * i, 10), &TAG_COLOR, "tag {}", i);
        }
    }

    #[test]
    fn toggle_flips_membership() {
        let highlights = Highlights::default();
        assert!(highlights.toggle(4));
        assert!(highlights.contains(4));
        assert!(!highlights.toggle(4));
        highlights.add(5);
        highlights.remove(5);
        assert!(!highlights.contains(5));
    }
}
