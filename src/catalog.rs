//! Time-windowed cataloguing of newly seen tags.
//!
//! Every `period`, each tag id gets one cropped region-of-interest image
//! written to the output directory. The work per frame is bounded by the
//! current worker budget so cataloguing never starves detection.

use anyhow::{Context, Result};
use image::{imageops, GrayImage};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::frame::Frame;
use crate::queue::{PushError, RingQueue, NEW_TAG_QUEUE_CAPACITY};
use crate::readout::{ReadoutMessage, TagReadout};
use crate::storage::{tag_roi_path, ImageStore};

// ----------------------------------------------------------------------------
// Export window
// ----------------------------------------------------------------------------

/// Set of tag ids already exported in the current time window.
#[derive(Debug)]
pub struct ExportWindow {
    end: Option<SystemTime>,
    period: Duration,
    exported: HashSet<u32>,
}

impl ExportWindow {
    pub fn new(period: Duration) -> Self {
        Self {
            end: None,
            period,
            exported: HashSet::new(),
        }
    }

    /// Starts a new window at `now` when none is open or the current one ended.
    /// Returns true when the window was reset.
    pub fn roll(&mut self, now: SystemTime) -> bool {
        if matches!(self.end, Some(end) if end >= now) {
            return false;
        }
        self.end = Some(now + self.period);
        self.exported.clear();
        true
    }

    /// Marks `id` exported. False if it already was in this window.
    pub fn claim(&mut self, id: u32) -> bool {
        self.exported.insert(id)
    }

    pub fn is_exported(&self, id: u32) -> bool {
        self.exported.contains(&id)
    }

    pub fn end(&self) -> Option<SystemTime> {
        self.end
    }

    pub fn len(&self) -> usize {
        self.exported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exported.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Catalog
// ----------------------------------------------------------------------------

/// Announces a catalogued tag to interested consumers.
#[derive(Clone, Debug)]
pub struct NewTagDescription {
    pub tag_id: u32,
    pub frame_id: u64,
    pub path: PathBuf,
    pub roi: Arc<GrayImage>,
}

pub struct Catalog {
    dir: PathBuf,
    roi_size: u32,
    window: ExportWindow,
    store: Arc<dyn ImageStore>,
    descriptors: Arc<RingQueue<NewTagDescription>>,
}

impl Catalog {
    pub fn new(
        dir: impl Into<PathBuf>,
        roi_size: u32,
        period: Duration,
        store: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            dir: dir.into(),
            roi_size: roi_size.max(1),
            window: ExportWindow::new(period),
            store,
            descriptors: Arc::new(RingQueue::new(NEW_TAG_QUEUE_CAPACITY)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn window(&self) -> &ExportWindow {
        &self.window
    }

    /// Queue of descriptors for every tag written. Best effort: full means dropped.
    pub fn descriptors(&self) -> Arc<RingQueue<NewTagDescription>> {
        self.descriptors.clone()
    }

    /// Exports up to `budget` tags of `readout` not yet seen in this window.
    ///
    /// Ids are claimed before the fan-out, so a failed write is not retried
    /// until the window rolls over.
    pub fn catalog(
        &mut self,
        frame: &Frame,
        readout: &ReadoutMessage,
        budget: usize,
        pool: &ThreadPool,
    ) -> Result<usize> {
        self.window.roll(frame.time());

        let mut selected: Vec<&TagReadout> = Vec::new();
        for tag in &readout.tags {
            if selected.len() >= budget {
                break;
            }
            if self.window.claim(tag.id) {
                selected.push(tag);
            }
        }
        if selected.is_empty() {
            return Ok(0);
        }

        let this = &*self;
        let results: Vec<Result<()>> =
            pool.install(|| selected.par_iter().map(|tag| this.export(frame, tag)).collect());
        let exported = results.into_iter().collect::<Result<Vec<()>>>()?.len();
        log::debug!("frame {}: catalogued {} new tag(s)", frame.id(), exported);
        Ok(exported)
    }

    fn export(&self, frame: &Frame, tag: &TagReadout) -> Result<()> {
        let (x, y, width, height) = roi_rect(
            (tag.x, tag.y),
            self.roi_size,
            (frame.width(), frame.height()),
        );
        let roi = imageops::crop_imm(frame.image(), x, y, width, height).to_image();
        let path = tag_roi_path(&self.dir, tag.id, frame.id());
        self.store
            .write_image(&path, &roi)
            .with_context(|| format!("catalogue tag {} of frame {}", tag.id, frame.id()))?;

        let description = NewTagDescription {
            tag_id: tag.id,
            frame_id: frame.id(),
            path,
            roi: Arc::new(roi),
        };
        match self.descriptors.push(description) {
            Ok(()) | Err(PushError::Closed(_)) => {}
            Err(PushError::Full(d)) => {
                log::debug!("new tag queue full, descriptor for tag {} dropped", d.tag_id)
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        self.descriptors.close();
    }
}

/// Square region of side `size` centered on `center`, shifted to stay inside
/// `bounds` and shrunk when the image is smaller than `size`.
pub fn roi_rect(center: (f64, f64), size: u32, bounds: (u32, u32)) -> (u32, u32, u32, u32) {
    let width = size.min(bounds.0);
    let height = size.min(bounds.1);
    let place = |c: f64, extent: u32, bound: u32| -> u32 {
        let start = c.round() as i64 - i64::from(size / 2);
        start.clamp(0, i64::from(bound - extent)) as u32
    };
    (
        place(center.0, width, bounds.0),
        place(center.1, height, bounds.1),
        width,
        height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryImageStore;
    use image::Luma;
    use rayon::ThreadPoolBuilder;

    fn readout(ids: &[u32]) -> ReadoutMessage {
        ReadoutMessage {
            tags: ids
                .iter()
                .map(|&id| TagReadout {
                    id,
                    x: 50.0,
                    y: 40.0,
                    theta: 0.0,
                })
                .collect(),
            ..ReadoutMessage::default()
        }
    }

    fn frame_at(id: u64, time: SystemTime) -> Frame {
        Frame::new(id, 0, time, GrayImage::from_fn(100, 80, |x, _| Luma([x as u8])))
    }

    #[test]
    fn window_resets_only_after_end() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut window = ExportWindow::new(Duration::from_secs(10));

        assert!(window.roll(start));
        assert!(window.claim(1));
        assert!(!window.claim(1));

        assert!(!window.roll(start + Duration::from_secs(10)));
        assert!(window.is_exported(1));

        assert!(window.roll(start + Duration::from_secs(11)));
        assert!(window.is_empty());
        assert_eq!(window.end(), Some(start + Duration::from_secs(21)));
    }

    #[test]
    fn roi_is_clamped_and_shrunk() {
        assert_eq!(roi_rect((50.0, 40.0), 20, (100, 80)), (40, 30, 20, 20));
        assert_eq!(roi_rect((2.0, 78.0), 20, (100, 80)), (0, 60, 20, 20));
        assert_eq!(roi_rect((10.0, 10.0), 300, (100, 80)), (0, 0, 100, 80));
    }

    #[test]
    fn exports_each_tag_once_per_window_within_budget() {
        let store = Arc::new(InMemoryImageStore::new());
        let mut catalog = Catalog::new("/out", 20, Duration::from_secs(10), store.clone());
        let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        let n = catalog
            .catalog(&frame_at(1, start), &readout(&[1, 2, 3]), 2, &pool)
            .unwrap();
        assert_eq!(n, 2);

        let n = catalog
            .catalog(&frame_at(2, start + Duration::from_secs(1)), &readout(&[1, 2, 3]), 2, &pool)
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.get(Path::new("/out/ant_3_2.png")).is_some());

        let n = catalog
            .catalog(&frame_at(3, start + Duration::from_secs(2)), &readout(&[1, 2, 3]), 2, &pool)
            .unwrap();
        assert_eq!(n, 0);

        let n = catalog
            .catalog(&frame_at(4, start + Duration::from_secs(20)), &readout(&[1]), 2, &pool)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.len(), 4);

        let roi = store.get(Path::new("/out/ant_1_1.png")).unwrap();
        assert_eq!(roi.dimensions(), (20, 20));
        assert_eq!(roi.get_pixel(0, 0), &Luma([40]));

        let descriptors = catalog.descriptors();
        assert_eq!(descriptors.len(), 4);
        assert_eq!(descriptors.try_pop().unwrap().frame_id, 1);
    }
}
