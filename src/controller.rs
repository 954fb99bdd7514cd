//! Pipeline controller: the single consumer of the frame queue.
//!
//! Every frame takes the mandatory path (downscale, video output). Then it
//! is either dropped, when the backlog policy says the controller is
//! behind, or fully processed: detection, cataloguing, readout
//! publication, full-frame export and the display stage chain.
//!
//! Only closing the frame queue ends the loop normally. Tearing down drains
//! the background tasks in dependency order.

use anyhow::{Context, Result};
use image::{GrayImage, RgbImage};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::budget::WorkerBudget;
use crate::catalog::{Catalog, NewTagDescription};
use crate::detect::TagDetector;
use crate::display::DisplaySink;
use crate::export::FullFrameExport;
use crate::frame::{downscale_nearest_into, gray_to_rgb_into, working_resolution, FramePtr};
use crate::pool::{Pool, Pooled};
use crate::queue::{PushError, RingQueue, FRAME_QUEUE_CAPACITY};
use crate::readout::{message_pool, ReadoutError, ReadoutMessage};
use crate::stage::{ExecutorState, StageExecutor, StageJob, StageSet};
use crate::storage::{FilesystemImageStore, ImageStore};
use crate::transport::ReadoutSink;
use crate::video::VideoSink;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

/// When the controller sheds a frame instead of processing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BacklogPolicy {
    /// Drop when at least `threshold` frames wait behind the current one.
    DropWhenQueued { threshold: usize },
    NeverDrop,
}

impl Default for BacklogPolicy {
    fn default() -> Self {
        BacklogPolicy::DropWhenQueued { threshold: 1 }
    }
}

impl BacklogPolicy {
    pub fn should_drop(&self, queued: usize) -> bool {
        match *self {
            BacklogPolicy::DropWhenQueued { threshold } => queued >= threshold.max(1),
            BacklogPolicy::NeverDrop => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub producer_uuid: String,
    /// Process only frames whose `id % frame_stride` is in `frame_ids`. 0 or 1 disables.
    pub frame_stride: u64,
    pub frame_ids: HashSet<u64>,
    /// Enables cataloguing and full-frame export.
    pub new_tag_output_dir: Option<PathBuf>,
    pub new_tag_roi_size: u32,
    pub image_renew_period: Duration,
    pub first_full_frame_delay: Duration,
    pub frame_queue_capacity: usize,
    /// Worker pool size. 0 uses every available core.
    pub max_workers: usize,
    pub backlog: BacklogPolicy,
    pub working_height: u32,
    pub force_integer_scaling: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            producer_uuid: String::new(),
            frame_stride: 1,
            frame_ids: HashSet::new(),
            new_tag_output_dir: None,
            new_tag_roi_size: 500,
            image_renew_period: Duration::from_secs(2 * 60 * 60),
            first_full_frame_delay: Duration::from_secs(2 * 60),
            frame_queue_capacity: FRAME_QUEUE_CAPACITY,
            max_workers: 0,
            backlog: BacklogPolicy::default(),
            working_height: 1080,
            force_integer_scaling: false,
        }
    }
}

/// Optional collaborators. Anything left `None` disables that part of the pipeline.
#[derive(Default)]
pub struct Collaborators {
    pub detector: Option<Box<dyn TagDetector>>,
    pub readout_sink: Option<Arc<dyn ReadoutSink>>,
    pub video: Option<Arc<dyn VideoSink>>,
    pub display: Option<Arc<dyn DisplaySink>>,
    pub stages: Vec<StageSet>,
    /// Overrides the filesystem store under `new_tag_output_dir`.
    pub image_store: Option<Arc<dyn ImageStore>>,
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    detection_failures: AtomicU64,
    export_failures: AtomicU64,
    display_overflows: AtomicU64,
    exported_tags: AtomicU64,
    full_frames: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    /// Refused by the full frame queue.
    pub rejected: u64,
    pub processed: u64,
    /// Shed by the backlog policy.
    pub dropped: u64,
    /// Outside the frame stride.
    pub skipped: u64,
    pub detection_failures: u64,
    pub export_failures: u64,
    pub display_overflows: u64,
    pub exported_tags: u64,
    pub full_frames: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            rejected: load(&self.rejected),
            processed: load(&self.processed),
            dropped: load(&self.dropped),
            skipped: load(&self.skipped),
            detection_failures: load(&self.detection_failures),
            export_failures: load(&self.export_failures),
            display_overflows: load(&self.display_overflows),
            exported_tags: load(&self.exported_tags),
            full_frames: load(&self.full_frames),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Gray and RGB buffer counts for a frame queue of `capacity`.
///
/// Besides one set per queued frame, the stage executor keeps the gray
/// copies of its running and pending frames, and the video sink keeps its
/// queued frames plus the one being written.
fn pool_sizes(capacity: usize, display: bool, video_queue: Option<usize>) -> (usize, usize) {
    let gray_per_cycle = match (display, video_queue.is_some()) {
        (true, _) => 2,
        (false, true) => 1,
        (false, false) => 0,
    };
    let executor_held = if display { 2 } else { 0 };
    let rgb = video_queue.map_or(0, |depth| capacity + depth + 1);
    (gray_per_cycle * capacity + executor_held, rgb)
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Producer side of the pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    queue: Arc<RingQueue<FramePtr>>,
    readout_sink: Option<Arc<dyn ReadoutSink>>,
    producer_uuid: Arc<str>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    /// Queues `frame` for processing. A full queue rejects the frame and
    /// publishes an overflow readout for it. Returns whether the frame was queued.
    pub fn queue_frame(&self, frame: FramePtr) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(PushError::Full(frame)) => {
                bump(&self.stats.rejected);
                log::warn!("frame queue full, frame {} rejected", frame.id());
                if let Some(sink) = &self.readout_sink {
                    let mut m = ReadoutMessage::default();
                    m.prepare(&frame, &self.producer_uuid);
                    m.error = Some(ReadoutError::ProcessOverflow);
                    sink.publish(&m);
                }
                false
            }
            Err(PushError::Closed(_)) => false,
        }
    }

    /// Ends the pipeline once the queued frames are drained.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct Pipeline {
    options: PipelineOptions,
    queue: Arc<RingQueue<FramePtr>>,
    stats: Arc<PipelineStats>,
    budget: Arc<WorkerBudget>,
    workers: Arc<ThreadPool>,
    messages: Pool<ReadoutMessage>,
    gray_pool: Pool<GrayImage>,
    rgb_pool: Pool<RgbImage>,
    detector: Option<Box<dyn TagDetector>>,
    readout_sink: Option<Arc<dyn ReadoutSink>>,
    video: Option<Arc<dyn VideoSink>>,
    executor: Option<StageExecutor>,
    catalog: Option<Catalog>,
    export: Option<Arc<FullFrameExport>>,
    next_frame_export: Option<SystemTime>,
    last_stats: Instant,
}

impl Pipeline {
    pub fn new(
        options: PipelineOptions,
        collaborators: Collaborators,
        input_resolution: (u32, u32),
    ) -> Result<Self> {
        let Collaborators {
            mut detector,
            readout_sink,
            video,
            display,
            stages,
            image_store,
        } = collaborators;

        let budget = Arc::new(if options.max_workers == 0 {
            WorkerBudget::from_available_cores()
        } else {
            WorkerBudget::new(options.max_workers)
        });
        let workers = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(budget.max())
                .thread_name(|i| format!("tagwatch-worker-{}", i))
                .build()
                .context("build worker pool")?,
        );

        let capacity = options.frame_queue_capacity.max(1);
        let (width, height) = working_resolution(
            input_resolution,
            options.working_height,
            options.force_integer_scaling,
        );
        let display_enabled = !stages.is_empty();
        let (gray_count, rgb_count) = pool_sizes(
            capacity,
            display_enabled,
            video.as_ref().map(|video| video.queue_capacity()),
        );
        let gray_pool = Pool::<GrayImage>::new("gray");
        gray_pool.reserve_images(gray_count, width, height);
        let rgb_pool = Pool::<RgbImage>::new("rgb");
        rgb_pool.reserve_images(rgb_count, width, height);

        if display.is_some() && !display_enabled {
            log::warn!("display configured without stages, nothing will be shown");
        }
        let executor = display_enabled
            .then(|| StageExecutor::new(stages, workers.clone(), budget.clone(), display));

        let (catalog, export) = match &options.new_tag_output_dir {
            Some(dir) => {
                let store: Arc<dyn ImageStore> = match image_store {
                    Some(store) => store,
                    None => Arc::new(FilesystemImageStore::open(dir.clone())?),
                };
                let catalog = Catalog::new(
                    dir.clone(),
                    options.new_tag_roi_size,
                    options.image_renew_period,
                    store.clone(),
                );
                let export = FullFrameExport::new(dir.clone(), store)?;
                (Some(catalog), Some(Arc::new(export)))
            }
            None => (None, None),
        };

        if let Some(detector) = detector.as_mut() {
            detector
                .warm_up()
                .with_context(|| format!("warm up detector {}", detector.name()))?;
        }

        log::info!(
            "pipeline: input {}x{}, working {}x{}, {} workers, detector={}, stages={:?}",
            input_resolution.0,
            input_resolution.1,
            width,
            height,
            budget.max(),
            detector.as_ref().map_or("none", |d| d.name()),
            executor.as_ref().map(StageExecutor::stage_names).unwrap_or_default()
        );

        Ok(Self {
            queue: Arc::new(RingQueue::new(capacity)),
            stats: Arc::new(PipelineStats::default()),
            messages: message_pool(capacity + 2),
            options,
            budget,
            workers,
            gray_pool,
            rgb_pool,
            detector,
            readout_sink,
            video,
            executor,
            catalog,
            export,
            next_frame_export: None,
            last_stats: Instant::now(),
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            queue: self.queue.clone(),
            readout_sink: self.readout_sink.clone(),
            producer_uuid: Arc::from(self.options.producer_uuid.as_str()),
            stats: self.stats.clone(),
        }
    }

    pub fn budget(&self) -> Arc<WorkerBudget> {
        self.budget.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Descriptors of newly catalogued tags, when cataloguing is enabled.
    pub fn new_tags(&self) -> Option<Arc<RingQueue<NewTagDescription>>> {
        self.catalog.as_ref().map(Catalog::descriptors)
    }

    pub fn full_frame_export(&self) -> Option<Arc<FullFrameExport>> {
        self.export.clone()
    }

    pub fn executor_state(&self) -> ExecutorState {
        self.executor
            .as_ref()
            .map_or(ExecutorState::Idle, StageExecutor::state)
    }

    /// Runs the loop on a dedicated thread.
    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        std::thread::Builder::new()
            .name("tagwatch-process".into())
            .spawn(move || self.run())
            .context("spawn process thread")
    }

    /// Processes frames until the queue is closed and drained.
    pub fn run(mut self) -> Result<()> {
        let result = self.process_frames();
        if let Err(e) = &result {
            log::error!("pipeline aborted: {:#}", e);
        }
        self.tear_down();
        result
    }

    fn process_frames(&mut self) -> Result<()> {
        while let Some(frame) = self.queue.pop() {
            bump(&self.stats.received);

            if self.export.as_ref().is_some_and(|e| e.is_free()) && self.budget.is_reduced() {
                self.budget.restore();
                log::debug!("full frame export done, budget back to {}", self.budget.get());
            }

            let base = self.process_mandatory(&frame)?;

            if self.options.backlog.should_drop(self.queue.len()) {
                self.drop_frame(&frame)?;
                continue;
            }

            self.process_frame(frame, base)?;
            self.log_stats();
        }
        Ok(())
    }

    /// Downscale and video output. Returns the downscaled copy for the stage chain.
    fn process_mandatory(&self, frame: &FramePtr) -> Result<Option<Pooled<GrayImage>>> {
        if self.video.is_none() && self.executor.is_none() {
            return Ok(None);
        }
        let mut downscaled = self.gray_pool.get()?;
        downscale_nearest_into(frame.image(), &mut downscaled);

        if let Some(video) = &self.video {
            let mut rgb = self.rgb_pool.get()?;
            gray_to_rgb_into(&downscaled, &mut rgb);
            video.enqueue(rgb, frame.time(), frame.id());
        }
        Ok(Some(downscaled))
    }

    fn drop_frame(&self, frame: &FramePtr) -> Result<()> {
        bump(&self.stats.dropped);
        log::debug!(
            "frame {} dropped, {} frame(s) behind",
            frame.id(),
            self.queue.len()
        );
        if let Some(sink) = &self.readout_sink {
            let mut m = self.messages.get()?;
            m.prepare(frame, &self.options.producer_uuid);
            m.error = Some(ReadoutError::ProcessOverflow);
            sink.publish(&m);
        }
        Ok(())
    }

    fn process_frame(&mut self, frame: FramePtr, base: Option<Pooled<GrayImage>>) -> Result<()> {
        let mut readout = self.messages.get()?;
        readout.prepare(&frame, &self.options.producer_uuid);

        if self.should_process(frame.id()) {
            self.detect(&frame, &mut readout);
            // Cataloguing errors are carried by the published readout.
            self.catalog_tags(&frame, &mut readout);
            if let Some(sink) = &self.readout_sink {
                sink.publish(&readout);
            }
            self.export_full_frame(&frame);
        } else {
            bump(&self.stats.skipped);
        }
        bump(&self.stats.processed);

        if let Some(executor) = &self.executor {
            let job = StageJob {
                frame,
                readout,
                base,
            };
            if let Err(overflow) = executor.start(job) {
                bump(&self.stats.display_overflows);
                log::debug!("{}", overflow);
            }
        }
        Ok(())
    }

    fn should_process(&self, id: u64) -> bool {
        if self.options.frame_stride <= 1 {
            return true;
        }
        self.options
            .frame_ids
            .contains(&(id % self.options.frame_stride))
    }

    fn detect(&mut self, frame: &FramePtr, readout: &mut ReadoutMessage) {
        let Some(detector) = self.detector.as_mut() else {
            return;
        };
        match detector.detect(frame.image(), self.budget.get()) {
            Ok(tags) => readout.tags.extend(tags),
            Err(e) => {
                bump(&self.stats.detection_failures);
                log::warn!(
                    "detector {} failed on frame {}: {:#}",
                    detector.name(),
                    frame.id(),
                    e
                );
                readout.error = Some(ReadoutError::DetectorFailure);
            }
        }
    }

    fn catalog_tags(&mut self, frame: &FramePtr, readout: &mut ReadoutMessage) {
        let Some(catalog) = self.catalog.as_mut() else {
            return;
        };
        match catalog.catalog(frame, readout, self.budget.get(), &self.workers) {
            Ok(count) => {
                self.stats
                    .exported_tags
                    .fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(e) => {
                bump(&self.stats.export_failures);
                log::warn!("cataloguing failed on frame {}: {:#}", frame.id(), e);
                readout.error = Some(ReadoutError::ExportFailure);
            }
        }
    }

    fn export_full_frame(&mut self, frame: &FramePtr) {
        let Some(export) = &self.export else {
            return;
        };
        let time = frame.time();
        let due = *self
            .next_frame_export
            .get_or_insert(time + self.options.first_full_frame_delay);
        if time < due || !export.queue_export(frame.clone()) {
            return;
        }
        self.budget.reserve_one();
        self.next_frame_export = Some(time + self.options.image_renew_period);
        bump(&self.stats.full_frames);
        log::debug!(
            "full frame {} queued for export, budget {}",
            frame.id(),
            self.budget.get()
        );
    }

    fn log_stats(&mut self) {
        if self.last_stats.elapsed() < STATS_INTERVAL {
            return;
        }
        self.last_stats = Instant::now();
        let s = self.stats.snapshot();
        log::info!(
            "frames received={} processed={} dropped={} rejected={} skipped={} tags_exported={} budget={}/{} display={}",
            s.received,
            s.processed,
            s.dropped,
            s.rejected,
            s.skipped,
            s.exported_tags,
            self.budget.get(),
            self.budget.max(),
            self.executor_state()
        );
    }

    fn tear_down(&mut self) {
        self.queue.close();
        if let Some(export) = &self.export {
            export.close();
        }
        if let Some(video) = &self.video {
            video.close();
        }
        if let Some(executor) = &self.executor {
            executor.wait_idle();
        }
        if let Some(catalog) = &self.catalog {
            catalog.close();
        }
        if let Some(sink) = &self.readout_sink {
            sink.close();
        }
        let s = self.stats.snapshot();
        log::info!(
            "pipeline stopped: received={} processed={} dropped={} rejected={}",
            s.received,
            s.processed,
            s.dropped,
            s.rejected
        );
    }
}
