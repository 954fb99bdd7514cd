//! Parallel post-processing stage chains.
//!
//! A chain is an ordered list of `StageSet`s. Each set is a list of shard
//! functions that together produce one stage result for one frame; shards
//! run concurrently on the shared worker pool.
//!
//! The executor double-buffers: at most one chain runs (`current`) and one
//! frame waits (`next`). A third frame arriving before the running chain
//! completes is rejected with `Overflow`, which bounds the frames in flight
//! inside the heavy path to two regardless of camera rate.

mod overlay;
mod resize;

use image::{GrayImage, RgbImage};
use rayon::ThreadPool;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use thiserror::Error;

use crate::budget::WorkerBudget;
use crate::display::DisplaySink;
use crate::frame::{Frame, FramePtr};
use crate::pool::Pooled;
use crate::readout::{ReadoutError, ReadoutMessage};

pub use overlay::{overlay_stage, Highlights, IdLabels};
pub use resize::resize_stage;

// ----------------------------------------------------------------------------
// Stage functions
// ----------------------------------------------------------------------------

/// What a shard reads.
pub struct StageInput<'a> {
    pub frame: &'a Frame,
    pub readout: &'a ReadoutMessage,
    /// Downscaled grayscale copy produced by the controller's mandatory path.
    pub base: Option<&'a GrayImage>,
    /// Result of the previous stage. Empty (0x0) for the first stage.
    pub upstream: &'a RgbImage,
}

/// Shared result buffer of the running stage.
///
/// Every stage but the first starts from a copy of its upstream. The first
/// stage is expected to overwrite its whole result.
pub struct StageOutput<'a> {
    buffer: &'a RwLock<RgbImage>,
}

impl<'a> StageOutput<'a> {
    pub(crate) fn new(buffer: &'a RwLock<RgbImage>) -> Self {
        Self { buffer }
    }

    /// Runs `f` with exclusive access to the result.
    pub fn with<R>(&self, f: impl FnOnce(&mut RgbImage) -> R) -> R {
        f(&mut write(self.buffer))
    }
}

/// One shard of a stage.
pub type ShardFn = Arc<dyn Fn(&StageInput<'_>, &StageOutput<'_>) + Send + Sync>;

/// A stage: shards that run in parallel on one frame.
#[derive(Clone)]
pub struct StageSet {
    name: &'static str,
    shards: Vec<ShardFn>,
}

impl StageSet {
    pub fn new(name: &'static str, shards: Vec<ShardFn>) -> Self {
        Self { name, shards }
    }

    /// Stage made of a single shard.
    pub fn single(
        name: &'static str,
        shard: impl Fn(&StageInput<'_>, &StageOutput<'_>) + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, vec![Arc::new(shard)])
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Jobs and state
// ----------------------------------------------------------------------------

/// Everything one chain run holds on to until it completes.
pub struct StageJob {
    pub frame: FramePtr,
    pub readout: Pooled<ReadoutMessage>,
    pub base: Option<Pooled<GrayImage>>,
}

/// Both the running and the pending slot were taken.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("stage chain overflow: frame {frame_id} dropped")]
pub struct Overflow {
    pub frame_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running { frame_id: u64, stage: usize },
    Pending { current: u64, next: u64 },
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorState::Idle => f.write_str("idle"),
            ExecutorState::Running { frame_id, stage } => {
                write!(f, "running frame {} at stage {}", frame_id, stage)
            }
            ExecutorState::Pending { current, next } => {
                write!(f, "running frame {}, frame {} pending", current, next)
            }
        }
    }
}

struct Running {
    job: Arc<StageJob>,
    stage: usize,
    active: usize,
}

impl Running {
    fn new(job: Arc<StageJob>) -> Self {
        Self {
            job,
            stage: 0,
            active: 0,
        }
    }
}

#[derive(Default)]
struct Slots {
    current: Option<Running>,
    next: Option<Arc<StageJob>>,
}

// ----------------------------------------------------------------------------
// Executor
// ----------------------------------------------------------------------------

struct Inner {
    pool: Arc<ThreadPool>,
    budget: Arc<WorkerBudget>,
    stages: Vec<StageSet>,
    results: Vec<RwLock<RgbImage>>,
    empty: RgbImage,
    display: Option<Arc<dyn DisplaySink>>,
    slots: Mutex<Slots>,
    idle: Condvar,
}

/// Runs stage chains with one pending slot.
pub struct StageExecutor {
    inner: Arc<Inner>,
}

impl StageExecutor {
    pub fn new(
        stages: Vec<StageSet>,
        pool: Arc<ThreadPool>,
        budget: Arc<WorkerBudget>,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Self {
        let results = stages
            .iter()
            .map(|_| RwLock::new(RgbImage::new(0, 0)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                pool,
                budget,
                stages,
                results,
                empty: RgbImage::new(0, 0),
                display,
                slots: Mutex::new(Slots::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Starts `job` now, parks it as the pending frame, or rejects it.
    pub fn start(&self, job: StageJob) -> Result<(), Overflow> {
        let frame_id = job.frame.id();
        let mut slots = self.inner.lock_slots();
        if slots.current.is_none() {
            slots.current = Some(Running::new(Arc::new(job)));
            self.inner.advance(&mut slots);
            return Ok(());
        }
        if slots.next.is_none() {
            slots.next = Some(Arc::new(job));
            return Ok(());
        }
        drop(slots);

        let mut job = job;
        job.readout.error = Some(ReadoutError::ProcessOverflow);
        log::debug!("stage chain busy ({}), frame {} dropped", self.state(), frame_id);
        Err(Overflow { frame_id })
    }

    pub fn state(&self) -> ExecutorState {
        let slots = self.inner.lock_slots();
        match (&slots.current, &slots.next) {
            (None, _) => ExecutorState::Idle,
            (Some(running), None) => ExecutorState::Running {
                frame_id: running.job.frame.id(),
                stage: running.stage,
            },
            (Some(running), Some(next)) => ExecutorState::Pending {
                current: running.job.frame.id(),
                next: next.frame.id(),
            },
        }
    }

    /// Blocks until both slots are empty.
    pub fn wait_idle(&self) {
        let mut slots = self.inner.lock_slots();
        while slots.current.is_some() || slots.next.is_some() {
            slots = self
                .inner
                .idle
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.inner.stages.iter().map(StageSet::name).collect()
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the current chain forward until shards are in flight or both slots are empty.
    fn advance(self: &Arc<Self>, slots: &mut Slots) {
        loop {
            let Some(running) = slots.current.as_mut() else {
                self.idle.notify_all();
                return;
            };
            if running.stage < self.stages.len() {
                let spawned = self.spawn_stage(running);
                if spawned > 0 {
                    running.active = spawned;
                    return;
                }
                running.stage += 1;
                continue;
            }

            if let (Some(display), Some(last)) = (&self.display, self.results.last()) {
                display.show(running.job.frame.id(), &read(last));
            }
            slots.current = slots.next.take().map(Running::new);
        }
    }

    /// Spawns the shards of the running stage. Returns the number of pool jobs spawned.
    fn spawn_stage(self: &Arc<Self>, running: &Running) -> usize {
        let index = running.stage;
        let shards = self.stages[index].shards.len();
        if shards == 0 {
            return 0;
        }
        if index > 0 {
            write(&self.results[index]).clone_from(&read(&self.results[index - 1]));
        }

        let workers = self.budget.get().clamp(1, shards);
        for worker in 0..workers {
            let inner = Arc::clone(self);
            let job = Arc::clone(&running.job);
            self.pool.spawn(move || {
                inner.run_shards(index, worker, workers, &job);
                // Release before the slot can be cleared.
                drop(job);
                inner.finish_shard();
            });
        }
        workers
    }

    fn run_shards(&self, index: usize, worker: usize, workers: usize, job: &StageJob) {
        let stage = &self.stages[index];
        let upstream = (index > 0).then(|| read(&self.results[index - 1]));
        let input = StageInput {
            frame: &job.frame,
            readout: &job.readout,
            base: job.base.as_deref(),
            upstream: upstream.as_deref().unwrap_or(&self.empty),
        };
        let output = StageOutput::new(&self.results[index]);

        for shard in stage.shards.iter().skip(worker).step_by(workers) {
            if catch_unwind(AssertUnwindSafe(|| shard(&input, &output))).is_err() {
                log::error!(
                    "stage '{}' panicked on frame {}",
                    stage.name,
                    job.frame.id()
                );
            }
        }
    }

    fn finish_shard(self: &Arc<Self>) {
        let mut slots = self.lock_slots();
        let Some(running) = slots.current.as_mut() else {
            return;
        };
        running.active = running.active.saturating_sub(1);
        if running.active > 0 {
            return;
        }
        running.stage += 1;
        self.advance(&mut slots);
    }
}

fn read(lock: &RwLock<RgbImage>) -> RwLockReadGuard<'_, RgbImage> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &RwLock<RgbImage>) -> RwLockWriteGuard<'_, RgbImage> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readout::message_pool;
    use image::Rgb;
    use rayon::ThreadPoolBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, SystemTime};

    struct RecordingDisplay {
        shown: Mutex<mpsc::Sender<(u64, RgbImage)>>,
    }

    impl DisplaySink for RecordingDisplay {
        fn show(&self, frame_id: u64, image: &RgbImage) {
            let _ = self.shown.lock().unwrap().send((frame_id, image.clone()));
        }
    }

    fn worker_pool(threads: usize) -> Arc<ThreadPool> {
        Arc::new(ThreadPoolBuilder::new().num_threads(threads).build().unwrap())
    }

    fn executor_with(
        stages: Vec<StageSet>,
        budget: usize,
    ) -> (StageExecutor, mpsc::Receiver<(u64, RgbImage)>) {
        let (tx, rx) = mpsc::channel();
        let display = Arc::new(RecordingDisplay {
            shown: Mutex::new(tx),
        });
        let executor = StageExecutor::new(
            stages,
            worker_pool(4),
            Arc::new(WorkerBudget::new(budget)),
            Some(display),
        );
        (executor, rx)
    }

    fn job(pool: &crate::pool::Pool<ReadoutMessage>, id: u64) -> StageJob {
        let frame = Frame::new(id, id, SystemTime::now(), GrayImage::new(8, 8)).into_ptr();
        let mut readout = pool.get().unwrap();
        readout.prepare(&frame, "test");
        StageJob {
            frame,
            readout,
            base: None,
        }
    }

    #[test]
    fn second_frame_waits_third_overflows() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let gate = StageSet::single("gate", move |_input, output| {
            let _ = gate_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5));
            output.with(|image| *image = RgbImage::new(1, 1));
        });
        let (executor, shown) = executor_with(vec![gate], 2);
        let messages = message_pool(4);

        executor.start(job(&messages, 1)).unwrap();
        assert_eq!(
            executor.state(),
            ExecutorState::Running {
                frame_id: 1,
                stage: 0
            }
        );

        executor.start(job(&messages, 2)).unwrap();
        assert_eq!(
            executor.state(),
            ExecutorState::Pending {
                current: 1,
                next: 2
            }
        );

        assert_eq!(
            executor.start(job(&messages, 3)),
            Err(Overflow { frame_id: 3 })
        );
        assert_eq!(
            executor.state(),
            ExecutorState::Pending {
                current: 1,
                next: 2
            }
        );

        gate_tx.send(()).unwrap();
        let (first, _) = shown.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, 1);
        assert_eq!(
            executor.state(),
            ExecutorState::Running {
                frame_id: 2,
                stage: 0
            }
        );

        gate_tx.send(()).unwrap();
        let (second, _) = shown.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second, 2);

        executor.wait_idle();
        assert_eq!(executor.state(), ExecutorState::Idle);
        assert_eq!(messages.available(), 4);
    }

    #[test]
    fn every_shard_runs_once_under_reduced_budget() {
        let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..5).map(|_| AtomicUsize::new(0)).collect());
        let shards = (0..5)
            .map(|i| {
                let counters = counters.clone();
                Arc::new(move |_: &StageInput<'_>, _: &StageOutput<'_>| {
                    counters[i].fetch_add(1, Ordering::SeqCst);
                }) as ShardFn
            })
            .collect();
        let (executor, shown) = executor_with(vec![StageSet::new("count", shards)], 3);
        let messages = message_pool(1);

        executor.start(job(&messages, 7)).unwrap();
        let (frame_id, _) = shown.recv_timeout(Duration::from_secs(5)).unwrap();
        executor.wait_idle();

        assert_eq!(frame_id, 7);
        for counter in counters.iter() {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn later_stages_start_from_upstream_result() {
        let paint = StageSet::single("paint", |_input, output| {
            output.with(|image| *image = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])));
        });
        let mark = StageSet::single("mark", |input, output| {
            assert_eq!(input.upstream.dimensions(), (2, 2));
            output.with(|image| image.put_pixel(0, 0, Rgb([255, 255, 255])));
        });
        let (executor, shown) = executor_with(vec![paint, mark], 2);
        let messages = message_pool(1);

        executor.start(job(&messages, 1)).unwrap();
        let (_, image) = shown.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(image.get_pixel(1, 1), &Rgb([10, 20, 30]));
        assert_eq!(executor.stage_names(), vec!["paint", "mark"]);
    }

    #[test]
    fn panicking_shard_does_not_wedge_the_chain() {
        let boom = StageSet::single("boom", |_input, _output| panic!("shard failure"));
        let (executor, shown) = executor_with(vec![boom], 1);
        let messages = message_pool(2);

        executor.start(job(&messages, 1)).unwrap();
        assert_eq!(shown.recv_timeout(Duration::from_secs(5)).unwrap().0, 1);
        executor.start(job(&messages, 2)).unwrap();
        assert_eq!(shown.recv_timeout(Duration::from_secs(5)).unwrap().0, 2);
        executor.wait_idle();
    }
}
