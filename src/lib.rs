//! tagwatch: camera frame ingestion and stage scheduling for fiducial tag tracking.
//!
//! A capture thread feeds frames into a bounded queue. A single controller
//! thread drains it, keeping latency bounded under load: every frame takes
//! a cheap mandatory path (downscale, video output), and a frame that has
//! others waiting behind it is shed with a `PROCESS_OVERFLOW` readout
//! instead of being processed late.
//!
//! # Architecture
//!
//! 1. **Bounded queues everywhere**: producers never block; a full queue
//!    rejects the newest item.
//! 2. **Pre-sized pools**: steady-state processing does not allocate image
//!    buffers or readout messages.
//! 3. **One worker budget**: detection, cataloguing and stage shards share
//!    a worker pool whose active budget shrinks by one core while a
//!    full-frame export runs.
//! 4. **Double-buffered stage chains**: at most one chain runs and one frame
//!    waits; anything more is an overflow.
//!
//! # Module Structure
//!
//! - `queue`, `pool`, `budget`: concurrency primitives
//! - `frame`, `readout`: data model
//! - `controller`: the frame loop and its producer handle
//! - `stage`: post-processing chains (resize, overlay)
//! - `catalog`, `export`, `storage`: image side channels
//! - `detect`, `transport`, `video`, `display`, `ingest`: collaborators

pub mod budget;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod detect;
pub mod display;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod pool;
pub mod queue;
pub mod readout;
pub mod stage;
pub mod storage;
pub mod transport;
pub mod video;

pub use budget::WorkerBudget;
pub use catalog::{Catalog, ExportWindow, NewTagDescription};
pub use config::TagwatchConfig;
pub use controller::{
    BacklogPolicy, Collaborators, Pipeline, PipelineHandle, PipelineOptions, PipelineStats,
    StatsSnapshot,
};
pub use detect::{StubBackend, TagDetector};
pub use display::{DisplaySink, LatestFrameDisplay};
pub use export::FullFrameExport;
pub use frame::{Frame, FramePtr};
pub use ingest::{open_source, spawn_capture, FrameSource, SourceConfig};
pub use pool::{Pool, PoolExhausted, Pooled};
pub use queue::{PushError, RingQueue};
pub use readout::{ReadoutError, ReadoutMessage, TagReadout};
pub use stage::{
    overlay_stage, resize_stage, ExecutorState, Highlights, IdLabels, Overflow, StageExecutor,
    StageJob, StageSet,
};
pub use storage::{FilesystemImageStore, ImageStore, InMemoryImageStore};
pub use transport::{QueuedSink, ReadoutSink};
pub use video::{RawVideoOutput, VideoSink};
