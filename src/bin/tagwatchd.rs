//! tagwatchd - tag tracking frame scheduler daemon
//!
//! This daemon:
//! 1. Captures frames from the configured source (synthetic or image directory)
//! 2. Schedules them through the pipeline controller, shedding frames under backlog
//! 3. Publishes per-frame readouts as JSON lines to a TCP consumer
//! 4. Catalogues new tags and exports periodic full frames to disk
//! 5. Optionally streams raw RGB video to stdout and renders an overlay display

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tagwatch::config::TagwatchConfig;
use tagwatch::transport::parse_readout_endpoint;
use tagwatch::video::VIDEO_QUEUE_CAPACITY;
use tagwatch::{
    open_source, overlay_stage, resize_stage, spawn_capture, Collaborators, DisplaySink,
    Highlights, IdLabels, LatestFrameDisplay, Pipeline, QueuedSink, RawVideoOutput, ReadoutSink,
    SourceConfig, StubBackend, TagDetector, VideoSink,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time tag tracking frame scheduler")]
struct Args {
    /// Frame source: stub://name, dir:///path or a local directory.
    #[arg(long)]
    source: Option<String>,

    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Readout consumer address (tcp://host:port or host:port).
    #[arg(long)]
    readout_addr: Option<String>,

    /// Directory for catalogued tags and full-frame exports.
    #[arg(long)]
    new_tag_dir: Option<PathBuf>,

    /// Worker pool size (0 = all cores).
    #[arg(long)]
    max_workers: Option<usize>,

    /// Stream raw RGB24 video to stdout.
    #[arg(long)]
    video_stdout: bool,

    /// Render the overlay display.
    #[arg(long)]
    display: bool,

    /// Draw tag ids on the overlay.
    #[arg(long)]
    draw_ids: bool,

    /// Run without a tag detector.
    #[arg(long)]
    no_detect: bool,
}

impl Args {
    fn apply(&self, cfg: &mut TagwatchConfig) {
        if let Some(source) = &self.source {
            cfg.source.url = source.clone();
        }
        if let Some(addr) = &self.readout_addr {
            cfg.readout_addr = Some(addr.clone());
        }
        if let Some(dir) = &self.new_tag_dir {
            cfg.process.new_tag_output_dir = Some(dir.clone());
        }
        if let Some(workers) = self.max_workers {
            cfg.process.max_workers = workers;
        }
        cfg.video.stdout |= self.video_stdout;
        cfg.display.enabled |= self.display;
        cfg.display.draw_ids |= self.draw_ids;
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = TagwatchConfig::load()?;
    args.apply(&mut cfg);

    let source = open_source(&SourceConfig {
        url: cfg.source.url.clone(),
        fps: cfg.source.fps,
        width: cfg.source.width,
        height: cfg.source.height,
        frames: args.frames,
    })?;
    let resolution = source.resolution();

    let mut collaborators = Collaborators::default();
    if !args.no_detect {
        collaborators.detector = Some(Box::new(StubBackend::default()) as Box<dyn TagDetector>);
    }
    if let Some(addr) = &cfg.readout_addr {
        let endpoint = parse_readout_endpoint(addr)?;
        collaborators.readout_sink =
            Some(Arc::new(QueuedSink::connect(&endpoint)?) as Arc<dyn ReadoutSink>);
    }
    if cfg.video.stdout {
        collaborators.video =
            Some(Arc::new(RawVideoOutput::stdout(VIDEO_QUEUE_CAPACITY)?) as Arc<dyn VideoSink>);
    }
    let display = cfg.display.enabled.then(|| Arc::new(LatestFrameDisplay::new()));
    if let Some(display) = &display {
        let highlights = Highlights::new(cfg.display.highlighted.iter().copied());
        collaborators.stages = vec![
            resize_stage(cfg.video.height, cfg.video.force_integer_scaling),
            overlay_stage(
                cfg.display.overlay_shards,
                highlights,
                IdLabels::new(cfg.display.draw_ids),
            ),
        ];
        collaborators.display = Some(display.clone() as Arc<dyn DisplaySink>);
    }

    let pipeline = Pipeline::new(cfg.pipeline_options(), collaborators, resolution)?;
    let handle = pipeline.handle();

    {
        let handle = handle.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received, draining frame queue...");
            handle.close();
        })
        .context("set Ctrl-C handler")?;
    }

    log::info!(
        "tagwatchd running: source={} {}x{} @ {} fps, readout={}, new tags={}",
        cfg.source.url,
        resolution.0,
        resolution.1,
        cfg.source.fps,
        cfg.readout_addr.as_deref().unwrap_or("none"),
        cfg.process
            .new_tag_output_dir
            .as_ref()
            .map_or_else(|| "disabled".to_string(), |dir| dir.display().to_string())
    );

    let capture = spawn_capture(source, handle.clone(), cfg.source.fps)?;
    let result = pipeline.run();

    match capture.join() {
        Ok(Ok(frames)) => log::info!("capture finished after {} frame(s)", frames),
        Ok(Err(e)) => log::error!("capture failed: {:#}", e),
        Err(_) => log::error!("capture thread panicked"),
    }
    if let Some(display) = &display {
        if let Some(id) = display.latest_id() {
            log::info!("last displayed frame: {}", id);
        }
    }
    let stats = handle.stats();
    log::info!(
        "final stats: {}",
        serde_json::to_string(&stats).unwrap_or_default()
    );
    result
}
