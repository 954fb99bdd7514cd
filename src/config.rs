use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::controller::{BacklogPolicy, PipelineOptions};
use crate::queue::FRAME_QUEUE_CAPACITY;
use crate::transport::parse_readout_endpoint;

const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_SOURCE_FPS: u32 = 8;
const DEFAULT_SOURCE_WIDTH: u32 = 1920;
const DEFAULT_SOURCE_HEIGHT: u32 = 1080;
const DEFAULT_VIDEO_HEIGHT: u32 = 1080;
const DEFAULT_OVERLAY_SHARDS: usize = 4;
const DEFAULT_ROI_SIZE: u32 = 500;
const DEFAULT_RENEW_PERIOD_SECS: u64 = 2 * 60 * 60;
const DEFAULT_FIRST_FULL_FRAME_DELAY_SECS: u64 = 2 * 60;
const DEFAULT_BACKLOG_THRESHOLD: usize = 1;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TagwatchConfigFile {
    source: Option<SourceConfigFile>,
    readout: Option<ReadoutConfigFile>,
    video: Option<VideoConfigFile>,
    display: Option<DisplayConfigFile>,
    process: Option<ProcessConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ReadoutConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    stdout: Option<bool>,
    height: Option<u32>,
    force_integer_scaling: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    enabled: Option<bool>,
    draw_ids: Option<bool>,
    highlighted: Option<Vec<u32>>,
    overlay_shards: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessConfigFile {
    uuid: Option<String>,
    frame_stride: Option<u64>,
    frame_ids: Option<Vec<u64>>,
    new_tag_output_dir: Option<PathBuf>,
    new_tag_roi_size: Option<u32>,
    image_renew_period_secs: Option<u64>,
    first_full_frame_delay_secs: Option<u64>,
    frame_queue_capacity: Option<usize>,
    max_workers: Option<usize>,
    /// 0 disables backlog dropping.
    backlog_threshold: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TagwatchConfig {
    pub source: SourceSettings,
    pub readout_addr: Option<String>,
    pub video: VideoSettings,
    pub display: DisplaySettings,
    pub process: ProcessSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub stdout: bool,
    pub height: u32,
    pub force_integer_scaling: bool,
}

#[derive(Debug, Clone)]
pub struct DisplaySettings {
    pub enabled: bool,
    pub draw_ids: bool,
    pub highlighted: Vec<u32>,
    pub overlay_shards: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub uuid: String,
    pub frame_stride: u64,
    pub frame_ids: Vec<u64>,
    pub new_tag_output_dir: Option<PathBuf>,
    pub new_tag_roi_size: u32,
    pub image_renew_period: Duration,
    pub first_full_frame_delay: Duration,
    pub frame_queue_capacity: usize,
    pub max_workers: usize,
    pub backlog_threshold: usize,
}

impl TagwatchConfig {
    /// Loads `TAGWATCH_CONFIG` (if set), then applies `TAGWATCH_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TAGWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TagwatchConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let video = file.video.unwrap_or_default();
        let display = file.display.unwrap_or_default();
        let process = file.process.unwrap_or_default();

        Self {
            source: SourceSettings {
                url: source
                    .url
                    .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                fps: source.fps.unwrap_or(DEFAULT_SOURCE_FPS),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            },
            readout_addr: file.readout.and_then(|readout| readout.addr),
            video: VideoSettings {
                stdout: video.stdout.unwrap_or(false),
                height: video.height.unwrap_or(DEFAULT_VIDEO_HEIGHT),
                force_integer_scaling: video.force_integer_scaling.unwrap_or(false),
            },
            display: DisplaySettings {
                enabled: display.enabled.unwrap_or(false),
                draw_ids: display.draw_ids.unwrap_or(false),
                highlighted: display.highlighted.unwrap_or_default(),
                overlay_shards: display.overlay_shards.unwrap_or(DEFAULT_OVERLAY_SHARDS),
            },
            process: ProcessSettings {
                uuid: process.uuid.unwrap_or_default(),
                frame_stride: process.frame_stride.unwrap_or(1),
                frame_ids: process.frame_ids.unwrap_or_default(),
                new_tag_output_dir: process.new_tag_output_dir,
                new_tag_roi_size: process.new_tag_roi_size.unwrap_or(DEFAULT_ROI_SIZE),
                image_renew_period: Duration::from_secs(
                    process
                        .image_renew_period_secs
                        .unwrap_or(DEFAULT_RENEW_PERIOD_SECS),
                ),
                first_full_frame_delay: Duration::from_secs(
                    process
                        .first_full_frame_delay_secs
                        .unwrap_or(DEFAULT_FIRST_FULL_FRAME_DELAY_SECS),
                ),
                frame_queue_capacity: process
                    .frame_queue_capacity
                    .unwrap_or(FRAME_QUEUE_CAPACITY),
                max_workers: process.max_workers.unwrap_or(0),
                backlog_threshold: process
                    .backlog_threshold
                    .unwrap_or(DEFAULT_BACKLOG_THRESHOLD),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("TAGWATCH_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(fps) = env_parse("TAGWATCH_SOURCE_FPS")? {
            self.source.fps = fps;
        }
        if let Some(addr) = env_string("TAGWATCH_READOUT_ADDR") {
            self.readout_addr = Some(addr);
        }
        if let Some(stdout) = env_bool("TAGWATCH_VIDEO_STDOUT")? {
            self.video.stdout = stdout;
        }
        if let Some(height) = env_parse("TAGWATCH_VIDEO_HEIGHT")? {
            self.video.height = height;
        }
        if let Some(enabled) = env_bool("TAGWATCH_DISPLAY")? {
            self.display.enabled = enabled;
        }
        if let Some(ids) = env_string("TAGWATCH_HIGHLIGHTED") {
            self.display.highlighted = parse_csv(&ids, "TAGWATCH_HIGHLIGHTED")?;
        }
        if let Some(uuid) = env_string("TAGWATCH_UUID") {
            self.process.uuid = uuid;
        }
        if let Some(stride) = env_parse("TAGWATCH_FRAME_STRIDE")? {
            self.process.frame_stride = stride;
        }
        if let Some(ids) = env_string("TAGWATCH_FRAME_IDS") {
            self.process.frame_ids = parse_csv(&ids, "TAGWATCH_FRAME_IDS")?;
        }
        if let Some(dir) = env_string("TAGWATCH_NEW_TAG_DIR") {
            self.process.new_tag_output_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env_parse("TAGWATCH_RENEW_PERIOD_SECS")? {
            self.process.image_renew_period = Duration::from_secs(secs);
        }
        if let Some(workers) = env_parse("TAGWATCH_MAX_WORKERS")? {
            self.process.max_workers = workers;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.source.fps == 0 {
            return Err(anyhow!("source fps must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source resolution must be non-zero"));
        }
        if let Some(addr) = &self.readout_addr {
            parse_readout_endpoint(addr)?;
        }
        if self.video.height == 0 {
            return Err(anyhow!("video height must be greater than zero"));
        }
        if self.display.overlay_shards == 0 {
            return Err(anyhow!("overlay_shards must be greater than zero"));
        }

        let process = &mut self.process;
        if process.frame_stride > 1 {
            if process.frame_ids.is_empty() {
                return Err(anyhow!("frame_ids must be set when frame_stride > 1"));
            }
            if let Some(id) = process.frame_ids.iter().find(|&&id| id >= process.frame_stride) {
                return Err(anyhow!(
                    "frame id {} out of range for frame_stride {}",
                    id,
                    process.frame_stride
                ));
            }
        }
        process.frame_ids.sort_unstable();
        process.frame_ids.dedup();

        if process.new_tag_roi_size == 0 {
            return Err(anyhow!("new_tag_roi_size must be greater than zero"));
        }
        if process.image_renew_period.is_zero() {
            return Err(anyhow!("image renew period must be greater than zero"));
        }
        if process.frame_queue_capacity == 0 {
            return Err(anyhow!("frame_queue_capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        let process = &self.process;
        PipelineOptions {
            producer_uuid: process.uuid.clone(),
            frame_stride: process.frame_stride,
            frame_ids: process.frame_ids.iter().copied().collect::<HashSet<_>>(),
            new_tag_output_dir: process.new_tag_output_dir.clone(),
            new_tag_roi_size: process.new_tag_roi_size,
            image_renew_period: process.image_renew_period,
            first_full_frame_delay: process.first_full_frame_delay,
            frame_queue_capacity: process.frame_queue_capacity,
            max_workers: process.max_workers,
            backlog: match process.backlog_threshold {
                0 => BacklogPolicy::NeverDrop,
                threshold => BacklogPolicy::DropWhenQueued { threshold },
            },
            working_height: self.video.height,
            force_integer_scaling: self.video.force_integer_scaling,
        }
    }
}

fn read_config_file(path: &Path) -> Result<TagwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {}", name, value)),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_string(name).as_deref().map(str::trim) {
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => Err(anyhow!("{} must be a boolean, got {}", name, other)),
        None => Ok(None),
    }
}

fn parse_csv<T: FromStr>(value: &str, name: &str) -> Result<Vec<T>> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse()
                .map_err(|_| anyhow!("{} has an invalid entry: {}", name, entry))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut cfg = TagwatchConfig::from_file(TagwatchConfigFile::default());
        cfg.validate().unwrap();
        assert_eq!(cfg.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(cfg.process.frame_queue_capacity, FRAME_QUEUE_CAPACITY);
        assert_eq!(
            cfg.pipeline_options().backlog,
            BacklogPolicy::DropWhenQueued { threshold: 1 }
        );
    }

    #[test]
    fn zero_backlog_threshold_never_drops() {
        let mut cfg = TagwatchConfig::from_file(TagwatchConfigFile::default());
        cfg.process.backlog_threshold = 0;
        assert_eq!(cfg.pipeline_options().backlog, BacklogPolicy::NeverDrop);
    }

    #[test]
    fn stride_requires_ids_in_range() {
        let mut cfg = TagwatchConfig::from_file(TagwatchConfigFile::default());
        cfg.process.frame_stride = 4;
        assert!(cfg.validate().is_err());

        cfg.process.frame_ids = vec![5];
        assert!(cfg.validate().is_err());

        cfg.process.frame_ids = vec![3, 1, 3];
        cfg.validate().unwrap();
        assert_eq!(cfg.process.frame_ids, vec![1, 3]);
    }

    #[test]
    fn csv_parsing_reports_bad_entries() {
        assert_eq!(parse_csv::<u32>(" 1, 2,,3 ", "X").unwrap(), vec![1, 2, 3]);
        assert!(parse_csv::<u32>("1,two", "X").is_err());
    }
}
