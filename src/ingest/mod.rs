//! Frame ingestion sources.
//!
//! - Synthetic tag scene (`stub://name`), for tests and dry runs
//! - Image sequence from a local directory (`dir:///path` or a plain path)
//!
//! Sources produce grayscale `Frame`s with monotonically increasing ids.
//! `spawn_capture` paces a source into a `PipelineHandle` and closes the
//! pipeline's queue when the stream ends.

mod capture;
mod directory;
mod synthetic;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use capture::spawn_capture;
pub use directory::DirectorySource;
pub use synthetic::SyntheticSource;

/// Configuration for opening a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub url: String,
    pub fps: u32,
    /// Resolution of synthetic frames. Directory sources use their images' size.
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames.
    pub frames: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            fps: 8,
            width: 640,
            height: 480,
            frames: None,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn resolution(&self) -> (u32, u32);

    fn stats(&self) -> SourceStats;
}

/// Opens the source named by `config.url`.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let url = config.url.trim();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    if let Some(path) = url.strip_prefix("dir://") {
        return Ok(Box::new(DirectorySource::open(path, config.frames)?));
    }
    if !is_local_file_path(url) {
        return Err(anyhow!("unsupported frame source: {}", url));
    }
    Ok(Box::new(DirectorySource::open(url, config.frames)?))
}

fn is_local_file_path(path: &str) -> bool {
    !path.is_empty() && !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_synthetic_source_for_stub_urls() {
        let source = open_source(&SourceConfig {
            width: 32,
            height: 16,
            ..SourceConfig::default()
        })
        .unwrap();
        assert_eq!(source.resolution(), (32, 16));
    }

    #[test]
    fn rejects_remote_urls() {
        let err = open_source(&SourceConfig {
            url: "rtsp://10.0.0.1/stream".into(),
            ..SourceConfig::default()
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("unsupported"));
    }
}
