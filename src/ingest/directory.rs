use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Replays a sorted sequence of images from a local directory.
///
/// All images must share the resolution of the first one.
pub struct DirectorySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    limit: usize,
    resolution: (u32, u32),
}

impl DirectorySource {
    pub fn open(dir: impl AsRef<Path>, frames: Option<u64>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("read frame directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_image {
                files.push(path);
            }
        }
        files.sort();

        let first = files
            .first()
            .ok_or_else(|| anyhow!("no images in frame directory {}", dir.display()))?;
        let resolution = image::image_dimensions(first)
            .with_context(|| format!("read image header {}", first.display()))?;

        let limit = frames.map_or(files.len(), |n| files.len().min(n as usize));
        log::info!(
            "DirectorySource: {} image(s) of {}x{} in {}",
            limit,
            resolution.0,
            resolution.1,
            dir.display()
        );
        Ok(Self {
            dir,
            files,
            next: 0,
            limit,
            resolution,
        })
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.next >= self.limit {
            return Ok(None);
        }
        let path = &self.files[self.next];
        let image = image::open(path)
            .with_context(|| format!("decode frame {}", path.display()))?
            .to_luma8();
        if image.dimensions() != self.resolution {
            return Err(anyhow!(
                "frame {} is {}x{}, expected {}x{}",
                path.display(),
                image.width(),
                image.height(),
                self.resolution.0,
                self.resolution.1
            ));
        }
        let id = self.next as u64;
        self.next += 1;
        Ok(Some(Frame::new(id, id, SystemTime::now(), image)))
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.next as u64,
            url: self.dir.display().to_string(),
        }
    }
}
