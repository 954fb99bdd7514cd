use anyhow::{anyhow, Context, Result};
use image::{GrayImage, ImageFormat};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistent image storage used by the export side channels.
///
/// Called concurrently from the cataloguing fan-out and the full-frame
/// export thread, hence `&self` and `Send + Sync`.
pub trait ImageStore: Send + Sync {
    fn write_image(&self, path: &Path, image: &GrayImage) -> Result<()>;
}

/// Path of a catalogued tag ROI.
pub fn tag_roi_path(dir: &Path, tag_id: u32, frame_id: u64) -> PathBuf {
    dir.join(format!("ant_{}_{}.png", tag_id, frame_id))
}

/// Path of an exported full frame.
pub fn full_frame_path(dir: &Path, frame_id: u64) -> PathBuf {
    dir.join(format!("frame_{}.png", frame_id))
}

/// Writes PNG files under a root directory.
pub struct FilesystemImageStore {
    root: PathBuf,
}

impl FilesystemImageStore {
    /// Opens the store, creating `root` if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create image output dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageStore for FilesystemImageStore {
    fn write_image(&self, path: &Path, image: &GrayImage) -> Result<()> {
        if !path.starts_with(&self.root) {
            return Err(anyhow!(
                "refusing to write {} outside {}",
                path.display(),
                self.root.display()
            ));
        }
        image
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("write {}", path.display()))
    }
}

/// Keeps written images in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryImageStore {
    images: Mutex<HashMap<PathBuf, GrayImage>>,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images.lock().map(|images| images.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, path: &Path) -> Option<GrayImage> {
        self.images.lock().ok()?.get(path).cloned()
    }

    /// Stored paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self
            .images
            .lock()
            .map(|images| images.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

impl ImageStore for InMemoryImageStore {
    fn write_image(&self, path: &Path, image: &GrayImage) -> Result<()> {
        let mut images = self
            .images
            .lock()
            .map_err(|_| anyhow!("image store lock poisoned"))?;
        images.insert(path.to_path_buf(), image.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn roi_paths_follow_naming_convention() {
        let dir = Path::new("/data/out");
        assert_eq!(
            tag_roi_path(dir, 12, 3400),
            PathBuf::from("/data/out/ant_12_3400.png")
        );
        assert_eq!(
            full_frame_path(dir, 7),
            PathBuf::from("/data/out/frame_7.png")
        );
    }

    #[test]
    fn filesystem_store_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemImageStore::open(dir.path().join("nested")).unwrap();
        let path = tag_roi_path(store.root(), 1, 2);

        store
            .write_image(&path, &GrayImage::from_pixel(3, 3, Luma([200])))
            .unwrap();

        let read = image::open(&path).unwrap().to_luma8();
        assert_eq!(read.dimensions(), (3, 3));
        assert_eq!(read.get_pixel(1, 1), &Luma([200]));
    }

    #[test]
    fn filesystem_store_rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemImageStore::open(dir.path()).unwrap();
        let err = store
            .write_image(Path::new("/tmp/elsewhere.png"), &GrayImage::new(1, 1))
            .unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }

    #[test]
    fn in_memory_store_records_writes() {
        let store = InMemoryImageStore::new();
        let path = PathBuf::from("out/ant_1_1.png");
        store.write_image(&path, &GrayImage::new(2, 2)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&path).unwrap().dimensions(), (2, 2));
        assert_eq!(store.paths(), vec![path]);
    }
}
