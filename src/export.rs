use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::frame::FramePtr;
use crate::queue::RingQueue;
use crate::storage::{full_frame_path, ImageStore};

/// Writes occasional full-resolution frames on a background thread.
///
/// Holds at most one frame: a request made while the previous export is
/// still queued or being written is refused.
pub struct FullFrameExport {
    queue: Arc<RingQueue<FramePtr>>,
    busy: Arc<AtomicBool>,
    exported: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FullFrameExport {
    pub fn new(dir: impl Into<PathBuf>, store: Arc<dyn ImageStore>) -> Result<Self> {
        let dir = dir.into();
        let queue = Arc::new(RingQueue::<FramePtr>::new(1));
        let busy = Arc::new(AtomicBool::new(false));
        let exported = Arc::new(AtomicU64::new(0));
        let handle = {
            let (queue, busy, exported) = (queue.clone(), busy.clone(), exported.clone());
            std::thread::Builder::new()
                .name("tagwatch-frame-export".into())
                .spawn(move || {
                    while let Some(frame) = queue.pop() {
                        let path = full_frame_path(&dir, frame.id());
                        match store.write_image(&path, frame.image()) {
                            Ok(()) => {
                                exported.fetch_add(1, Ordering::Relaxed);
                                log::info!("exported full frame {} to {}", frame.id(), path.display());
                            }
                            Err(e) => log::warn!("full frame export failed: {:#}", e),
                        }
                        drop(frame);
                        busy.store(false, Ordering::Release);
                    }
                })
                .context("spawn full frame export thread")?
        };
        Ok(Self {
            queue,
            busy,
            exported,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queues `frame` for export. False when an export is in progress or the task is closed.
    pub fn queue_export(&self, frame: FramePtr) -> bool {
        if self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.queue.push(frame).is_err() {
            self.busy.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn is_free(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }

    /// Frames written so far.
    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    /// Finishes the pending export, if any, and joins the worker.
    pub fn close(&self) {
        self.queue.close();
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("full frame export thread panicked");
            }
        }
    }
}

impl Drop for FullFrameExport {
    fn drop(&mut self) {
        self.close();
    }
}
