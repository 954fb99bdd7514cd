//! Low-latency video output.
//!
//! The controller's mandatory path converts every frame to a pooled RGB
//! buffer and hands it to a `VideoSink`. The sink owns its own bounded queue;
//! when the encoder falls behind, frames are dropped there and their buffers
//! go straight back to the pool.

use anyhow::{Context, Result};
use image::RgbImage;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::SystemTime;

use crate::pool::Pooled;
use crate::queue::{PushError, RingQueue};

/// Default depth of the video output queue.
pub const VIDEO_QUEUE_CAPACITY: usize = 4;

/// Consumer of downscaled color frames.
pub trait VideoSink: Send + Sync {
    fn enqueue(&self, frame: Pooled<RgbImage>, time: SystemTime, frame_id: u64);

    /// Most frames the sink queues before dropping. One more may be in the writer.
    fn queue_capacity(&self) -> usize {
        0
    }

    fn close(&self) {}
}

struct VideoFrame {
    image: Pooled<RgbImage>,
    frame_id: u64,
}

/// Writes raw RGB24 frames to a byte stream (stdout for an external encoder).
pub struct RawVideoOutput {
    queue: Arc<RingQueue<VideoFrame>>,
    dropped: AtomicU64,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RawVideoOutput {
    pub fn new<W: Write + Send + 'static>(writer: W, capacity: usize) -> Result<Self> {
        let queue = Arc::new(RingQueue::<VideoFrame>::new(capacity));
        let handle = {
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("tagwatch-video".into())
                .spawn(move || write_loop(queue, writer))
                .context("spawn video output thread")?
        };
        Ok(Self {
            queue,
            dropped: AtomicU64::new(0),
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn stdout(capacity: usize) -> Result<Self> {
        Self::new(std::io::stdout(), capacity)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn write_loop<W: Write>(queue: Arc<RingQueue<VideoFrame>>, mut writer: W) {
    while let Some(frame) = queue.pop() {
        if let Err(e) = writer.write_all(frame.image.as_raw()) {
            log::error!("video output failed at frame {}: {}", frame.frame_id, e);
            queue.close();
            return;
        }
    }
    if let Err(e) = writer.flush() {
        log::warn!("video output flush failed: {}", e);
    }
}

impl VideoSink for RawVideoOutput {
    fn enqueue(&self, image: Pooled<RgbImage>, _time: SystemTime, frame_id: u64) {
        match self.queue.push(VideoFrame { image, frame_id }) {
            Ok(()) => {}
            Err(PushError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("video queue full, frame {} dropped", frame_id);
            }
            Err(PushError::Closed(_)) => {}
        }
    }

    fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    fn close(&self) {
        self.queue.close();
        let handle = self.writer.lock().ok().and_then(|mut writer| writer.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("video output thread panicked");
            }
        }
    }
}

impl Drop for RawVideoOutput {
    fn drop(&mut self) {
        self.close();
    }
}
