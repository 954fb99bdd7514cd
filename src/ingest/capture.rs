use anyhow::{Context, Result};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::controller::PipelineHandle;

/// Pushes frames from `source` into the pipeline at `fps`.
///
/// The pipeline queue is closed when the source ends or fails, and the
/// capture stops early when someone else closes it. The thread returns the
/// number of frames read.
pub fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    handle: PipelineHandle,
    fps: u32,
) -> Result<JoinHandle<Result<u64>>> {
    let interval = Duration::from_secs(1) / fps.max(1);
    std::thread::Builder::new()
        .name("tagwatch-capture".into())
        .spawn(move || {
            let result = capture_loop(source.as_mut(), &handle, interval);
            handle.close();
            let stats = source.stats();
            match &result {
                Ok(_) => log::info!(
                    "capture from {} ended after {} frame(s)",
                    stats.url,
                    stats.frames_captured
                ),
                Err(e) => log::error!("capture from {} failed: {:#}", stats.url, e),
            }
            result
        })
        .context("spawn capture thread")
}

fn capture_loop(
    source: &mut dyn FrameSource,
    handle: &PipelineHandle,
    interval: Duration,
) -> Result<u64> {
    let mut count = 0u64;
    let mut deadline = Instant::now();
    while !handle.is_closed() {
        let Some(frame) = source.next_frame()? else {
            break;
        };
        count += 1;
        handle.queue_frame(frame.into_ptr());

        deadline += interval;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        } else {
            deadline = now;
        }
    }
    Ok(count)
}
