//! Per-frame detection readouts.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::frame::Frame;
use crate::pool::Pool;

/// Per-frame error code carried by a readout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadoutError {
    /// The frame was shed to bound latency.
    ProcessOverflow,
    DetectorFailure,
    ExportFailure,
}

/// One detected tag, in full-frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagReadout {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

/// Structured detection result for one frame.
///
/// Pooled: `clear` keeps the allocations so messages are reused across frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadoutMessage {
    pub frame_id: u64,
    pub timestamp: u64,
    pub time: SystemTime,
    pub producer_uuid: String,
    pub width: u32,
    pub height: u32,
    pub tags: Vec<TagReadout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReadoutError>,
}

impl Default for ReadoutMessage {
    fn default() -> Self {
        Self {
            frame_id: 0,
            timestamp: 0,
            time: SystemTime::UNIX_EPOCH,
            producer_uuid: String::new(),
            width: 0,
            height: 0,
            tags: Vec::new(),
            error: None,
        }
    }
}

impl ReadoutMessage {
    pub fn clear(&mut self) {
        self.frame_id = 0;
        self.timestamp = 0;
        self.time = SystemTime::UNIX_EPOCH;
        self.producer_uuid.clear();
        self.width = 0;
        self.height = 0;
        self.tags.clear();
        self.error = None;
    }

    /// Fills the frame header fields.
    pub fn prepare(&mut self, frame: &Frame, producer_uuid: &str) {
        self.frame_id = frame.id();
        self.timestamp = frame.timestamp();
        self.time = frame.time();
        self.producer_uuid.push_str(producer_uuid);
        self.width = frame.width();
        self.height = frame.height();
    }
}

/// Message pool whose checkouts come back cleared.
pub fn message_pool(count: usize) -> Pool<ReadoutMessage> {
    let pool = Pool::with_reset("readout", ReadoutMessage::clear);
    pool.reserve(count, || ReadoutMessage {
        tags: Vec::with_capacity(64),
        ..ReadoutMessage::default()
    });
    pool
}
