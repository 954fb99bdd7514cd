use anyhow::{Context, Result};
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::{ReadoutEndpoint, ReadoutSink};
use crate::queue::{PushError, RingQueue, READOUT_QUEUE_CAPACITY};
use crate::readout::ReadoutMessage;

/// Serializes readouts as JSON lines into a bounded queue drained by a writer thread.
///
/// A full queue drops the message: a slow consumer never stalls the controller.
pub struct QueuedSink {
    queue: Arc<RingQueue<Vec<u8>>>,
    dropped: AtomicU64,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedSink {
    pub fn new<W: Write + Send + 'static>(writer: W, capacity: usize) -> Result<Self> {
        let queue = Arc::new(RingQueue::<Vec<u8>>::new(capacity));
        let handle = {
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("tagwatch-readout".into())
                .spawn(move || write_loop(queue, writer))
                .context("spawn readout writer thread")?
        };
        Ok(Self {
            queue,
            dropped: AtomicU64::new(0),
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Connects to a TCP readout consumer.
    pub fn connect(endpoint: &ReadoutEndpoint) -> Result<Self> {
        let addr = endpoint.socket_addr_string();
        let stream =
            TcpStream::connect(&addr).with_context(|| format!("connect readout sink {}", addr))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        log::info!("readout sink connected to {}", addr);
        Self::new(stream, READOUT_QUEUE_CAPACITY)
    }

    /// Messages dropped because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn write_loop<W: Write>(queue: Arc<RingQueue<Vec<u8>>>, mut writer: W) {
    while let Some(bytes) = queue.pop() {
        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            log::error!("readout sink write failed, closing: {}", e);
            queue.close();
            return;
        }
    }
}

impl ReadoutSink for QueuedSink {
    fn publish(&self, message: &ReadoutMessage) {
        let mut bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("readout for frame {} not serializable: {}", message.frame_id, e);
                return;
            }
        };
        bytes.push(b'\n');
        match self.queue.push(bytes) {
            Ok(()) => {}
            Err(PushError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "readout queue full, dropped frame {} ({} dropped so far)",
                    message.frame_id,
                    dropped
                );
            }
            Err(PushError::Closed(_)) => {
                log::debug!("readout sink closed, frame {} not sent", message.frame_id);
            }
        }
    }

    fn close(&self) {
        self.queue.close();
        let handle = self.writer.lock().ok().and_then(|mut writer| writer.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("readout writer thread panicked");
            }
        }
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readout::ReadoutError;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_one_json_line_per_message() {
        let buffer = SharedBuffer::default();
        let sink = QueuedSink::new(buffer.clone(), 4).unwrap();

        for id in 1..=3 {
            let mut m = ReadoutMessage::default();
            m.frame_id = id;
            if id == 2 {
                m.error = Some(ReadoutError::ProcessOverflow);
            }
            sink.publish(&m);
        }
        sink.close();

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<ReadoutMessage> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].frame_id, 2);
        assert_eq!(lines[1].error, Some(ReadoutError::ProcessOverflow));
    }

    #[test]
    fn publish_after_close_is_ignored() {
        let sink = QueuedSink::new(SharedBuffer::default(), 1).unwrap();
        sink.close();
        sink.publish(&ReadoutMessage::default());
        assert_eq!(sink.dropped(), 0);
    }
}
