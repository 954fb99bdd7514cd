//! Readout transport.
//!
//! The network sink is fire-and-forget from the controller's point of view:
//! `publish` never blocks on the network. `QueuedSink` serializes readouts
//! into a small bounded queue drained by a writer thread.

mod endpoint;
mod queued;

use crate::readout::ReadoutMessage;

pub use endpoint::{parse_readout_endpoint, ReadoutEndpoint};
pub use queued::QueuedSink;

/// Destination of per-frame readouts.
pub trait ReadoutSink: Send + Sync {
    /// Best-effort publish. Must not block on I/O.
    fn publish(&self, message: &ReadoutMessage);

    /// Flushes and stops background work. Called once at teardown.
    fn close(&self) {}
}
