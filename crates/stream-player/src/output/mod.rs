//! Output device abstraction.
//!
//! A device accepts a fixed set of [`HardwareBuffer`]s, plays them in enqueue
//! order, and hands each one back through a [`BufferNotifier`] once consumed.
//!
//! Contract for implementations:
//! - exactly one notification per enqueued buffer, unless the device is stopped
//!   or reset first (held buffers are then dropped without notification)
//! - notifications may arrive on any thread but never synchronously from inside
//!   `enqueue`, `stop` or `reset`
//! - the format passed to [`OutputBackend::configure`] is fixed for the device's lifetime

use std::sync::Weak;

use stream_player_types::OutputStatus;

use crate::error::Result;
use crate::format::StreamFormat;

pub mod buffer;
pub mod cpal_backend;

pub use buffer::{BufferOwner, BufferPool, BufferSlot, HardwareBuffer};
pub use cpal_backend::{CpalBackend, CpalConfig, CpalDevice};

/// Receiver of consumed buffers, implemented by the players.
pub trait BufferSink: Send + Sync {
    /// Called once per consumed buffer. `generation` identifies the session the
    /// buffer was enqueued in; stale generations must be ignored.
    fn buffer_consumed(&self, generation: u64, buffer: HardwareBuffer);
}

/// Handle a device uses to return consumed buffers.
///
/// Holds only a weak reference to its sink, so a device that outlives its player
/// notifies into nothing.
#[derive(Clone)]
pub struct BufferNotifier {
    sink: Weak<dyn BufferSink>,
    generation: u64,
}

impl BufferNotifier {
    pub fn new(sink: Weak<dyn BufferSink>, generation: u64) -> Self {
        Self { sink, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Return `buffer` to the player. Never blocks on the device.
    pub fn buffer_consumed(&self, buffer: HardwareBuffer) {
        match self.sink.upgrade() {
            Some(sink) => sink.buffer_consumed(self.generation, buffer),
            None => tracing::trace!(
                slot = buffer.slot().index(),
                generation = self.generation,
                "buffer consumed after player dropped"
            ),
        }
    }
}

impl std::fmt::Debug for BufferNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferNotifier")
            .field("generation", &self.generation)
            .field("alive", &(self.sink.strong_count() > 0))
            .finish()
    }
}

/// Factory for output devices bound to one stream format.
pub trait OutputBackend: Send + Sync {
    type Device: OutputDevice;

    /// Create a device for `format`. Fails with `DeviceConfig` when the format
    /// cannot be realised.
    fn configure(&self, format: &StreamFormat, notifier: BufferNotifier) -> Result<Self::Device>;
}

/// One configured output device.
pub trait OutputDevice: Send {
    /// Allocate the buffer for `slot`.
    fn allocate_buffer(&mut self, slot: BufferSlot, capacity: usize) -> Result<HardwareBuffer> {
        HardwareBuffer::try_new(slot, capacity)
    }

    /// Hand `buffer` to the device; played after every previously enqueued buffer.
    fn enqueue(&mut self, buffer: HardwareBuffer) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Halt playback immediately.
    fn stop(&mut self) -> Result<()>;

    /// Drop every held buffer without notification.
    fn reset(&mut self) -> Result<()>;

    /// Render-side counters, for devices that keep them.
    fn status(&self) -> Option<OutputStatus> {
        None
    }
}
