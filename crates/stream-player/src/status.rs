use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use stream_player_types::OutputStatus;

/// Counters shared between a CPAL device handle, its worker, and the output callback.
#[derive(Debug, Default)]
pub struct OutputCounters {
    /// When set the callback outputs silence and does not drain the queue.
    pub paused: AtomicBool,
    /// Source frames rendered by the callback.
    pub played_frames: AtomicU64,
    /// Frames of silence emitted because the queue was empty.
    pub underrun_frames: AtomicU64,
    /// Callback invocations that ran out of queued audio.
    pub underrun_events: AtomicU64,
}

/// Static description of an opened output stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputInfo {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: Option<String>,
}

impl OutputCounters {
    /// Counters start paused so nothing drains before `start`.
    pub fn new_paused() -> Self {
        Self {
            paused: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn played_frames(&self) -> u64 {
        self.played_frames.load(Ordering::Relaxed)
    }

    /// Snapshot for status reporting.
    pub fn snapshot(&self, info: &OutputInfo, buffered_frames: u64) -> OutputStatus {
        OutputStatus {
            device: info.device.clone(),
            sample_rate: Some(info.sample_rate),
            channels: Some(info.channels),
            sample_format: info.sample_format.clone(),
            played_frames: self.played_frames.load(Ordering::Relaxed),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
            underrun_events: self.underrun_events.load(Ordering::Relaxed),
            buffered_frames,
        }
    }
}
