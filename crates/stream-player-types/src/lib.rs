use serde::{Deserialize, Serialize};

/// Lifecycle state of a streaming playback session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Constructed; no bytes received yet.
    #[default]
    Idle,
    /// Receiving and collecting packets until the start threshold is reached.
    Buffering,
    /// Output device started and buffers cycling.
    Running,
    /// Output device paused; no data movement.
    Paused,
    /// Terminal. Device reset and buffers released.
    Stopped,
}

impl RunState {
    /// `true` once the session can no longer move data.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped)
    }
}

/// Reason why playback ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Source completed and every submitted buffer was played.
    Eof,
    /// Device, allocation, or internal error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Snapshot of the packet pipeline reported by the streaming player.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerStatus {
    /// Current session state.
    pub state: RunState,
    /// Packets appended to the store so far.
    pub packets_received: u64,
    /// Packets handed to the output device so far (the read cursor).
    pub packets_submitted: u64,
    /// Compressed bytes received from the demuxer.
    pub bytes_received: u64,
    /// Unread audio in the store, in seconds, when the format is known.
    pub buffered_seconds: Option<f64>,
    /// Sample rate of the stream in Hz, when known.
    pub sample_rate: Option<u32>,
    /// Channel count of the stream, when known.
    pub channels: Option<u16>,
    /// Codec label of the stream, when known.
    pub codec: Option<String>,
    /// Number of hardware buffers in the session.
    pub buffer_count: Option<usize>,
    /// Byte capacity of each hardware buffer.
    pub buffer_capacity_bytes: Option<usize>,
    /// Buffers currently owned by the device.
    pub buffers_in_flight: usize,
    /// Times a reclaimed buffer found nothing to play while the stream was still arriving.
    pub starvation_events: u64,
    /// Malformed-data reports from the demuxer.
    pub parse_errors: u64,
    /// `true` once the transport signalled completion.
    pub source_finished: bool,
    /// Terminal reason once the session is stopped.
    pub end_reason: Option<PlaybackEndReason>,
}

/// Counters maintained by a real output device.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputStatus {
    /// Active output device name, if known.
    pub device: Option<String>,
    /// Output sample rate (Hz).
    pub sample_rate: Option<u32>,
    /// Output channel count.
    pub channels: Option<u16>,
    /// Output sample format selected for the device stream.
    pub sample_format: Option<String>,
    /// Frames rendered to the device.
    pub played_frames: u64,
    /// Frames of silence emitted because no decoded audio was ready.
    pub underrun_frames: u64,
    /// Number of underrun incidents.
    pub underrun_events: u64,
    /// Decoded frames waiting for the output callback.
    pub buffered_frames: u64,
}
