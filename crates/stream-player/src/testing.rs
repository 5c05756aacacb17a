//! In-memory output device and demux helpers for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::demux::{DemuxEvent, PacketParser};
use crate::error::{ParseError, PlayerError, Result};
use crate::format::StreamFormat;
use crate::output::{BufferNotifier, BufferSlot, HardwareBuffer, OutputBackend, OutputDevice};
use crate::packet::{Packet, PacketDescriptor};

/// One recorded device interaction.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum DeviceCall {
    Configure { sample_rate: u32, channels: u16 },
    Allocate { slot: usize, capacity: usize },
    Enqueue(EnqueueRecord),
    Start,
    Pause,
    Stop,
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EnqueueRecord {
    pub slot: usize,
    pub packets: usize,
    pub bytes: usize,
    pub descriptors: Vec<PacketDescriptor>,
}

#[derive(Default)]
struct MockShared {
    calls: Mutex<Vec<DeviceCall>>,
    held: Mutex<VecDeque<HardwareBuffer>>,
    notifier: Mutex<Option<BufferNotifier>>,
    fail_configure: AtomicBool,
    fail_allocate_slot: Mutex<Option<usize>>,
    fail_enqueue: AtomicBool,
}

/// Backend whose devices record every call and hold enqueued buffers until the
/// test completes them.
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    shared: Arc<MockShared>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_configure(&self) {
        self.shared.fail_configure.store(true, Ordering::SeqCst);
    }

    pub fn fail_allocate_at(&self, slot: usize) {
        *self.shared.fail_allocate_slot.lock().unwrap() = Some(slot);
    }

    pub fn fail_enqueue(&self) {
        self.shared.fail_enqueue.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.shared.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn enqueues(&self) -> Vec<EnqueueRecord> {
        self.shared
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Enqueue(rec) => Some(rec.clone()),
                _ => None,
            })
            .collect()
    }

    /// Buffers currently held by the device.
    pub fn held(&self) -> usize {
        self.shared.held.lock().unwrap().len()
    }

    /// Notifier handed to the most recent `configure`.
    pub fn notifier(&self) -> Option<BufferNotifier> {
        self.shared.notifier.lock().unwrap().clone()
    }

    /// Remove the oldest held buffer without notifying.
    pub fn take_held(&self) -> Option<HardwareBuffer> {
        self.shared.held.lock().unwrap().pop_front()
    }

    /// Play out the oldest held buffer and notify the player.
    ///
    /// Returns `false` when the device holds nothing.
    pub fn complete_next(&self) -> bool {
        let Some(buffer) = self.take_held() else {
            return false;
        };
        let notifier = self.notifier().expect("device was configured");
        notifier.buffer_consumed(buffer);
        true
    }

    fn record(&self, call: DeviceCall) {
        self.shared.calls.lock().unwrap().push(call);
    }
}

impl OutputBackend for MockBackend {
    type Device = MockDevice;

    fn configure(&self, format: &StreamFormat, notifier: BufferNotifier) -> Result<MockDevice> {
        self.record(DeviceCall::Configure {
            sample_rate: format.sample_rate,
            channels: format.channels,
        });
        if self.shared.fail_configure.load(Ordering::SeqCst) {
            return Err(PlayerError::DeviceConfig(format!(
                "{} Hz not supported",
                format.sample_rate
            )));
        }
        *self.shared.notifier.lock().unwrap() = Some(notifier);
        Ok(MockDevice {
            backend: self.clone(),
        })
    }
}

pub(crate) struct MockDevice {
    backend: MockBackend,
}

impl OutputDevice for MockDevice {
    fn allocate_buffer(&mut self, slot: BufferSlot, capacity: usize) -> Result<HardwareBuffer> {
        self.backend.record(DeviceCall::Allocate {
            slot: slot.index(),
            capacity,
        });
        if *self.backend.shared.fail_allocate_slot.lock().unwrap() == Some(slot.index()) {
            return Err(PlayerError::BufferAllocation(format!("slot {}", slot.index())));
        }
        HardwareBuffer::try_new(slot, capacity)
    }

    fn enqueue(&mut self, buffer: HardwareBuffer) -> Result<()> {
        self.backend.record(DeviceCall::Enqueue(EnqueueRecord {
            slot: buffer.slot().index(),
            packets: buffer.packet_count(),
            bytes: buffer.len(),
            descriptors: buffer.descriptors().to_vec(),
        }));
        if self.backend.shared.fail_enqueue.load(Ordering::SeqCst) {
            return Err(PlayerError::Device("queue rejected buffer".into()));
        }
        self.backend.shared.held.lock().unwrap().push_back(buffer);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.backend.record(DeviceCall::Start);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.backend.record(DeviceCall::Pause);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.backend.record(DeviceCall::Stop);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.backend.record(DeviceCall::Reset);
        self.backend.shared.held.lock().unwrap().clear();
        Ok(())
    }
}

/// Parser that reports `format` once and turns every non-empty chunk into one packet.
pub(crate) struct ChunkPacketParser {
    format: StreamFormat,
    announced: bool,
    offset: u64,
    fail_next: Option<ParseError>,
}

impl ChunkPacketParser {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            announced: false,
            offset: 0,
            fail_next: None,
        }
    }

    /// Parser whose first call reports `err` after emitting its events.
    pub fn failing_once(format: StreamFormat, err: ParseError) -> Self {
        Self {
            fail_next: Some(err),
            ..Self::new(format)
        }
    }
}

impl PacketParser for ChunkPacketParser {
    fn parse(
        &mut self,
        bytes: &[u8],
        events: &mut Vec<DemuxEvent>,
    ) -> std::result::Result<(), ParseError> {
        if !self.announced {
            self.announced = true;
            events.push(DemuxEvent::FormatReady(self.format));
        }
        if !bytes.is_empty() {
            let start = self.offset;
            self.offset += bytes.len() as u64;
            events.push(DemuxEvent::PacketsReady {
                packets: vec![Packet::from_slice(bytes)],
                byte_range: start..self.offset,
            });
        }
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// MPEG-1 Layer III at 44.1 kHz stereo, the reference packet rate of the tests.
pub(crate) fn mp3_format() -> StreamFormat {
    StreamFormat {
        sample_rate: 44_100,
        frames_per_packet: 1152,
        bytes_per_packet: 0,
        bytes_per_frame: 0,
        channels: 2,
        codec: symphonia::core::codecs::CODEC_TYPE_MP3,
        max_packet_size: 1441,
    }
}

/// Mono 16-bit PCM WAV file holding a ramp of `frames` samples.
pub(crate) fn wav_bytes(sample_rate: u32, frames: usize) -> Vec<u8> {
    let data_len = (frames * 2) as u32;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        out.extend_from_slice(&((i as i16) * 8).to_le_bytes());
    }
    out
}
