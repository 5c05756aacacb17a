//! Local-file playback through the same output abstraction.
//!
//! There is no packet store or start threshold here: every buffer is filled by
//! reading packets synchronously from the file, once when playback starts and again
//! on each consumed notification. When the file runs out, playback ends after the
//! buffers still in flight have been played.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use stream_player_types::{OutputStatus, PlaybackEndReason, PlayerStatus, RunState};
use symphonia::core::codecs::CodecParameters;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{ParseError, PlayerError, Result};
use crate::format::{
    BufferSizing, MAX_BUFFER_SIZE, StreamFormat, derive_buffer_size, stream_format_from_params,
};
use crate::output::{
    BufferNotifier, BufferPool, BufferSink, BufferSlot, HardwareBuffer, OutputBackend,
    OutputDevice,
};
use crate::packet::Packet;

/// Audio held by each buffer.
pub const LOCAL_BUFFER_SECONDS: f64 = 0.5;
/// Buffers cycled through the device.
pub const LOCAL_BUFFER_COUNT: usize = 3;

/// Pull-based packet source.
pub trait PacketReader: Send {
    /// Next packet in file order, or `None` at end of file.
    fn next_packet(&mut self) -> Result<Option<Packet>>;
}

/// Packets of the default track of a file opened with symphonia.
pub struct FileSource {
    reader: Box<dyn FormatReader>,
    track_id: u32,
    format: StreamFormat,
    codec_params: CodecParameters,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let reader = probed.format;
        let track = reader
            .default_track()
            .ok_or_else(|| ParseError::Unsupported("no default audio track".into()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let format = stream_format_from_params(&codec_params)?;

        tracing::info!(
            path = %path.display(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            codec = format.codec_name().unwrap_or("unknown"),
            "opened local file"
        );
        Ok(Self {
            reader,
            track_id,
            format,
            codec_params,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Container codec parameters, including any decoder setup data.
    pub fn codec_params(&self) -> &CodecParameters {
        &self.codec_params
    }
}

impl PacketReader for FileSource {
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.reader.next_packet() {
                Ok(packet) if packet.track_id() != self.track_id => continue,
                Ok(packet) => return Ok(Some(Packet::new(packet.data))),
                Err(SymphoniaError::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Widest sample a decoder may be handed, in bytes.
const MAX_BYTES_PER_SAMPLE: usize = 4;
/// Room for frame headers and incompressible blocks on top of raw samples.
const PACKET_HEADER_SLACK: usize = 1024;

/// Largest packet a local file may hold for `format`.
///
/// A container bound wins. Otherwise a packet is bounded by its frames stored raw
/// at the widest sample size; with no frame count either, by [`MAX_BUFFER_SIZE`].
/// The first packet read never lowers the bound.
pub fn local_packet_bound(format: &StreamFormat, first_packet: usize) -> usize {
    let bound = if format.max_packet_size != 0 {
        format.max_packet_size as usize
    } else if format.frames_per_packet != 0 && format.channels != 0 {
        (format.frames_per_packet as usize)
            .saturating_mul(usize::from(format.channels))
            .saturating_mul(MAX_BYTES_PER_SAMPLE)
            .saturating_add(PACKET_HEADER_SLACK)
    } else {
        MAX_BUFFER_SIZE
    };
    bound.max(first_packet)
}

fn local_buffer_sizing(format: &StreamFormat, first_packet: usize) -> BufferSizing {
    let bound = local_packet_bound(format, first_packet);
    let mut sizing = derive_buffer_size(format, bound, LOCAL_BUFFER_SECONDS);
    if format.max_packet_size == 0 && format.frames_per_packet == 0 && first_packet != 0 {
        // No frame count: batch by the first packet; oversized reads carry over.
        sizing.packets_to_read = (sizing.buffer_size / first_packet).max(1);
    }
    sizing
}

/// Plays packets read on demand from a [`PacketReader`].
pub struct LocalFilePlayer<B: OutputBackend> {
    backend: B,
    format: StreamFormat,
    sizing: BufferSizing,
    state: Mutex<LocalState<B::Device>>,
    state_changed: Condvar,
    this: Weak<Self>,
}

struct LocalState<D> {
    run_state: RunState,
    reader: Box<dyn PacketReader>,
    /// Packet read ahead that did not fit the previous buffer.
    lookahead: Option<Packet>,
    reader_done: bool,
    device: Option<D>,
    pool: BufferPool,
    generation: u64,
    packets_read: u64,
    bytes_read: u64,
    end_reason: Option<PlaybackEndReason>,
    last_error: Option<String>,
}

impl<D> LocalState<D> {
    /// Fill `buffer` with up to `max_packets` packets from the reader.
    fn fill(&mut self, buffer: &mut HardwareBuffer, max_packets: usize) -> Result<usize> {
        buffer.clear();
        while buffer.packet_count() < max_packets {
            let packet = match self.lookahead.take() {
                Some(packet) => packet,
                None if self.reader_done => break,
                None => match self.reader.next_packet()? {
                    Some(packet) => packet,
                    None => {
                        self.reader_done = true;
                        tracing::debug!(packets = self.packets_read, "end of file");
                        break;
                    }
                },
            };
            if !buffer.push_packet(packet.bytes()) {
                if buffer.is_empty() {
                    return Err(PlayerError::Internal(format!(
                        "packet {} of {} bytes exceeds buffer capacity {}",
                        self.packets_read,
                        packet.size(),
                        buffer.capacity()
                    )));
                }
                self.lookahead = Some(packet);
                break;
            }
            self.packets_read += 1;
            self.bytes_read += packet.size() as u64;
        }
        Ok(buffer.packet_count())
    }
}

impl<D: OutputDevice> LocalState<D> {
    /// Fill and enqueue `buffer`, or park it when the file has nothing left.
    fn submit(&mut self, mut buffer: HardwareBuffer, max_packets: usize) -> Result<usize> {
        let packets = self.fill(&mut buffer, max_packets)?;
        if packets == 0 {
            self.pool.park(buffer)?;
            return Ok(0);
        }
        let slot = buffer.slot();
        self.pool.mark_submitted(slot)?;
        let Some(device) = self.device.as_mut() else {
            return Err(PlayerError::Internal("no output device".into()));
        };
        device.enqueue(buffer).map_err(|err| {
            PlayerError::Internal(format!("enqueue of slot {} failed: {err}", slot.index()))
        })?;
        tracing::trace!(slot = slot.index(), packets, "buffer enqueued");
        Ok(packets)
    }

    fn submit_parked(&mut self, max_packets: usize) -> Result<usize> {
        let mut submitted = 0;
        while let Some(buffer) = self.pool.take_parked() {
            let packets = self.submit(buffer, max_packets)?;
            if packets == 0 {
                break;
            }
            submitted += packets;
        }
        Ok(submitted)
    }
}

impl<B> LocalFilePlayer<B>
where
    B: OutputBackend + 'static,
{
    /// Prepare playback of `reader`.
    ///
    /// The first packet is read up front. Buffers are sized from the packet bound
    /// given by [`local_packet_bound`].
    pub fn new(backend: B, mut reader: Box<dyn PacketReader>, format: StreamFormat) -> Result<Arc<Self>> {
        let lookahead = reader.next_packet()?;
        let first_packet = lookahead.as_ref().map_or(0, Packet::size);
        let sizing = local_buffer_sizing(&format, first_packet);
        tracing::debug!(
            buffer_size = sizing.buffer_size,
            packets_per_buffer = sizing.packets_to_read,
            "local playback buffers sized"
        );

        let reader_done = lookahead.is_none();
        Ok(Arc::new_cyclic(|this| Self {
            backend,
            format,
            sizing,
            state: Mutex::new(LocalState {
                run_state: RunState::Idle,
                reader,
                lookahead,
                reader_done,
                device: None,
                pool: BufferPool::new(LOCAL_BUFFER_COUNT),
                generation: 0,
                packets_read: 0,
                bytes_read: 0,
                end_reason: None,
                last_error: None,
            }),
            state_changed: Condvar::new(),
            this: this.clone(),
        }))
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn sizing(&self) -> BufferSizing {
        self.sizing
    }

    pub fn state(&self) -> RunState {
        self.lock_state().run_state
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    /// Start playback, or resume after `pause`.
    pub fn play(&self) -> Result<()> {
        let mut st = self.lock_state();
        let run_state = st.run_state;
        let result = match run_state {
            RunState::Idle => self.start(&mut st),
            RunState::Paused => self.resume(&mut st),
            RunState::Buffering | RunState::Running => return Ok(()),
            RunState::Stopped => {
                return Err(PlayerError::InvalidState {
                    op: "play",
                    state: run_state,
                });
            }
        };
        result.map_err(|err| self.abort(&mut st, err))
    }

    pub fn pause(&self) -> Result<()> {
        let mut st = self.lock_state();
        let run_state = st.run_state;
        match run_state {
            RunState::Paused => Ok(()),
            RunState::Running => {
                let paused = match st.device.as_mut() {
                    Some(device) => device.pause(),
                    None => Ok(()),
                };
                if let Err(err) = paused {
                    return Err(self.abort(&mut st, err));
                }
                self.set_run_state(&mut st, RunState::Paused);
                Ok(())
            }
            state => Err(PlayerError::InvalidState { op: "pause", state }),
        }
    }

    /// Stop playback and release the device. Idempotent.
    pub fn stop(&self) {
        let mut st = self.lock_state();
        self.shutdown(&mut st, PlaybackEndReason::Stopped);
    }

    /// Block until playback has stopped or `timeout` elapses.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let st = self.lock_state();
        let (st, _timeout) = self
            .state_changed
            .wait_timeout_while(st, timeout, |st| !st.run_state.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        st.run_state.is_terminal()
    }

    pub fn status(&self) -> PlayerStatus {
        let st = self.lock_state();
        let device_open = st.device.is_some();
        PlayerStatus {
            state: st.run_state,
            packets_received: st.packets_read,
            packets_submitted: st.packets_read,
            bytes_received: st.bytes_read,
            buffered_seconds: None,
            sample_rate: Some(self.format.sample_rate),
            channels: Some(self.format.channels),
            codec: self.format.codec_name().map(str::to_string),
            buffer_count: device_open.then(|| st.pool.len()),
            buffer_capacity_bytes: device_open.then_some(self.sizing.buffer_size),
            buffers_in_flight: st.pool.in_flight(),
            starvation_events: 0,
            parse_errors: 0,
            source_finished: st.reader_done && st.lookahead.is_none(),
            end_reason: st.end_reason,
        }
    }

    pub fn output_status(&self) -> Option<OutputStatus> {
        self.lock_state().device.as_ref().and_then(|d| d.status())
    }

    fn lock_state(&self) -> MutexGuard<'_, LocalState<B::Device>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_run_state(&self, st: &mut LocalState<B::Device>, next: RunState) {
        if st.run_state != next {
            tracing::info!(from = ?st.run_state, to = ?next, "local player state changed");
            st.run_state = next;
            self.state_changed.notify_all();
        }
    }

    fn start(&self, st: &mut LocalState<B::Device>) -> Result<()> {
        if st.reader_done && st.lookahead.is_none() {
            tracing::info!("file has no packets");
            self.shutdown(st, PlaybackEndReason::Eof);
            return Ok(());
        }

        st.generation += 1;
        let sink: Weak<dyn BufferSink> = self.this.clone();
        let notifier = BufferNotifier::new(sink, st.generation);
        let device = st.device.insert(self.backend.configure(&self.format, notifier)?);
        for index in 0..LOCAL_BUFFER_COUNT {
            let buffer = device.allocate_buffer(BufferSlot::new(index), self.sizing.buffer_size)?;
            st.pool.park(buffer)?;
        }

        let primed = st.submit_parked(self.sizing.packets_to_read)?;
        tracing::info!(
            packets = primed,
            buffer_size = self.sizing.buffer_size,
            "starting local playback"
        );
        if let Some(device) = st.device.as_mut() {
            device.start()?;
        }
        self.set_run_state(st, RunState::Running);
        self.check_drained(st);
        Ok(())
    }

    fn resume(&self, st: &mut LocalState<B::Device>) -> Result<()> {
        st.submit_parked(self.sizing.packets_to_read)?;
        if let Some(device) = st.device.as_mut() {
            device.start()?;
        }
        self.set_run_state(st, RunState::Running);
        self.check_drained(st);
        Ok(())
    }

    fn check_drained(&self, st: &mut LocalState<B::Device>) {
        if st.run_state == RunState::Running
            && st.reader_done
            && st.lookahead.is_none()
            && st.pool.all_parked()
        {
            tracing::info!(packets = st.packets_read, "file played out");
            self.shutdown(st, PlaybackEndReason::Eof);
        }
    }

    fn on_buffer_consumed(&self, st: &mut LocalState<B::Device>, buffer: HardwareBuffer) -> Result<()> {
        st.pool.reclaim(buffer.slot())?;
        if st.run_state != RunState::Running {
            st.pool.park(buffer)?;
            return Ok(());
        }
        st.submit(buffer, self.sizing.packets_to_read)?;
        self.check_drained(st);
        Ok(())
    }

    fn abort(&self, st: &mut LocalState<B::Device>, err: PlayerError) -> PlayerError {
        tracing::error!(error = %err, "local playback aborted");
        st.last_error = Some(err.to_string());
        self.shutdown(st, PlaybackEndReason::Error);
        err
    }

    fn shutdown(&self, st: &mut LocalState<B::Device>, reason: PlaybackEndReason) {
        if st.run_state.is_terminal() {
            return;
        }
        st.generation += 1;
        if let Some(mut device) = st.device.take() {
            if let Err(err) = device.stop() {
                tracing::warn!(error = %err, "device stop failed");
            }
            if let Err(err) = device.reset() {
                tracing::warn!(error = %err, "device reset failed");
            }
        }
        st.pool.release_all();
        st.end_reason = Some(reason);
        tracing::info!(reason = ?reason, packets = st.packets_read, "local playback ended");
        self.set_run_state(st, RunState::Stopped);
    }
}

impl<B> BufferSink for LocalFilePlayer<B>
where
    B: OutputBackend + 'static,
{
    fn buffer_consumed(&self, generation: u64, buffer: HardwareBuffer) {
        let mut st = self.lock_state();
        if st.generation != generation || st.device.is_none() {
            tracing::trace!(generation, slot = buffer.slot().index(), "ignoring stale buffer notification");
            return;
        }
        if let Err(err) = self.on_buffer_consumed(&mut st, buffer) {
            self.abort(&mut st, err);
        }
    }
}
