//! CPAL-backed [`OutputDevice`].
//!
//! CPAL streams are not `Send`, so each device owns a worker thread that holds the
//! stream together with a symphonia decoder. The device handle only sends commands:
//! - enqueued buffers are decoded packet by packet into a bounded [`SampleQueue`]
//! - the output callback drains the queue and counts played frames
//! - a buffer is handed back once the played-frame count passes its end mark
//!
//! No device method waits on the worker, so enqueueing from inside a consumed
//! notification is safe.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::StreamTrait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use stream_player_types::OutputStatus;
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet as CodecPacket;

use crate::device::{device_name, pick_buffer_size, pick_device, pick_output_config};
use crate::error::{PlayerError, Result};
use crate::format::{SharedCodecParams, StreamFormat};
use crate::output::{BufferNotifier, HardwareBuffer, OutputBackend, OutputDevice};
use crate::playback::build_output_stream;
use crate::queue::{SampleQueue, calc_max_buffered_samples};
use crate::status::{OutputCounters, OutputInfo};

const IDLE_POLL: Duration = Duration::from_millis(20);
const PUSH_WAIT: Duration = Duration::from_millis(10);
const MAX_CHANNELS: u16 = 8;

/// Settings for [`CpalBackend`].
#[derive(Clone, Debug)]
pub struct CpalConfig {
    /// Output device name substring; `None` uses the host default.
    pub device: Option<String>,
    /// Decoded audio held ahead of the callback, in seconds.
    pub queue_seconds: f32,
    /// Frames the callback pulls from the queue at a time.
    pub refill_max_frames: usize,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            device: None,
            queue_seconds: 2.0,
            refill_max_frames: 2048,
        }
    }
}

/// Opens CPAL output devices for a stream format.
pub struct CpalBackend {
    config: CpalConfig,
    codec_params: SharedCodecParams,
}

impl CpalBackend {
    pub fn new(config: CpalConfig) -> Self {
        Self {
            config,
            codec_params: SharedCodecParams::default(),
        }
    }

    /// Use container-provided codec parameters (e.g. FLAC stream info) when the
    /// configured format carries the same codec.
    pub fn with_codec_params(self, params: CodecParameters) -> Self {
        let shared = SharedCodecParams::default();
        let _ = shared.set(params);
        self.with_shared_codec_params(shared)
    }

    /// Read codec parameters from a slot a demuxer fills once the stream is probed.
    pub fn with_shared_codec_params(mut self, params: SharedCodecParams) -> Self {
        self.codec_params = params;
        self
    }

    pub fn config(&self) -> &CpalConfig {
        &self.config
    }

    fn decoder_params(&self, format: &StreamFormat) -> Result<CodecParameters> {
        if format.channels == 0 || format.channels > MAX_CHANNELS {
            return Err(PlayerError::DeviceConfig(format!(
                "unsupported channel count: {}",
                format.channels
            )));
        }
        if format.sample_rate == 0 {
            return Err(PlayerError::DeviceConfig("unknown sample rate".into()));
        }

        if let Some(params) = self.codec_params.get().filter(|p| p.codec == format.codec) {
            return Ok(params.clone());
        }

        let mut params = CodecParameters::new();
        params
            .for_codec(format.codec)
            .with_sample_rate(format.sample_rate)
            .with_channels(channel_layout(format.channels));
        if format.frames_per_packet > 0 {
            params.with_max_frames_per_packet(u64::from(format.frames_per_packet));
        }
        Ok(params)
    }
}

impl OutputBackend for CpalBackend {
    type Device = CpalDevice;

    fn configure(&self, format: &StreamFormat, notifier: BufferNotifier) -> Result<CpalDevice> {
        let params = self.decoder_params(format)?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|err| {
                PlayerError::DeviceConfig(format!(
                    "no decoder for {}: {err}",
                    format.codec_name().unwrap_or("codec")
                ))
            })?;

        let channels = usize::from(format.channels);
        let counters = Arc::new(OutputCounters::new_paused());
        let queue = Arc::new(SampleQueue::new(
            channels,
            calc_max_buffered_samples(format.sample_rate, channels, self.config.queue_seconds),
        ));

        let (tx, rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker = OutputWorker::new(rx, notifier, decoder, queue.clone(), counters.clone());
        let config = self.config.clone();
        let format = *format;

        thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || run_output_thread(config, format, worker, ready_tx))
            .map_err(|err| PlayerError::Device(format!("spawn output worker: {err}")))?;

        let info = ready_rx
            .recv()
            .map_err(|_| PlayerError::Device("output worker exited during setup".into()))??;

        Ok(CpalDevice {
            commands: tx,
            counters,
            queue,
            info,
        })
    }
}

/// Handle to a running CPAL output worker.
///
/// Dropping the handle shuts the worker down without waiting for it.
pub struct CpalDevice {
    commands: Sender<Command>,
    counters: Arc<OutputCounters>,
    queue: Arc<SampleQueue>,
    info: OutputInfo,
}

impl CpalDevice {
    pub fn info(&self) -> &OutputInfo {
        &self.info
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PlayerError::Device("output worker exited".into()))
    }
}

impl OutputDevice for CpalDevice {
    fn enqueue(&mut self, buffer: HardwareBuffer) -> Result<()> {
        self.send(Command::Enqueue(buffer))
    }

    fn start(&mut self) -> Result<()> {
        self.send(Command::Start)
    }

    fn pause(&mut self) -> Result<()> {
        self.counters.set_paused(true);
        self.send(Command::Pause)
    }

    fn stop(&mut self) -> Result<()> {
        self.counters.set_paused(true);
        self.send(Command::Stop)
    }

    fn reset(&mut self) -> Result<()> {
        self.queue.clear();
        self.send(Command::Reset)
    }

    fn status(&self) -> Option<OutputStatus> {
        Some(self.counters.snapshot(&self.info, self.queue.len_frames() as u64))
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.queue.close();
        let _ = self.commands.send(Command::Shutdown);
    }
}

enum Command {
    Enqueue(HardwareBuffer),
    Start,
    Pause,
    Stop,
    Reset,
    Shutdown,
}

fn run_output_thread(
    config: CpalConfig,
    format: StreamFormat,
    mut worker: OutputWorker,
    ready: Sender<Result<OutputInfo>>,
) {
    let stream = match open_stream(&config, &format, &worker.queue, &worker.counters) {
        Ok((stream, info)) => {
            let _ = ready.send(Ok(info));
            stream
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    worker.run(&stream);
    tracing::debug!("output worker exiting");
}

fn open_stream(
    config: &CpalConfig,
    format: &StreamFormat,
    queue: &Arc<SampleQueue>,
    counters: &Arc<OutputCounters>,
) -> Result<(cpal::Stream, OutputInfo)> {
    let host = cpal::default_host();
    let device = pick_device(&host, config.device.as_deref())?;
    let name = device_name(&device);
    let supported = pick_output_config(&device, format.sample_rate)?;
    if supported.sample_rate() != format.sample_rate {
        return Err(PlayerError::DeviceConfig(format!(
            "{} cannot play {} Hz (closest {} Hz)",
            name.as_deref().unwrap_or("output device"),
            format.sample_rate,
            supported.sample_rate()
        )));
    }

    let mut stream_config: cpal::StreamConfig = supported.clone().into();
    if let Some(buf) = pick_buffer_size(&supported) {
        stream_config.buffer_size = buf;
    }

    let stream = build_output_stream(
        &device,
        &stream_config,
        supported.sample_format(),
        queue,
        counters,
        config.refill_max_frames,
    )?;
    // Some hosts run a stream as soon as it is built.
    if let Err(err) = stream.pause() {
        tracing::debug!("pause after build failed: {err}");
    }

    let info = OutputInfo {
        device: name,
        sample_rate: stream_config.sample_rate,
        channels: stream_config.channels,
        sample_format: Some(format!("{:?}", supported.sample_format())),
    };
    tracing::info!(
        device = info.device.as_deref().unwrap_or("unknown"),
        sample_rate = info.sample_rate,
        channels = info.channels,
        source_channels = format.channels,
        sample_format = ?supported.sample_format(),
        buffer_size = ?stream_config.buffer_size,
        "output stream opened"
    );
    Ok((stream, info))
}

/// Decode and completion bookkeeping owned by the worker thread.
struct OutputWorker {
    commands: Receiver<Command>,
    notifier: BufferNotifier,
    decoder: Box<dyn Decoder>,
    queue: Arc<SampleQueue>,
    counters: Arc<OutputCounters>,
    /// Enqueued buffers not yet fully decoded; the front one is in progress.
    decoding: VecDeque<HardwareBuffer>,
    next_packet: usize,
    /// Decoded samples not yet accepted by the queue.
    pending: Vec<f32>,
    pending_offset: usize,
    /// Fully queued buffers with the sample count that ends them.
    queued: VecDeque<(u64, HardwareBuffer)>,
    pushed_samples: u64,
    played_base: u64,
    ts: u64,
}

impl OutputWorker {
    fn new(
        commands: Receiver<Command>,
        notifier: BufferNotifier,
        decoder: Box<dyn Decoder>,
        queue: Arc<SampleQueue>,
        counters: Arc<OutputCounters>,
    ) -> Self {
        Self {
            commands,
            notifier,
            decoder,
            queue,
            counters,
            decoding: VecDeque::new(),
            next_packet: 0,
            pending: Vec::new(),
            pending_offset: 0,
            queued: VecDeque::new(),
            pushed_samples: 0,
            played_base: 0,
            ts: 0,
        }
    }

    fn run(&mut self, stream: &cpal::Stream) {
        loop {
            let wait = if self.has_decode_work() {
                Duration::ZERO
            } else {
                IDLE_POLL
            };
            match self.commands.recv_timeout(wait) {
                Ok(command) => {
                    if !self.handle(command, stream) {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }

            self.decode_step();
            self.notify_played();
        }
    }

    /// Apply one command. Returns `false` on shutdown.
    fn handle(&mut self, command: Command, stream: &cpal::Stream) -> bool {
        match command {
            Command::Enqueue(buffer) => self.decoding.push_back(buffer),
            Command::Start => {
                self.counters.set_paused(false);
                if let Err(err) = stream.play() {
                    tracing::warn!("output stream play failed: {err}");
                }
            }
            Command::Pause | Command::Stop => {
                self.counters.set_paused(true);
                if let Err(err) = stream.pause() {
                    tracing::debug!("output stream pause failed: {err}");
                }
            }
            Command::Reset => self.reset(),
            Command::Shutdown => return false,
        }
        true
    }

    fn has_decode_work(&self) -> bool {
        self.pending_offset < self.pending.len() || !self.decoding.is_empty()
    }

    /// Drop every held buffer without notification and rebaseline end marks.
    fn reset(&mut self) {
        let dropped = self.decoding.len() + self.queued.len();
        self.decoding.clear();
        self.queued.clear();
        self.next_packet = 0;
        self.pending.clear();
        self.pending_offset = 0;
        let frames = self.queue.clear();
        self.decoder.reset();
        self.pushed_samples = 0;
        self.played_base = self.counters.played_frames();
        tracing::debug!(buffers = dropped, frames, "output reset");
    }

    /// Advance decoding by at most one packet.
    fn decode_step(&mut self) {
        if self.pending_offset < self.pending.len() {
            let pushed = self
                .queue
                .push_interleaved_timeout(&self.pending[self.pending_offset..], PUSH_WAIT);
            self.pending_offset += pushed;
            self.pushed_samples += pushed as u64;
            if self.pending_offset < self.pending.len() {
                return;
            }
        }

        let Some(buffer) = self.decoding.front() else {
            return;
        };

        if self.next_packet < buffer.packet_count() {
            let range = buffer.descriptors()[self.next_packet].range();
            self.next_packet += 1;
            let packet = CodecPacket::new_from_slice(0, self.ts, 0, &buffer.bytes()[range]);
            let channels = self.queue.channels();
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let frames = decoded.frames();
                    self.ts += frames as u64;
                    if decoded.spec().channels.count() != channels {
                        tracing::warn!(
                            decoded = decoded.spec().channels.count(),
                            expected = channels,
                            "channel count changed mid-stream, skipping packet"
                        );
                        return;
                    }
                    let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, *decoded.spec());
                    sample_buf.copy_interleaved_ref(decoded);
                    self.pending.clear();
                    self.pending.extend_from_slice(sample_buf.samples());
                    self.pending_offset = 0;
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    tracing::trace!("skipping undecodable packet: {err}");
                }
                Err(SymphoniaError::ResetRequired) => self.decoder.reset(),
                Err(err) => tracing::warn!("decode failed: {err}"),
            }
            return;
        }

        if let Some(buffer) = self.decoding.pop_front() {
            self.next_packet = 0;
            let end = self.pushed_samples / self.queue.channels() as u64;
            self.queued.push_back((end, buffer));
        }
    }

    /// Hand back every queued buffer whose audio has been played.
    fn notify_played(&mut self) {
        let played = self.counters.played_frames().saturating_sub(self.played_base);
        while self.queued.front().is_some_and(|(end, _)| *end <= played) {
            if let Some((_, buffer)) = self.queued.pop_front() {
                self.notifier.buffer_consumed(buffer);
            }
        }
    }
}

/// Default speaker layout for `channels` (front left first).
fn channel_layout(channels: u16) -> Channels {
    let bits = 1u32
        .checked_shl(u32::from(channels))
        .map_or(u32::MAX, |b| b - 1);
    Channels::from_bits_truncate(bits)
}
