//! Streaming playback orchestrator.
//!
//! [`StreamingPlayer`] ties the pipeline together:
//! - network context: [`receive`](StreamingPlayer::receive) demuxes bytes, appends
//!   packets to the [`PacketStore`], and starts playback once enough audio is buffered
//! - device context: each consumed buffer is refilled from the read cursor and
//!   re-enqueued through [`BufferSink`]
//! - control context: `play`/`pause`/`stop`/`finish`/`status` from any thread
//!
//! ## Flow control
//! - Playback starts the first time the store holds `start_threshold_seconds` of audio.
//!   One buffer receives the initial window; the rest are parked.
//! - A consumed buffer is refilled with up to `refill_window_seconds` of unread packets.
//!   When nothing is unread the buffer is parked instead of stopping playback.
//! - Parked buffers are refilled from the network path once the unread backlog reaches
//!   `resume_threshold_seconds`, or right away after end of stream.
//! - After end of stream, playback stops with [`PlaybackEndReason::Eof`] once every
//!   buffer is back and nothing is unread.
//!
//! ## Locking
//! The demuxer mutex is taken before the state mutex. The store's lock is a leaf.
//! The read cursor only moves under the state mutex.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use stream_player_types::{OutputStatus, PlaybackEndReason, PlayerStatus, RunState};

use crate::config::PlayerConfig;
use crate::demux::{DemuxEvent, PacketParser, StreamDemuxer};
use crate::error::{ParseError, PlayerError, Result};
use crate::format::{StreamFormat, derive_buffer_size};
use crate::output::{
    BufferNotifier, BufferPool, BufferSink, BufferSlot, HardwareBuffer, OutputBackend,
    OutputDevice,
};
use crate::store::PacketStore;

/// Orchestrates a network stream into a multi-buffered output device.
pub struct StreamingPlayer<B: OutputBackend> {
    backend: B,
    config: PlayerConfig,
    store: Arc<PacketStore>,
    demuxer: Mutex<StreamDemuxer>,
    state: Mutex<PlayerState<B::Device>>,
    state_changed: Condvar,
    this: Weak<Self>,
}

struct PlayerState<D> {
    run_state: RunState,
    format: Option<StreamFormat>,
    session: Option<PlaybackSession<D>>,
    /// Bumped whenever a session starts or stops.
    generation: u64,
    source_finished: bool,
    packets_submitted: u64,
    starvation_events: u64,
    parse_errors: u64,
    end_reason: Option<PlaybackEndReason>,
    last_error: Option<String>,
}

impl<D> PlayerState<D> {
    fn new() -> Self {
        Self {
            run_state: RunState::Idle,
            format: None,
            session: None,
            generation: 0,
            source_finished: false,
            packets_submitted: 0,
            starvation_events: 0,
            parse_errors: 0,
            end_reason: None,
            last_error: None,
        }
    }
}

/// Device, buffers, and read cursor of one started playback.
struct PlaybackSession<D> {
    device: D,
    pool: BufferPool,
    /// Index of the next packet to submit; never exceeds `store.count()`.
    cursor: usize,
    capacity: usize,
    refill_window: usize,
    resume_backlog: usize,
}

enum Refill {
    Submitted(usize),
    Empty(HardwareBuffer),
}

impl<D: OutputDevice> PlaybackSession<D> {
    /// Fill `buffer` with up to `window` unread packets and enqueue it.
    ///
    /// Hands the buffer back when nothing is unread.
    fn refill(&mut self, store: &PacketStore, mut buffer: HardwareBuffer, window: usize) -> Result<Refill> {
        let unread = store.count().saturating_sub(self.cursor);
        let want = window.min(unread);
        if want == 0 {
            buffer.clear();
            return Ok(Refill::Empty(buffer));
        }

        let copied = buffer.fill_from(store, self.cursor, want);
        if copied.packets == 0 {
            let size = store.packet(self.cursor).map(|p| p.size()).unwrap_or_default();
            return Err(PlayerError::Internal(format!(
                "packet {} of {size} bytes exceeds buffer capacity {}",
                self.cursor,
                buffer.capacity()
            )));
        }

        let slot = buffer.slot();
        self.pool.mark_submitted(slot)?;
        self.device
            .enqueue(buffer)
            .map_err(|err| PlayerError::Internal(format!("enqueue of slot {} failed: {err}", slot.index())))?;
        self.cursor += copied.packets;

        tracing::trace!(
            slot = slot.index(),
            packets = copied.packets,
            bytes = copied.bytes,
            cursor = self.cursor,
            "buffer enqueued"
        );
        Ok(Refill::Submitted(copied.packets))
    }
}

impl<B> StreamingPlayer<B>
where
    B: OutputBackend + 'static,
{
    pub fn new(backend: B, parser: Box<dyn PacketParser>, config: PlayerConfig) -> Arc<Self> {
        let config = config.sanitized();
        Arc::new_cyclic(|this| Self {
            backend,
            config,
            store: Arc::new(PacketStore::new()),
            demuxer: Mutex::new(StreamDemuxer::new(parser)),
            state: Mutex::new(PlayerState::new()),
            state_changed: Condvar::new(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Packets received so far.
    pub fn store(&self) -> &Arc<PacketStore> {
        &self.store
    }

    pub fn state(&self) -> RunState {
        self.lock_state().run_state
    }

    /// Message of the error that aborted the session, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    /// Start collecting packets. Implied by the first `receive`.
    pub fn begin(&self) {
        let mut st = self.lock_state();
        if st.run_state == RunState::Idle {
            self.set_run_state(&mut st, RunState::Buffering);
        }
    }

    /// Feed one chunk of transport bytes in arrival order.
    ///
    /// A returned [`PlayerError::Parse`] is informational: packets delimited before
    /// the error were stored and the session keeps going. Fatal errors stop the session.
    pub fn receive(&self, bytes: &[u8]) -> Result<()> {
        let mut demuxer = self.demuxer.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.state();
        if state.is_terminal() {
            return Err(PlayerError::InvalidState { op: "receive", state });
        }

        let mut events = Vec::new();
        let parsed = demuxer.feed(bytes, &mut events);

        let mut st = self.lock_state();
        if st.run_state == RunState::Idle {
            self.set_run_state(&mut st, RunState::Buffering);
        }
        self.apply_events(&mut st, events, parsed.as_ref().err());

        let driven = self.after_append(&mut st);
        drop(st);
        drop(demuxer);

        driven?;
        parsed.map_err(PlayerError::from)
    }

    /// Signal that the transport delivered its last chunk.
    ///
    /// Packets the demuxer still held back are stored first.
    pub fn finish(&self) -> Result<()> {
        let mut demuxer = self.demuxer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state().is_terminal() {
            return Ok(());
        }
        let mut events = Vec::new();
        let flushed = if self.lock_state().source_finished {
            Ok(())
        } else {
            demuxer.finish(&mut events)
        };

        let mut st = self.lock_state();
        drop(demuxer);
        if st.run_state.is_terminal() {
            return Ok(());
        }
        self.apply_events(&mut st, events, flushed.as_ref().err());
        if !st.source_finished {
            st.source_finished = true;
            tracing::info!(packets = self.store.count(), "source finished");
        }

        let format = st.format;
        let run_state = st.run_state;
        match run_state {
            RunState::Idle | RunState::Buffering => match format {
                Some(format) if !self.store.is_empty() => {
                    self.start_playback(&mut st, format)?;
                    self.drain_or_abort(&mut st)
                }
                _ => {
                    tracing::info!("stream ended before any audio was buffered");
                    self.shutdown(&mut st, PlaybackEndReason::Eof);
                    Ok(())
                }
            },
            RunState::Running => self.drain_or_abort(&mut st),
            RunState::Paused | RunState::Stopped => Ok(()),
        }
    }

    /// Resume after `pause`. A no-op before playback has started.
    pub fn play(&self) -> Result<()> {
        let mut st = self.lock_state();
        let run_state = st.run_state;
        match run_state {
            RunState::Idle | RunState::Buffering | RunState::Running => Ok(()),
            RunState::Stopped => Err(PlayerError::InvalidState {
                op: "play",
                state: run_state,
            }),
            RunState::Paused => {
                self.set_run_state(&mut st, RunState::Running);
                if let Err(err) = self.resume(&mut st) {
                    return Err(self.abort(&mut st, err));
                }
                self.check_drained(&mut st);
                Ok(())
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut st = self.lock_state();
        let run_state = st.run_state;
        match run_state {
            RunState::Paused => Ok(()),
            RunState::Running => {
                let paused = match st.session.as_mut() {
                    Some(session) => session.device.pause(),
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

    /// Stop playback and release the device. Safe to call repeatedly from any thread.
    pub fn stop(&self) {
        let mut st = self.lock_state();
        self.shutdown(&mut st, PlaybackEndReason::Stopped);
    }

    /// Block until the session is stopped or `timeout` elapses.
    ///
    /// Returns `true` if the session is stopped.
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
        let received = self.store.count();
        let unread = received.saturating_sub(st.packets_submitted as usize);
        let session = st.session.as_ref();
        PlayerStatus {
            state: st.run_state,
            packets_received: received as u64,
            packets_submitted: st.packets_submitted,
            bytes_received: self.store.total_appended_bytes(),
            buffered_seconds: st.format.map(|f| f.seconds_for_packets(unread)),
            sample_rate: st.format.map(|f| f.sample_rate),
            channels: st.format.map(|f| f.channels),
            codec: st.format.and_then(|f| f.codec_name()).map(str::to_string),
            buffer_count: session.map(|s| s.pool.len()),
            buffer_capacity_bytes: session.map(|s| s.capacity),
            buffers_in_flight: session.map(|s| s.pool.in_flight()).unwrap_or(0),
            starvation_events: st.starvation_events,
            parse_errors: st.parse_errors,
            source_finished: st.source_finished,
            end_reason: st.end_reason,
        }
    }

    /// Render-side counters of the active device.
    pub fn output_status(&self) -> Option<OutputStatus> {
        let st = self.lock_state();
        st.session.as_ref().and_then(|s| s.device.status())
    }

    fn lock_state(&self) -> MutexGuard<'_, PlayerState<B::Device>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_run_state(&self, st: &mut PlayerState<B::Device>, next: RunState) {
        if st.run_state != next {
            tracing::info!(from = ?st.run_state, to = ?next, "player state changed");
            st.run_state = next;
            self.state_changed.notify_all();
        }
    }

    fn apply_events(
        &self,
        st: &mut PlayerState<B::Device>,
        events: Vec<DemuxEvent>,
        parse_error: Option<&ParseError>,
    ) {
        for event in events {
            match event {
                DemuxEvent::FormatReady(format) => st.format = Some(format),
                DemuxEvent::PacketsReady { packets, .. } => self.store.append_batch(packets),
            }
        }
        if let Some(err) = parse_error {
            st.parse_errors += 1;
            tracing::warn!(error = %err, parse_errors = st.parse_errors, "stream parse error");
        }
    }

    fn after_append(&self, st: &mut PlayerState<B::Device>) -> Result<()> {
        match st.run_state {
            RunState::Buffering if st.session.is_none() => {
                let Some(format) = st.format else {
                    return Ok(());
                };
                let buffered = format.seconds_for_packets(self.store.count());
                if buffered >= self.config.start_threshold_seconds {
                    self.start_playback(st, format)
                } else {
                    Ok(())
                }
            }
            RunState::Running => match self.refill_parked(st, false) {
                Ok(()) => Ok(()),
                Err(err) => Err(self.abort(st, err)),
            },
            _ => Ok(()),
        }
    }

    fn start_playback(&self, st: &mut PlayerState<B::Device>, format: StreamFormat) -> Result<()> {
        match self.try_start(st, format) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.abort(st, err)),
        }
    }

    fn try_start(&self, st: &mut PlayerState<B::Device>, format: StreamFormat) -> Result<()> {
        let max_packet = (format.max_packet_size as usize).max(self.store.max_packet_size());
        let sizing = derive_buffer_size(&format, max_packet, self.config.refill_window_seconds);

        st.generation += 1;
        let sink: Weak<dyn BufferSink> = self.this.clone();
        let notifier = BufferNotifier::new(sink, st.generation);

        tracing::info!(
            packets = self.store.count(),
            buffered_seconds = format.seconds_for_packets(self.store.count()),
            buffer_size = sizing.buffer_size,
            buffers = self.config.buffer_count,
            "starting playback"
        );
        let device = self.backend.configure(&format, notifier)?;
        let session = st.session.insert(PlaybackSession {
            device,
            pool: BufferPool::new(self.config.buffer_count),
            cursor: 0,
            capacity: sizing.buffer_size,
            refill_window: format.packets_for_seconds(self.config.refill_window_seconds),
            resume_backlog: format.packets_for_seconds(self.config.resume_threshold_seconds),
        });

        for index in 0..self.config.buffer_count {
            let buffer = session
                .device
                .allocate_buffer(BufferSlot::new(index), sizing.buffer_size)?;
            session.pool.park(buffer)?;
        }
        session.device.start()?;

        let initial_window = format.packets_for_seconds(self.config.start_threshold_seconds);
        if let Some(buffer) = session.pool.take_parked() {
            if let Refill::Empty(buffer) = session.refill(&self.store, buffer, initial_window)? {
                session.pool.park(buffer)?;
            }
        }
        st.packets_submitted = session.cursor as u64;
        self.set_run_state(st, RunState::Running);
        Ok(())
    }

    /// Refill parked buffers from unread packets.
    ///
    /// Unless `force` is set or the source is finished, waits for the resume backlog.
    fn refill_parked(&self, st: &mut PlayerState<B::Device>, force: bool) -> Result<()> {
        let source_finished = st.source_finished;
        let Some(session) = st.session.as_mut() else {
            return Ok(());
        };
        if session.pool.parked_len() == 0 {
            return Ok(());
        }
        let unread = self.store.count().saturating_sub(session.cursor);
        if unread == 0 || (!force && !source_finished && unread < session.resume_backlog) {
            return Ok(());
        }

        let window = session.refill_window;
        let mut submitted = 0usize;
        while let Some(buffer) = session.pool.take_parked() {
            match session.refill(&self.store, buffer, window)? {
                Refill::Submitted(packets) => submitted += packets,
                Refill::Empty(buffer) => {
                    session.pool.park(buffer)?;
                    break;
                }
            }
        }
        st.packets_submitted = session.cursor as u64;
        tracing::debug!(packets = submitted, cursor = session.cursor, "resumed parked buffers");
        Ok(())
    }

    fn resume(&self, st: &mut PlayerState<B::Device>) -> Result<()> {
        self.refill_parked(st, true)?;
        match st.session.as_mut() {
            Some(session) => session.device.start(),
            None => Ok(()),
        }
    }

    fn drain_or_abort(&self, st: &mut PlayerState<B::Device>) -> Result<()> {
        if let Err(err) = self.refill_parked(st, true) {
            return Err(self.abort(st, err));
        }
        self.check_drained(st);
        Ok(())
    }

    /// Stop with `Eof` once the finished source has been played out completely.
    fn check_drained(&self, st: &mut PlayerState<B::Device>) {
        if !st.source_finished || st.run_state != RunState::Running {
            return;
        }
        let drained = st
            .session
            .as_ref()
            .is_some_and(|s| s.pool.all_parked() && s.cursor == self.store.count());
        if drained {
            tracing::info!(packets = st.packets_submitted, "stream played out");
            self.shutdown(st, PlaybackEndReason::Eof);
        }
    }

    fn on_buffer_consumed(&self, st: &mut PlayerState<B::Device>, buffer: HardwareBuffer) -> Result<()> {
        let Some(session) = st.session.as_mut() else {
            return Ok(());
        };
        session.pool.reclaim(buffer.slot())?;

        if st.run_state != RunState::Running {
            session.pool.park(buffer)?;
            return Ok(());
        }

        let slot = buffer.slot();
        let window = session.refill_window;
        match session.refill(&self.store, buffer, window)? {
            Refill::Submitted(_) => st.packets_submitted = session.cursor as u64,
            Refill::Empty(buffer) => {
                session.pool.park(buffer)?;
                if !st.source_finished {
                    st.starvation_events += 1;
                    tracing::warn!(
                        slot = slot.index(),
                        cursor = session.cursor,
                        in_flight = session.pool.in_flight(),
                        starvation_events = st.starvation_events,
                        "no packets to refill buffer, parking it"
                    );
                }
            }
        }
        self.check_drained(st);
        Ok(())
    }

    fn abort(&self, st: &mut PlayerState<B::Device>, err: PlayerError) -> PlayerError {
        tracing::error!(error = %err, "playback aborted");
        st.last_error = Some(err.to_string());
        self.shutdown(st, PlaybackEndReason::Error);
        err
    }

    /// Stop and reset the device exactly once, release buffers, and invalidate
    /// outstanding notifications.
    fn shutdown(&self, st: &mut PlayerState<B::Device>, reason: PlaybackEndReason) {
        if st.run_state.is_terminal() {
            return;
        }
        st.generation += 1;
        if let Some(mut session) = st.session.take() {
            if let Err(err) = session.device.stop() {
                tracing::warn!(error = %err, "device stop failed");
            }
            if let Err(err) = session.device.reset() {
                tracing::warn!(error = %err, "device reset failed");
            }
            let freed = session.pool.release_all();
            tracing::debug!(freed, cursor = session.cursor, "released playback buffers");
        }
        st.end_reason = Some(reason);
        tracing::info!(reason = ?reason, "playback ended");
        self.set_run_state(st, RunState::Stopped);
    }
}

impl<B> BufferSink for StreamingPlayer<B>
where
    B: OutputBackend + 'static,
{
    fn buffer_consumed(&self, generation: u64, buffer: HardwareBuffer) {
        let mut st = self.lock_state();
        if st.generation != generation || st.session.is_none() {
            tracing::trace!(
                generation,
                current = st.generation,
                slot = buffer.slot().index(),
                "ignoring stale buffer notification"
            );
            return;
        }
        if let Err(err) = self.on_buffer_consumed(&mut st, buffer) {
            self.abort(&mut st, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{AutoPacketParser, MpegFrameParser};
    use crate::packet::PacketDescriptor;
    use crate::testing::{ChunkPacketParser, DeviceCall, MockBackend, mp3_format, wav_bytes};
    use std::thread;

    fn player_for(backend: &MockBackend, format: StreamFormat) -> Arc<StreamingPlayer<MockBackend>> {
        StreamingPlayer::new(
            backend.clone(),
            Box::new(ChunkPacketParser::new(format)),
            PlayerConfig::default(),
        )
    }

    fn feed(player: &StreamingPlayer<MockBackend>, packets: usize, size: usize) {
        for _ in 0..packets {
            player.receive(&vec![0xA5; size]).unwrap();
        }
    }

    fn starts(backend: &MockBackend) -> usize {
        backend.count(|c| *c == DeviceCall::Start)
    }

    fn configures(backend: &MockBackend) -> usize {
        backend.count(|c| matches!(c, DeviceCall::Configure { .. }))
    }

    #[test]
    fn starts_once_three_seconds_are_buffered() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());

        feed(&player, 114, 418);
        assert_eq!(player.state(), RunState::Buffering);
        assert_eq!(configures(&backend), 0);
        assert_eq!(starts(&backend), 0);

        feed(&player, 1, 418);
        assert_eq!(player.state(), RunState::Running);
        assert_eq!(configures(&backend), 1);
        assert_eq!(starts(&backend), 1);
        assert_eq!(backend.count(|c| matches!(c, DeviceCall::Allocate { .. })), 3);

        let enqueues = backend.enqueues();
        assert_eq!(enqueues.len(), 1);
        assert_eq!(enqueues[0].packets, 115);
        assert_eq!(enqueues[0].bytes, 115 * 418);

        let status = player.status();
        assert_eq!(status.packets_submitted, 115);
        assert_eq!(status.packets_received, 115);
        assert_eq!(status.buffers_in_flight, 1);
        assert_eq!(status.buffer_count, Some(3));
        assert_eq!(status.codec.as_deref(), Some("MP3"));
    }

    #[test]
    fn buffering_never_starts_the_device() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 100, 418);
        player.play().unwrap();
        assert_eq!(player.state(), RunState::Buffering);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn refill_submits_only_unread_packets() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);
        feed(&player, 2, 418);

        assert!(backend.complete_next());

        let enqueues = backend.enqueues();
        assert_eq!(enqueues.len(), 2);
        assert_eq!(enqueues[1].packets, 2);
        assert_eq!(enqueues[1].slot, enqueues[0].slot);
        let status = player.status();
        assert_eq!(status.packets_submitted, 117);
        assert_eq!(status.packets_submitted, status.packets_received);
        assert_eq!(status.starvation_events, 0);
    }

    #[test]
    fn refill_window_is_five_seconds() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);
        // Parked buffers pick up backlog as it arrives, so drain them first.
        feed(&player, 400, 418);
        let before = backend.enqueues().len();

        assert!(backend.complete_next());
        let enqueues = backend.enqueues();
        assert_eq!(enqueues.len(), before + 1);
        assert!(enqueues.iter().all(|e| e.packets <= 192));
        assert_eq!(enqueues[before].packets, 192);
    }

    #[test]
    fn vbr_buffers_carry_descriptors() {
        let backend = MockBackend::new();
        let format = StreamFormat {
            frames_per_packet: 0,
            ..mp3_format()
        };
        let player = player_for(&backend, format);
        let sizes = [100usize, 250, 75, 1000];
        for i in 0..115 {
            player.receive(&vec![i as u8; sizes[i % 4]]).unwrap();
        }

        let enqueue = &backend.enqueues()[0];
        assert_eq!(enqueue.packets, 115);
        let mut offset = 0;
        for (i, desc) in enqueue.descriptors.iter().enumerate() {
            assert_eq!(
                *desc,
                PacketDescriptor {
                    start_offset: offset,
                    byte_size: sizes[i % 4],
                }
            );
            offset += sizes[i % 4];
        }
        assert_eq!(enqueue.bytes, offset);
        assert_eq!(enqueue.bytes, player.store().total_bytes(0..115));
    }

    #[test]
    fn stop_twice_resets_device_once() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);

        player.stop();
        player.stop();

        assert_eq!(player.state(), RunState::Stopped);
        assert_eq!(backend.count(|c| *c == DeviceCall::Stop), 1);
        assert_eq!(backend.count(|c| *c == DeviceCall::Reset), 1);
        assert_eq!(backend.held(), 0);
        let status = player.status();
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Stopped));
        assert_eq!(status.buffers_in_flight, 0);
        assert!(player.wait_until_stopped(Duration::from_millis(1)));
    }

    #[test]
    fn receive_after_stop_is_rejected() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 3, 418);
        player.stop();
        let err = player.receive(&[0; 418]).unwrap_err();
        assert!(matches!(
            err,
            PlayerError::InvalidState {
                op: "receive",
                state: RunState::Stopped
            }
        ));
        assert!(player.play().is_err());
    }

    #[test]
    fn device_config_failure_stops_player() {
        let backend = MockBackend::new();
        backend.fail_configure();
        let player = player_for(&backend, mp3_format());
        feed(&player, 114, 418);

        let err = player.receive(&[0; 418]).unwrap_err();
        assert!(matches!(err, PlayerError::DeviceConfig(_)));
        assert_eq!(player.state(), RunState::Stopped);
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Error));
        assert_eq!(starts(&backend), 0);
        assert!(player.last_error().is_some());
    }

    #[test]
    fn allocation_failure_tears_down_device() {
        let backend = MockBackend::new();
        backend.fail_allocate_at(1);
        let player = player_for(&backend, mp3_format());
        feed(&player, 114, 418);

        let err = player.receive(&[0; 418]).unwrap_err();
        assert!(matches!(err, PlayerError::BufferAllocation(_)));
        assert_eq!(player.state(), RunState::Stopped);
        assert_eq!(backend.count(|c| matches!(c, DeviceCall::Allocate { .. })), 2);
        assert_eq!(starts(&backend), 0);
        assert_eq!(backend.count(|c| *c == DeviceCall::Stop), 1);
        assert_eq!(backend.count(|c| *c == DeviceCall::Reset), 1);
    }

    #[test]
    fn enqueue_failure_aborts_with_internal_error() {
        let backend = MockBackend::new();
        backend.fail_enqueue();
        let player = player_for(&backend, mp3_format());
        feed(&player, 114, 418);

        let err = player.receive(&[0; 418]).unwrap_err();
        assert!(matches!(err, PlayerError::Internal(_)));
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Error));
    }

    #[test]
    fn stale_notification_after_stop_is_ignored() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 120, 418);
        let buffer = backend.take_held().unwrap();
        let notifier = backend.notifier().unwrap();

        player.stop();
        let calls = backend.calls().len();
        notifier.buffer_consumed(buffer);

        assert_eq!(backend.calls().len(), calls);
        assert_eq!(player.status().packets_submitted, 115);
    }

    #[test]
    fn notification_after_player_dropped_is_ignored() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);
        let buffer = backend.take_held().unwrap();
        let notifier = backend.notifier().unwrap();

        drop(player);
        notifier.buffer_consumed(buffer);
        assert_eq!(backend.enqueues().len(), 1);
    }

    #[test]
    fn starved_buffer_parks_and_resumes_on_backlog() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);

        assert!(backend.complete_next());
        let status = player.status();
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.starvation_events, 1);
        assert_eq!(status.buffers_in_flight, 0);

        // One second at 38.28 packets/s rounds up to 39.
        feed(&player, 38, 418);
        assert_eq!(backend.enqueues().len(), 1);
        feed(&player, 1, 418);
        let enqueues = backend.enqueues();
        assert_eq!(enqueues.len(), 2);
        assert_eq!(enqueues[1].packets, 39);
        assert_eq!(player.status().packets_submitted, 154);
    }

    #[test]
    fn pause_parks_consumed_buffers_until_play() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);

        player.pause().unwrap();
        assert_eq!(player.state(), RunState::Paused);
        assert_eq!(backend.count(|c| *c == DeviceCall::Pause), 1);

        assert!(backend.complete_next());
        feed(&player, 10, 418);
        assert_eq!(backend.enqueues().len(), 1);
        assert_eq!(player.status().buffers_in_flight, 0);
        assert_eq!(player.status().starvation_events, 0);

        player.play().unwrap();
        assert_eq!(player.state(), RunState::Running);
        assert_eq!(starts(&backend), 2);
        let enqueues = backend.enqueues();
        assert_eq!(enqueues.len(), 2);
        assert_eq!(enqueues[1].packets, 10);
        assert_eq!(player.status().packets_submitted, 125);
    }

    #[test]
    fn pause_before_start_is_invalid() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        player.begin();
        assert_eq!(player.state(), RunState::Buffering);
        let err = player.pause().unwrap_err();
        assert!(matches!(
            err,
            PlayerError::InvalidState {
                op: "pause",
                state: RunState::Buffering
            }
        ));
    }

    #[test]
    fn finish_drains_then_stops_with_eof() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);
        feed(&player, 5, 418);
        player.finish().unwrap();

        // The remaining packets go out in a parked buffer immediately.
        let enqueues = backend.enqueues();
        assert_eq!(enqueues.len(), 2);
        assert_eq!(enqueues[1].packets, 5);

        assert!(backend.complete_next());
        assert_eq!(player.state(), RunState::Running);
        assert!(backend.complete_next());

        let status = player.status();
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Eof));
        assert_eq!(status.starvation_events, 0);
        assert_eq!(status.packets_submitted, 120);
        assert_eq!(backend.count(|c| *c == DeviceCall::Reset), 1);
        assert!(player.wait_until_stopped(Duration::from_millis(1)));
    }

    #[test]
    fn short_stream_starts_on_finish() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 10, 418);
        assert_eq!(starts(&backend), 0);

        player.finish().unwrap();
        assert_eq!(player.state(), RunState::Running);
        assert_eq!(backend.enqueues()[0].packets, 10);

        assert!(backend.complete_next());
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Eof));
    }

    #[test]
    fn finish_collects_packets_the_demuxer_held_back() {
        let backend = MockBackend::new();
        let player = StreamingPlayer::new(
            backend.clone(),
            Box::new(AutoPacketParser::new(Some("wav"))),
            PlayerConfig::default(),
        );
        for chunk in wav_bytes(8_000, 800).chunks(256) {
            player.receive(chunk).unwrap();
        }
        assert_eq!(starts(&backend), 0);

        player.finish().unwrap();
        assert_eq!(player.store().total_appended_bytes(), 1600);
        assert!(backend.calls().contains(&DeviceCall::Configure {
            sample_rate: 8_000,
            channels: 1,
        }));
        assert_eq!(player.state(), RunState::Running);

        while backend.complete_next() {}
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Eof));
        assert_eq!(player.status().packets_submitted, player.store().count() as u64);
    }

    #[test]
    fn finish_without_audio_stops_immediately() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        player.begin();
        player.finish().unwrap();

        assert_eq!(player.state(), RunState::Stopped);
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Eof));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn parse_errors_are_counted_not_fatal() {
        let backend = MockBackend::new();
        let parser = ChunkPacketParser::failing_once(
            mp3_format(),
            ParseError::LostSync {
                offset: 0,
                skipped: 70_000,
            },
        );
        let player = StreamingPlayer::new(backend.clone(), Box::new(parser), PlayerConfig::default());

        let err = player.receive(&[1; 418]).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(player.store().count(), 1);
        assert_eq!(player.status().parse_errors, 1);

        feed(&player, 114, 418);
        assert_eq!(player.state(), RunState::Running);
    }

    #[test]
    fn oversized_packet_aborts_session() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        feed(&player, 115, 418);
        let capacity = player.status().buffer_capacity_bytes.unwrap();

        player.receive(&vec![0; capacity + 1]).unwrap();
        assert!(backend.complete_next());

        let status = player.status();
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Error));
        assert!(player.last_error().unwrap().contains("exceeds buffer capacity"));
    }

    #[test]
    fn concurrent_receive_and_refill_keep_cursor_behind_store() {
        let backend = MockBackend::new();
        let player = player_for(&backend, mp3_format());
        let writer = player.clone();

        let handle = thread::spawn(move || {
            for i in 0..1_500usize {
                writer.receive(&vec![(i % 251) as u8; 200 + i % 300]).unwrap();
            }
            writer.finish().unwrap();
        });

        loop {
            let status = player.status();
            assert!(status.packets_submitted <= status.packets_received);
            if status.state == RunState::Stopped {
                break;
            }
            if !backend.complete_next() {
                thread::yield_now();
            }
        }
        handle.join().unwrap();

        let status = player.status();
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Eof));
        assert_eq!(status.packets_submitted, 1_500);
        let submitted: usize = backend.enqueues().iter().map(|e| e.packets).sum();
        assert_eq!(submitted, 1_500);
    }

    #[test]
    fn mpeg_stream_drives_playback() {
        let mut frame = vec![0xFF, 0xFB, 0x90, 0x00];
        frame.resize(417, 0x55);
        let stream: Vec<u8> = frame.iter().copied().cycle().take(417 * 130).collect();

        let backend = MockBackend::new();
        let player = StreamingPlayer::new(
            backend.clone(),
            Box::new(MpegFrameParser::new()),
            PlayerConfig::default(),
        );
        for chunk in stream.chunks(4096) {
            player.receive(chunk).unwrap();
        }

        assert_eq!(player.state(), RunState::Running);
        assert_eq!(backend.calls()[0], DeviceCall::Configure {
            sample_rate: 44_100,
            channels: 2,
        });
        let enqueue = &backend.enqueues()[0];
        assert_eq!(enqueue.packets, 115);
        assert!(enqueue.descriptors.iter().all(|d| d.byte_size == 417));
    }
}
