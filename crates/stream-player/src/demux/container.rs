//! Container demux through symphonia's format readers.
//!
//! Pushed transport bytes go into a blocking feed that a demux thread reads as a
//! non-seekable [`MediaSource`]. The thread probes the container, reports the
//! default track's format, then forwards packets as the reader produces them.
//! [`parse`](PacketParser::parse) never waits for that thread: it returns what has
//! been read so far. [`finish`](PacketParser::finish) closes the feed and waits for
//! the remaining packets.
//!
//! Only forward-readable containers work here (Ogg, FLAC, ADTS, WAV, MP3). Chained
//! Ogg streams end at the first logical stream reset.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{DemuxEvent, PacketParser};
use crate::error::ParseError;
use crate::format::{SharedCodecParams, StreamFormat, stream_format_from_params};
use crate::packet::Packet;

/// Parser backed by a symphonia format reader on its own thread.
pub struct SymphoniaPacketParser {
    extension: Option<String>,
    codec_params: SharedCodecParams,
    feed: Arc<Feed>,
    messages: Option<Receiver<DemuxMessage>>,
    worker: Option<JoinHandle<()>>,
    /// End of the byte range reported with the last packet batch.
    reported_to: u64,
}

enum DemuxMessage {
    Format(StreamFormat),
    Packet { packet: Packet, consumed: u64 },
    Failed(ParseError),
}

impl SymphoniaPacketParser {
    /// `extension` is a probe hint, typically taken from the stream URL.
    pub fn new(extension: Option<&str>, codec_params: SharedCodecParams) -> Self {
        Self {
            extension: extension.map(str::to_string),
            codec_params,
            feed: Arc::new(Feed::default()),
            messages: None,
            worker: None,
            reported_to: 0,
        }
    }

    /// Slot the probed codec parameters are published to.
    pub fn codec_params(&self) -> &SharedCodecParams {
        &self.codec_params
    }

    fn ensure_started(&mut self) -> Result<(), ParseError> {
        if self.messages.is_some() {
            return Ok(());
        }

        let mut hint = Hint::new();
        if let Some(ext) = self.extension.as_deref() {
            hint.with_extension(ext);
        }
        let consumed = Arc::new(AtomicU64::new(0));
        let source = FeedSource {
            feed: self.feed.clone(),
            consumed: consumed.clone(),
        };
        let codec_params = self.codec_params.clone();
        let (tx, rx) = crossbeam_channel::unbounded();

        let worker = thread::Builder::new()
            .name("stream-demux".into())
            .spawn(move || run_demux(source, hint, codec_params, consumed, tx))
            .map_err(|err| ParseError::Unsupported(format!("spawn demux thread: {err}")))?;
        self.messages = Some(rx);
        self.worker = Some(worker);
        Ok(())
    }

    fn collect(
        &mut self,
        messages: impl Iterator<Item = DemuxMessage>,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<(), ParseError> {
        let mut packets = Vec::new();
        let start = self.reported_to;
        let mut failure = None;

        for message in messages {
            match message {
                DemuxMessage::Format(format) => events.push(DemuxEvent::FormatReady(format)),
                DemuxMessage::Packet { packet, consumed } => {
                    self.reported_to = self.reported_to.max(consumed);
                    packets.push(packet);
                }
                DemuxMessage::Failed(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if !packets.is_empty() {
            events.push(DemuxEvent::PacketsReady {
                packets,
                byte_range: start..self.reported_to,
            });
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl PacketParser for SymphoniaPacketParser {
    fn parse(&mut self, bytes: &[u8], events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        self.ensure_started()?;
        if !bytes.is_empty() {
            self.feed.push(bytes);
        }
        let Some(messages) = self.messages.clone() else {
            return Ok(());
        };
        self.collect(messages.try_iter(), events)
    }

    fn finish(&mut self, events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        self.feed.close();
        let Some(messages) = self.messages.take() else {
            return Ok(());
        };
        // The demux thread drops its sender once the reader hits the closed feed.
        let collected = self.collect(messages.iter(), events);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("demux thread panicked");
            }
        }
        collected
    }
}

impl Drop for SymphoniaPacketParser {
    fn drop(&mut self) {
        self.feed.close();
    }
}

fn run_demux(
    source: FeedSource,
    hint: Hint,
    codec_params: SharedCodecParams,
    consumed: Arc<AtomicU64>,
    messages: Sender<DemuxMessage>,
) {
    let mss = MediaSourceStream::new(Box::new(source), Default::default());
    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(err) => {
            let _ = messages.send(DemuxMessage::Failed(ParseError::Unsupported(format!(
                "container probe failed: {err}"
            ))));
            return;
        }
    };

    let mut reader = probed.format;
    let Some(track) = reader.default_track() else {
        let _ = messages.send(DemuxMessage::Failed(ParseError::Unsupported(
            "no default audio track".into(),
        )));
        return;
    };
    let track_id = track.id;
    let params = track.codec_params.clone();
    let format = match stream_format_from_params(&params) {
        Ok(format) => format,
        Err(err) => {
            let _ = messages.send(DemuxMessage::Failed(err));
            return;
        }
    };
    let _ = codec_params.set(params);
    tracing::debug!(
        track_id,
        consumed = consumed.load(Ordering::Relaxed),
        "container probed"
    );
    if messages.send(DemuxMessage::Format(format)).is_err() {
        return;
    }

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) if packet.track_id() != track_id => continue,
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(consumed = consumed.load(Ordering::Relaxed), "container ended");
                return;
            }
            Err(SymphoniaError::ResetRequired) => {
                tracing::warn!("container stream changed, ending demux");
                return;
            }
            Err(err) => {
                let _ = messages.send(DemuxMessage::Failed(ParseError::Unsupported(format!(
                    "container read failed: {err}"
                ))));
                return;
            }
        };
        let message = DemuxMessage::Packet {
            packet: Packet::new(packet.data),
            consumed: consumed.load(Ordering::Relaxed),
        };
        if messages.send(message).is_err() {
            return;
        }
    }
}

/// Byte chunks handed over from the network context.
#[derive(Default)]
struct Feed {
    state: Mutex<FeedState>,
    ready: Condvar,
}

#[derive(Default)]
struct FeedState {
    chunks: VecDeque<Vec<u8>>,
    front_pos: usize,
    closed: bool,
}

impl Feed {
    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, bytes: &[u8]) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.chunks.push_back(bytes.to_vec());
        self.ready.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Copy buffered bytes into `out`, waiting while the feed is empty and open.
    fn read(&self, out: &mut [u8]) -> usize {
        let mut st = self.lock();
        loop {
            if let Some(front) = st.chunks.front() {
                let start = st.front_pos;
                let n = out.len().min(front.len() - start);
                out[..n].copy_from_slice(&front[start..start + n]);
                let exhausted = start + n == front.len();
                if exhausted {
                    st.chunks.pop_front();
                    st.front_pos = 0;
                } else {
                    st.front_pos += n;
                }
                return n;
            }
            if st.closed {
                return 0;
            }
            st = self.ready.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Forward-only [`MediaSource`] over a [`Feed`].
struct FeedSource {
    feed: Arc<Feed>,
    consumed: Arc<AtomicU64>,
}

impl Read for FeedSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let n = self.feed.read(out);
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl Seek for FeedSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.consumed.load(Ordering::Relaxed)),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "network stream is not seekable",
            )),
        }
    }
}

impl MediaSource for FeedSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
