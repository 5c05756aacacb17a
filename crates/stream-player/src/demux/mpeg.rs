//! Incremental MPEG audio (Layer I/II/III) frame parser.
//!
//! Splits an elementary MPEG audio byte stream into one packet per frame. Frames
//! may be split across any number of chunks. ID3v2 tags are skipped, and bytes
//! that do not form a valid frame are discarded until sync is found again.
//!
//! The first frame is only accepted when the following header is also valid, which
//! keeps stray `0xFFE` patterns in tags or garbage from fixing the wrong format.

use symphonia::core::codecs::{CODEC_TYPE_MP1, CODEC_TYPE_MP2, CODEC_TYPE_MP3, CodecType};

use super::{DemuxEvent, PacketParser};
use crate::error::ParseError;
use crate::format::StreamFormat;
use crate::packet::Packet;

/// Garbage tolerated before a lost-sync error is reported.
pub const MAX_RESYNC_BYTES: usize = 64 * 1024;

const HEADER_LEN: usize = 4;
const ID3_HEADER_LEN: usize = 10;

const BITRATES_V1_L1: [u32; 15] = [
    0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
];
const BITRATES_V1_L2: [u32; 15] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
];
const BITRATES_V1_L3: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const BITRATES_V2_L1: [u32; 15] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
];
const BITRATES_V2_L23: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MpegVersion {
    V1,
    V2,
    V25,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MpegLayer {
    L1,
    L2,
    L3,
}

/// Decoded 32-bit frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub(crate) version: MpegVersion,
    pub(crate) layer: MpegLayer,
    pub(crate) bitrate_kbps: u32,
    pub(crate) sample_rate: u32,
    pub(crate) padding: bool,
    pub(crate) channels: u16,
}

impl FrameHeader {
    /// Parse a header from the first four bytes of `b`.
    pub(crate) fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < HEADER_LEN || b[0] != 0xFF || b[1] & 0xE0 != 0xE0 {
            return None;
        }
        let version = match (b[1] >> 3) & 0x03 {
            0 => MpegVersion::V25,
            2 => MpegVersion::V2,
            3 => MpegVersion::V1,
            _ => return None,
        };
        let layer = match (b[1] >> 1) & 0x03 {
            1 => MpegLayer::L3,
            2 => MpegLayer::L2,
            3 => MpegLayer::L1,
            _ => return None,
        };
        let bitrate_index = (b[2] >> 4) as usize;
        // Free-format (0) and bad (15) bitrates cannot be delimited from the header.
        if bitrate_index == 0 || bitrate_index == 15 {
            return None;
        }
        let rate_index = ((b[2] >> 2) & 0x03) as usize;
        if rate_index == 3 {
            return None;
        }
        if b[3] & 0x03 == 2 {
            return None;
        }

        let base_rate = [44_100u32, 48_000, 32_000][rate_index];
        let sample_rate = match version {
            MpegVersion::V1 => base_rate,
            MpegVersion::V2 => base_rate / 2,
            MpegVersion::V25 => base_rate / 4,
        };

        Some(Self {
            version,
            layer,
            bitrate_kbps: bitrate_table(version, layer)[bitrate_index],
            sample_rate,
            padding: (b[2] >> 1) & 0x01 == 1,
            channels: if b[3] >> 6 == 3 { 1 } else { 2 },
        })
    }

    pub(crate) fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (MpegLayer::L1, _) => 384,
            (MpegLayer::L2, _) => 1152,
            (MpegLayer::L3, MpegVersion::V1) => 1152,
            (MpegLayer::L3, _) => 576,
        }
    }

    /// Total frame length in bytes, header included.
    pub(crate) fn frame_len(&self) -> usize {
        frame_len(self.layer, self.samples_per_frame(), self.bitrate_kbps, self.sample_rate, self.padding)
    }

    /// Largest frame this version/layer/sample-rate combination can produce.
    pub(crate) fn max_frame_len(&self) -> usize {
        let top = bitrate_table(self.version, self.layer)[14];
        frame_len(self.layer, self.samples_per_frame(), top, self.sample_rate, true)
    }

    /// Whether `other` can belong to the same stream.
    fn compatible_with(&self, other: &FrameHeader) -> bool {
        self.version == other.version
            && self.layer == other.layer
            && self.sample_rate == other.sample_rate
    }

    fn codec(&self) -> CodecType {
        match self.layer {
            MpegLayer::L1 => CODEC_TYPE_MP1,
            MpegLayer::L2 => CODEC_TYPE_MP2,
            MpegLayer::L3 => CODEC_TYPE_MP3,
        }
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            frames_per_packet: self.samples_per_frame(),
            bytes_per_packet: 0,
            bytes_per_frame: 0,
            channels: self.channels,
            codec: self.codec(),
            max_packet_size: self.max_frame_len() as u32,
        }
    }
}

fn bitrate_table(version: MpegVersion, layer: MpegLayer) -> &'static [u32; 15] {
    match (version, layer) {
        (MpegVersion::V1, MpegLayer::L1) => &BITRATES_V1_L1,
        (MpegVersion::V1, MpegLayer::L2) => &BITRATES_V1_L2,
        (MpegVersion::V1, MpegLayer::L3) => &BITRATES_V1_L3,
        (_, MpegLayer::L1) => &BITRATES_V2_L1,
        (_, _) => &BITRATES_V2_L23,
    }
}

fn frame_len(layer: MpegLayer, samples: u32, bitrate_kbps: u32, sample_rate: u32, padding: bool) -> usize {
    let bitrate = bitrate_kbps as usize * 1000;
    let rate = sample_rate as usize;
    match layer {
        MpegLayer::L1 => (12 * bitrate / rate + padding as usize) * 4,
        _ => (samples as usize / 8) * bitrate / rate + padding as usize,
    }
}

/// Size of an ID3v2 tag starting at `b`, footer included, when the header is complete.
fn id3v2_len(b: &[u8]) -> Option<usize> {
    if b.len() < ID3_HEADER_LEN {
        return None;
    }
    let size = b[6..10]
        .iter()
        .fold(0usize, |acc, byte| (acc << 7) | (*byte & 0x7F) as usize);
    let footer = if b[5] & 0x10 != 0 { ID3_HEADER_LEN } else { 0 };
    Some(ID3_HEADER_LEN + size + footer)
}

/// [`PacketParser`] for MPEG audio elementary streams (`.mp3`, `.mp2`, `.mp1`).
#[derive(Debug, Default)]
pub struct MpegFrameParser {
    pending: Vec<u8>,
    /// Absolute stream offset of `pending[0]`.
    pending_offset: u64,
    tag_skip: usize,
    established: Option<FrameHeader>,
    garbage_run: usize,
    garbage_start: u64,
    loss_reported: bool,
}

impl MpegFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn discard_garbage(&mut self, pos: &mut usize, count: usize, err: &mut Option<ParseError>) {
        if self.garbage_run == 0 {
            self.garbage_start = self.pending_offset + *pos as u64;
        }
        *pos += count;
        self.garbage_run += count;
        if self.garbage_run > MAX_RESYNC_BYTES && !self.loss_reported {
            self.loss_reported = true;
            tracing::warn!(
                offset = self.garbage_start,
                skipped = self.garbage_run,
                "mpeg parser lost frame sync"
            );
            err.get_or_insert(ParseError::LostSync {
                offset: self.garbage_start,
                skipped: self.garbage_run,
            });
        }
    }
}

impl PacketParser for MpegFrameParser {
    fn parse(&mut self, bytes: &[u8], events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        self.pending.extend_from_slice(bytes);

        let mut pos = 0usize;
        let mut packets = Vec::new();
        let mut first_offset = None;
        let mut err = None;

        loop {
            if self.tag_skip > 0 {
                let skip = self.tag_skip.min(self.pending.len() - pos);
                pos += skip;
                self.tag_skip -= skip;
                if self.tag_skip > 0 {
                    break;
                }
            }

            let rest = &self.pending[pos..];
            if rest.len() < HEADER_LEN {
                break;
            }

            if rest.starts_with(b"ID3") {
                match id3v2_len(rest) {
                    Some(len) => {
                        tracing::debug!(offset = self.pending_offset + pos as u64, len, "skipping id3v2 tag");
                        self.tag_skip = len;
                        continue;
                    }
                    None => break,
                }
            }

            let header = match FrameHeader::parse(rest) {
                Some(h) if self.established.is_none_or(|e| e.compatible_with(&h)) => h,
                _ => {
                    // Jump to the next candidate sync byte.
                    let skip = rest[1..]
                        .iter()
                        .position(|b| *b == 0xFF)
                        .map(|i| i + 1)
                        .unwrap_or(rest.len());
                    self.discard_garbage(&mut pos, skip, &mut err);
                    continue;
                }
            };

            let len = header.frame_len();
            if rest.len() < len {
                break;
            }

            if self.established.is_none() {
                if rest.len() < len + HEADER_LEN {
                    break;
                }
                let confirmed = FrameHeader::parse(&rest[len..])
                    .is_some_and(|next| next.compatible_with(&header));
                if !confirmed {
                    self.discard_garbage(&mut pos, 1, &mut err);
                    continue;
                }
                self.established = Some(header);
                events.push(DemuxEvent::FormatReady(header.stream_format()));
            }

            first_offset.get_or_insert(self.pending_offset + pos as u64);
            packets.push(Packet::from_slice(&rest[..len]));
            pos += len;
            self.garbage_run = 0;
            self.loss_reported = false;
        }

        let end_offset = self.pending_offset + pos as u64;
        self.pending.drain(..pos);
        self.pending_offset = end_offset;

        if let Some(start) = first_offset {
            events.push(DemuxEvent::PacketsReady {
                packets,
                byte_range: start..end_offset,
            });
        }

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
