//! Stream format metadata and buffer/timing calculations.
//!
//! The same sizing rules serve both playback paths:
//! - streaming playback sizes its fixed buffers for the refill window
//! - local-file playback sizes buffers for a short read-ahead

use std::sync::{Arc, OnceLock};

use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, CodecType};

use crate::error::ParseError;

/// Upper bound for a single hardware buffer (320 KiB).
pub const MAX_BUFFER_SIZE: usize = 0x50000;
/// Lower bound for a single hardware buffer (16 KiB).
pub const MIN_BUFFER_SIZE: usize = 0x4000;

/// Packet rate assumed before a format with a known frames-per-packet arrives
/// (44.1 kHz MPEG Layer III).
pub const FALLBACK_FRAMES_PER_SECOND: f64 = 44_100.0 / 1152.0;

/// Format metadata reported once by the demuxer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// PCM frames carried by each packet; 0 when variable.
    pub frames_per_packet: u32,
    /// Bytes per packet; 0 when variable.
    pub bytes_per_packet: u32,
    /// Bytes per PCM frame; 0 for compressed formats.
    pub bytes_per_frame: u32,
    /// Channel count.
    pub channels: u16,
    /// Codec carried by the packets.
    pub codec: CodecType,
    /// Largest packet the stream can contain, 0 when unknown.
    pub max_packet_size: u32,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 0,
            frames_per_packet: 0,
            bytes_per_packet: 0,
            bytes_per_frame: 0,
            channels: 0,
            codec: CODEC_TYPE_NULL,
            max_packet_size: 0,
        }
    }
}

impl StreamFormat {
    /// `true` when packets vary in size and need per-packet descriptors.
    pub fn is_vbr(&self) -> bool {
        self.frames_per_packet == 0 || self.bytes_per_packet == 0
    }

    /// Packets per second of audio.
    pub fn frames_per_second(&self) -> f64 {
        if self.frames_per_packet > 0 && self.sample_rate > 0 {
            self.sample_rate as f64 / self.frames_per_packet as f64
        } else {
            FALLBACK_FRAMES_PER_SECOND
        }
    }

    /// Packets needed to cover `seconds` of audio, rounded up.
    pub fn packets_for_seconds(&self, seconds: f64) -> usize {
        let packets = (self.frames_per_second() * seconds).ceil();
        if packets.is_finite() && packets > 0.0 {
            packets as usize
        } else {
            0
        }
    }

    /// Playback duration of `packets` packets.
    pub fn seconds_for_packets(&self, packets: usize) -> f64 {
        packets as f64 / self.frames_per_second()
    }

    /// Best-effort codec label for status output.
    pub fn codec_name(&self) -> Option<&'static str> {
        codec_name(self.codec)
    }
}

/// Byte capacity and packet count for one hardware buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSizing {
    pub buffer_size: usize,
    pub packets_to_read: usize,
}

/// Compute a buffer capacity that holds `seconds` of audio.
///
/// With a known frames-per-packet the size is `packets_for_time * max_packet_size`;
/// otherwise it is the larger of the ceiling and `max_packet_size`. The result is
/// clamped to [`MIN_BUFFER_SIZE`, `MAX_BUFFER_SIZE`] but never smaller than one
/// packet, so a packet larger than the ceiling yields exactly `max_packet_size`.
pub fn derive_buffer_size(
    format: &StreamFormat,
    max_packet_size: usize,
    seconds: f64,
) -> BufferSizing {
    let max_packet = max_packet_size.max(1);

    let mut size = if format.frames_per_packet != 0 && format.sample_rate != 0 {
        let packets_for_time =
            format.sample_rate as f64 / format.frames_per_packet as f64 * seconds;
        let packets = if packets_for_time.is_finite() && packets_for_time > 0.0 {
            packets_for_time as usize
        } else {
            0
        };
        packets.saturating_mul(max_packet)
    } else {
        MAX_BUFFER_SIZE.max(max_packet)
    };

    if size > MAX_BUFFER_SIZE {
        size = MAX_BUFFER_SIZE.max(max_packet);
    } else if size < MIN_BUFFER_SIZE {
        size = MIN_BUFFER_SIZE;
    }
    size = size.max(max_packet);

    BufferSizing {
        buffer_size: size,
        packets_to_read: (size / max_packet).max(1),
    }
}

/// Container codec parameters published by a demuxer once the stream is probed.
///
/// Carries decoder setup data (FLAC stream info, Vorbis headers) that does not fit
/// in [`StreamFormat`].
pub type SharedCodecParams = Arc<OnceLock<CodecParameters>>;

/// Derive packet metadata from container codec parameters.
pub fn stream_format_from_params(params: &CodecParameters) -> Result<StreamFormat, ParseError> {
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| ParseError::Unsupported("unknown sample rate".into()))?;
    let channels = params
        .channels
        .map(|c| c.count())
        .ok_or_else(|| ParseError::Unsupported("unknown channel layout".into()))?;
    let channels = u16::try_from(channels)
        .map_err(|_| ParseError::Unsupported(format!("{channels} channels")))?;

    let frames_per_packet = params
        .max_frames_per_packet
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    let bytes_per_frame = if is_pcm(params.codec) {
        params
            .bits_per_coded_sample
            .or(params.bits_per_sample)
            .map_or(0, |bits| bits / 8 * u32::from(channels))
    } else {
        0
    };
    let bytes_per_packet = bytes_per_frame.saturating_mul(frames_per_packet);

    Ok(StreamFormat {
        sample_rate,
        frames_per_packet,
        bytes_per_packet,
        bytes_per_frame,
        channels,
        codec: params.codec,
        max_packet_size: bytes_per_packet,
    })
}

fn is_pcm(codec: CodecType) -> bool {
    use symphonia::core::codecs::*;
    matches!(
        codec,
        CODEC_TYPE_PCM_S16LE
            | CODEC_TYPE_PCM_S16BE
            | CODEC_TYPE_PCM_S24LE
            | CODEC_TYPE_PCM_S24BE
            | CODEC_TYPE_PCM_S32LE
            | CODEC_TYPE_PCM_S32BE
            | CODEC_TYPE_PCM_F32LE
            | CODEC_TYPE_PCM_F32BE
            | CODEC_TYPE_PCM_U8
            | CODEC_TYPE_PCM_S8
    )
}

/// Best-effort codec label used for status payloads.
pub fn codec_name(codec: CodecType) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match codec {
        CODEC_TYPE_MP1 => "MP1",
        CODEC_TYPE_MP2 => "MP2",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}
