//! Picks a parser from the first bytes of a stream.
//!
//! Elementary MPEG audio (optionally behind an ID3v2 tag) goes to
//! [`MpegFrameParser`]; anything else, ADTS AAC included, goes to
//! [`SymphoniaPacketParser`].

use super::{DemuxEvent, MpegFrameParser, PacketParser, SymphoniaPacketParser};
use crate::error::ParseError;
use crate::format::SharedCodecParams;

const SNIFF_LEN: usize = 4;

/// Parser chosen from the stream's leading bytes.
pub struct AutoPacketParser {
    extension: Option<String>,
    codec_params: SharedCodecParams,
    sniffed: Vec<u8>,
    inner: Option<Box<dyn PacketParser>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Mpeg,
    Container,
}

impl AutoPacketParser {
    /// `extension` is passed on as a probe hint when symphonia is used.
    pub fn new(extension: Option<&str>) -> Self {
        Self {
            extension: extension.map(str::to_string),
            codec_params: SharedCodecParams::default(),
            sniffed: Vec::with_capacity(SNIFF_LEN),
            inner: None,
        }
    }

    /// Codec parameters published once a container has been probed.
    ///
    /// Stays empty on the MPEG path, where the format alone configures the decoder.
    pub fn codec_params(&self) -> SharedCodecParams {
        self.codec_params.clone()
    }

    fn select(&mut self, head: &[u8]) -> &mut Box<dyn PacketParser> {
        let codec_params = self.codec_params.clone();
        let extension = self.extension.as_deref();
        self.inner.get_or_insert_with(|| {
            let kind = sniff(head);
            tracing::debug!(?kind, "stream parser selected");
            let parser: Box<dyn PacketParser> = match kind {
                StreamKind::Mpeg => Box::new(MpegFrameParser::new()),
                StreamKind::Container => Box::new(SymphoniaPacketParser::new(extension, codec_params)),
            };
            parser
        })
    }
}

impl PacketParser for AutoPacketParser {
    fn parse(&mut self, bytes: &[u8], events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        if let Some(inner) = self.inner.as_mut() {
            return inner.parse(bytes, events);
        }
        self.sniffed.extend_from_slice(bytes);
        if self.sniffed.len() < SNIFF_LEN {
            return Ok(());
        }
        let head = std::mem::take(&mut self.sniffed);
        self.select(&head).parse(&head, events)
    }

    fn finish(&mut self, events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        if self.inner.is_none() {
            if self.sniffed.is_empty() {
                return Ok(());
            }
            let head = std::mem::take(&mut self.sniffed);
            self.select(&head).parse(&head, events)?;
        }
        match self.inner.as_mut() {
            Some(inner) => inner.finish(events),
            None => Ok(()),
        }
    }
}

/// Classify a stream by its first bytes.
pub(crate) fn sniff(head: &[u8]) -> StreamKind {
    match head {
        [b'I', b'D', b'3', ..] => StreamKind::Mpeg,
        // 11 sync bits; layer bits 00 mark ADTS rather than MPEG audio.
        [0xFF, b1, ..] if b1 & 0xE0 == 0xE0 && (b1 >> 1) & 0x03 != 0 => StreamKind::Mpeg,
        _ => StreamKind::Container,
    }
}
