//! Stream demux stage.
//!
//! Raw bytes from the transport are handed to a [`PacketParser`] which splits them
//! into compressed packets. [`StreamDemuxer`] wraps a parser and guarantees the
//! event order the player relies on:
//! - `FormatReady` at most once, before any packets
//! - `PacketsReady` zero or more times, in feed order
//!
//! Parsers: [`MpegFrameParser`] for elementary MPEG audio, [`SymphoniaPacketParser`]
//! for other containers, and [`AutoPacketParser`] to choose between them.

use std::ops::Range;

use crate::error::ParseError;
use crate::format::StreamFormat;
use crate::packet::Packet;

pub mod auto;
pub mod container;
pub mod mpeg;

pub use auto::AutoPacketParser;
pub use container::SymphoniaPacketParser;
pub use mpeg::MpegFrameParser;

/// Output of one parse step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DemuxEvent {
    /// Stream format is known.
    FormatReady(StreamFormat),
    /// Complete packets, with the absolute stream byte range they were cut from.
    PacketsReady {
        packets: Vec<Packet>,
        byte_range: Range<u64>,
    },
}

/// Opaque demux capability: turns a byte stream into packets.
///
/// Implementations are stateful across calls and must consume chunks strictly in
/// the order they are given. Events produced before an error are kept valid.
pub trait PacketParser: Send {
    fn parse(&mut self, bytes: &[u8], events: &mut Vec<DemuxEvent>) -> Result<(), ParseError>;

    /// No more bytes will arrive; emit whatever is still held back.
    fn finish(&mut self, _events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Ordering-checked adapter around a [`PacketParser`].
pub struct StreamDemuxer {
    parser: Box<dyn PacketParser>,
    format: Option<StreamFormat>,
    bytes_fed: u64,
    packets_emitted: u64,
    scratch: Vec<DemuxEvent>,
}

impl StreamDemuxer {
    pub fn new(parser: Box<dyn PacketParser>) -> Self {
        Self {
            parser,
            format: None,
            bytes_fed: 0,
            packets_emitted: 0,
            scratch: Vec::new(),
        }
    }

    /// Format reported by the parser, if any.
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    /// Total bytes handed to the parser.
    pub fn bytes_fed(&self) -> u64 {
        self.bytes_fed
    }

    /// Total packets forwarded.
    pub fn packets_emitted(&self) -> u64 {
        self.packets_emitted
    }

    /// Feed one chunk and append the resulting events to `events`.
    ///
    /// Events pushed before an `Err` return are valid and must still be consumed.
    pub fn feed(&mut self, raw: &[u8], events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        self.bytes_fed += raw.len() as u64;
        self.scratch.clear();
        let parsed = self.parser.parse(raw, &mut self.scratch);
        self.forward(parsed, events)
    }

    /// Flush the parser at end of stream. Same event guarantees as [`feed`](Self::feed).
    pub fn finish(&mut self, events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
        self.scratch.clear();
        let parsed = self.parser.finish(&mut self.scratch);
        self.forward(parsed, events)
    }

    fn forward(
        &mut self,
        parsed: Result<(), ParseError>,
        events: &mut Vec<DemuxEvent>,
    ) -> Result<(), ParseError> {
        let mut violation = None;
        for event in self.scratch.drain(..) {
            match event {
                DemuxEvent::FormatReady(format) => {
                    if let Some(existing) = self.format {
                        if existing != format {
                            tracing::warn!(
                                ?existing,
                                ignored = ?format,
                                "demuxer reported a second stream format"
                            );
                        }
                        continue;
                    }
                    tracing::info!(
                        sample_rate = format.sample_rate,
                        frames_per_packet = format.frames_per_packet,
                        channels = format.channels,
                        codec = format.codec_name().unwrap_or("unknown"),
                        "stream format ready"
                    );
                    self.format = Some(format);
                    events.push(DemuxEvent::FormatReady(format));
                }
                DemuxEvent::PacketsReady {
                    packets,
                    byte_range,
                } => {
                    if packets.is_empty() {
                        continue;
                    }
                    if self.format.is_none() {
                        violation.get_or_insert(ParseError::PacketsBeforeFormat {
                            offset: byte_range.start,
                        });
                        continue;
                    }
                    self.packets_emitted += packets.len() as u64;
                    events.push(DemuxEvent::PacketsReady {
                        packets,
                        byte_range,
                    });
                }
            }
        }

        parsed?;
        match violation {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed script of parse results.
    struct ScriptedParser {
        steps: Vec<(Vec<DemuxEvent>, Option<ParseError>)>,
    }

    impl PacketParser for ScriptedParser {
        fn parse(&mut self, _bytes: &[u8], events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
            if self.steps.is_empty() {
                return Ok(());
            }
            let (out, err) = self.steps.remove(0);
            events.extend(out);
            match err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn format(rate: u32) -> StreamFormat {
        StreamFormat {
            sample_rate: rate,
            frames_per_packet: 1152,
            channels: 2,
            ..StreamFormat::default()
        }
    }

    fn packets(n: usize, start: u64) -> DemuxEvent {
        DemuxEvent::PacketsReady {
            packets: (0..n).map(|_| Packet::new(vec![0u8; 4])).collect(),
            byte_range: start..start + 4 * n as u64,
        }
    }

    #[test]
    fn second_format_is_dropped() {
        let mut demux = StreamDemuxer::new(Box::new(ScriptedParser {
            steps: vec![
                (vec![DemuxEvent::FormatReady(format(44_100)), packets(2, 0)], None),
                (vec![DemuxEvent::FormatReady(format(48_000)), packets(1, 8)], None),
            ],
        }));
        let mut events = Vec::new();
        demux.feed(&[0; 8], &mut events).unwrap();
        demux.feed(&[0; 4], &mut events).unwrap();

        let formats = events
            .iter()
            .filter(|e| matches!(e, DemuxEvent::FormatReady(_)))
            .count();
        assert_eq!(formats, 1);
        assert_eq!(demux.format().unwrap().sample_rate, 44_100);
        assert_eq!(demux.packets_emitted(), 3);
        assert_eq!(demux.bytes_fed(), 12);
    }

    #[test]
    fn packets_before_format_are_rejected() {
        let mut demux = StreamDemuxer::new(Box::new(ScriptedParser {
            steps: vec![(vec![packets(2, 100)], None)],
        }));
        let mut events = Vec::new();
        let err = demux.feed(&[0; 8], &mut events).unwrap_err();
        assert_eq!(err, ParseError::PacketsBeforeFormat { offset: 100 });
        assert!(events.is_empty());
    }

    #[test]
    fn events_before_parser_error_are_kept() {
        let mut demux = StreamDemuxer::new(Box::new(ScriptedParser {
            steps: vec![(
                vec![DemuxEvent::FormatReady(format(44_100)), packets(3, 0)],
                Some(ParseError::LostSync {
                    offset: 12,
                    skipped: 70_000,
                }),
            )],
        }));
        let mut events = Vec::new();
        let err = demux.feed(&[0; 16], &mut events).unwrap_err();
        assert!(matches!(err, ParseError::LostSync { .. }));
        assert_eq!(events.len(), 2);
        assert_eq!(demux.packets_emitted(), 3);
    }

    /// Holds every packet back until end of stream.
    struct DeferredParser {
        held: Vec<DemuxEvent>,
    }

    impl PacketParser for DeferredParser {
        fn parse(&mut self, bytes: &[u8], _events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
            if self.held.is_empty() {
                self.held.push(DemuxEvent::FormatReady(format(48_000)));
            }
            self.held.push(DemuxEvent::PacketsReady {
                packets: vec![Packet::new(bytes.to_vec())],
                byte_range: 0..bytes.len() as u64,
            });
            Ok(())
        }

        fn finish(&mut self, events: &mut Vec<DemuxEvent>) -> Result<(), ParseError> {
            events.append(&mut self.held);
            Ok(())
        }
    }

    #[test]
    fn finish_forwards_held_back_events() {
        let mut demux = StreamDemuxer::new(Box::new(DeferredParser { held: Vec::new() }));
        let mut events = Vec::new();
        demux.feed(&[1; 4], &mut events).unwrap();
        demux.feed(&[2; 4], &mut events).unwrap();
        assert!(events.is_empty());
        assert!(demux.format().is_none());

        demux.finish(&mut events).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(demux.format().unwrap().sample_rate, 48_000);
        assert_eq!(demux.packets_emitted(), 2);
    }

    #[test]
    fn empty_packet_batches_are_skipped() {
        let mut demux = StreamDemuxer::new(Box::new(ScriptedParser {
            steps: vec![(
                vec![
                    DemuxEvent::FormatReady(format(44_100)),
                    DemuxEvent::PacketsReady {
                        packets: Vec::new(),
                        byte_range: 0..0,
                    },
                ],
                None,
            )],
        }));
        let mut events = Vec::new();
        demux.feed(&[], &mut events).unwrap();
        assert_eq!(events.len(), 1);
    }
}
