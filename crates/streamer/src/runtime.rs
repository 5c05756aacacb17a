//! Streamer runtime helpers.
//!
//! Provides device enumeration, HTTP stream playback, and local-file playback.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use stream_player::demux::AutoPacketParser;
use stream_player::local_file::{FileSource, LocalFilePlayer};
use stream_player::output::{CpalBackend, OutputBackend};
use stream_player::player::StreamingPlayer;
use stream_player::{PlayerError, device};
use stream_player_types::{OutputStatus, PlaybackEndReason, PlayerStatus};

use crate::config::{PlayRunConfig, StatusConfig, StreamRunConfig};
use crate::http_source::HttpStreamSource;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    let names = device::list_devices(&host)?;
    if names.is_empty() {
        println!("no output devices");
    }
    for (index, name) in names.iter().enumerate() {
        println!("{index}: {name}");
    }
    Ok(())
}

/// Stream `config.url` until it ends, fails, or `cancel` is set.
pub fn run_stream(config: StreamRunConfig, cancel: Arc<AtomicBool>) -> Result<()> {
    let parser = AutoPacketParser::new(url_extension(&config.url).as_deref());
    let backend = CpalBackend::new(config.output.clone()).with_shared_codec_params(parser.codec_params());
    let player = StreamingPlayer::new(backend, Box::new(parser), config.player.clone());
    player.begin();

    let receiver = {
        let player = player.clone();
        let cancel = cancel.clone();
        let url = config.url.clone();
        let source_config = config.source.clone();
        thread::Builder::new()
            .name("stream-receiver".into())
            .spawn(move || -> Result<PumpSummary> {
                let chunk_bytes = source_config.chunk_bytes;
                let opened = HttpStreamSource::open(&url, source_config, Some(cancel.clone()))
                    .with_context(|| format!("open stream {url}"));
                let mut source = match opened {
                    Ok(source) => source,
                    Err(err) => {
                        player.stop();
                        return Err(err);
                    }
                };
                pump(&mut source, &player, chunk_bytes, &cancel)
            })
            .context("spawn stream receiver")?
    };

    monitor(&*player, &config.status, &cancel);

    if cancel.load(Ordering::Relaxed) {
        // The receiver may be parked in a blocking read; leave it behind.
        tracing::info!("playback canceled");
        return Ok(());
    }
    let summary = receiver
        .join()
        .map_err(|_| anyhow!("stream receiver panicked"))??;
    tracing::info!(chunks = summary.chunks, bytes = summary.bytes, "stream closed");
    finish_report(&*player)
}

/// Play a local file until it ends, fails, or `cancel` is set.
pub fn run_play(config: PlayRunConfig, cancel: Arc<AtomicBool>) -> Result<()> {
    let source = FileSource::open(&config.path).with_context(|| format!("open {:?}", config.path))?;
    let backend = CpalBackend::new(config.output.clone()).with_codec_params(source.codec_params().clone());
    let format = source.format();
    let player = LocalFilePlayer::new(backend, Box::new(source), format)?;
    player.play()?;

    monitor(&*player, &config.status, &cancel);
    finish_report(&*player)
}

/// File extension of the URL path, used as a container probe hint.
fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, segment) = path.rsplit_once('/')?;
    let (_, ext) = segment.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

/// Totals of one transport read loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub chunks: u64,
    pub bytes: u64,
    /// `true` when end of stream was signalled to the player.
    pub finished: bool,
}

/// Feed `source` into `player` in reads of up to `chunk_bytes` until the source ends.
///
/// Parse errors are logged and skipped. A transport error ends the stream early: what
/// has arrived is still played out.
pub fn pump<R, B>(
    source: &mut R,
    player: &StreamingPlayer<B>,
    chunk_bytes: usize,
    cancel: &AtomicBool,
) -> Result<PumpSummary>
where
    R: Read + ?Sized,
    B: OutputBackend + 'static,
{
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut summary = PumpSummary::default();

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(summary);
        }
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(error = %err, bytes = summary.bytes, "stream read failed, ending stream");
                break;
            }
        };
        summary.chunks += 1;
        summary.bytes += n as u64;

        match player.receive(&buf[..n]) {
            Ok(()) => {}
            Err(PlayerError::Parse(err)) => {
                tracing::debug!(error = %err, "skipping malformed stream data");
            }
            Err(PlayerError::InvalidState { .. }) => {
                tracing::debug!("player stopped, closing stream");
                return Ok(summary);
            }
            Err(err) => return Err(err).context("receive stream data"),
        }
    }

    player.finish().context("finish stream")?;
    summary.finished = true;
    Ok(summary)
}

/// Playback session as seen by the status loop.
trait Session {
    fn wait_until_stopped(&self, timeout: std::time::Duration) -> bool;
    fn status(&self) -> PlayerStatus;
    fn output_status(&self) -> Option<OutputStatus>;
    fn stop(&self);
    fn last_error(&self) -> Option<String>;
}

impl<B: OutputBackend + 'static> Session for StreamingPlayer<B> {
    fn wait_until_stopped(&self, timeout: std::time::Duration) -> bool {
        StreamingPlayer::wait_until_stopped(self, timeout)
    }

    fn status(&self) -> PlayerStatus {
        StreamingPlayer::status(self)
    }

    fn output_status(&self) -> Option<OutputStatus> {
        StreamingPlayer::output_status(self)
    }

    fn stop(&self) {
        StreamingPlayer::stop(self)
    }

    fn last_error(&self) -> Option<String> {
        StreamingPlayer::last_error(self)
    }
}

impl<B: OutputBackend + 'static> Session for LocalFilePlayer<B> {
    fn wait_until_stopped(&self, timeout: std::time::Duration) -> bool {
        LocalFilePlayer::wait_until_stopped(self, timeout)
    }

    fn status(&self) -> PlayerStatus {
        LocalFilePlayer::status(self)
    }

    fn output_status(&self) -> Option<OutputStatus> {
        LocalFilePlayer::output_status(self)
    }

    fn stop(&self) {
        LocalFilePlayer::stop(self)
    }

    fn last_error(&self) -> Option<String> {
        LocalFilePlayer::last_error(self)
    }
}

/// Report status every interval until the session stops; stop it on cancel.
fn monitor(session: &dyn Session, status: &StatusConfig, cancel: &AtomicBool) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            session.stop();
            return;
        }
        if session.wait_until_stopped(status.interval) {
            return;
        }
        report_status(&session.status(), session.output_status().as_ref(), status.json);
    }
}

#[derive(Serialize)]
struct StatusLine<'a> {
    player: &'a PlayerStatus,
    output: Option<&'a OutputStatus>,
}

fn report_status(player: &PlayerStatus, output: Option<&OutputStatus>, json: bool) {
    if json {
        match serde_json::to_string(&StatusLine { player, output }) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!("status serialization failed: {err}"),
        }
        return;
    }

    tracing::info!(
        state = ?player.state,
        received = player.packets_received,
        submitted = player.packets_submitted,
        buffered_s = player.buffered_seconds.unwrap_or_default(),
        in_flight = player.buffers_in_flight,
        starvation = player.starvation_events,
        parse_errors = player.parse_errors,
        played_frames = output.map(|o| o.played_frames).unwrap_or_default(),
        underruns = output.map(|o| o.underrun_events).unwrap_or_default(),
        "playback status"
    );
}

fn finish_report(session: &dyn Session) -> Result<()> {
    let status = session.status();
    match status.end_reason {
        Some(PlaybackEndReason::Error) => Err(anyhow!(
            "playback failed: {}",
            session.last_error().unwrap_or_else(|| "unknown error".into())
        )),
        reason => {
            tracing::info!(reason = ?reason, packets = status.packets_submitted, "playback finished");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use stream_player::config::PlayerConfig;
    use stream_player::demux::MpegFrameParser;
    use stream_player::output::CpalConfig;
    use stream_player_types::RunState;

    fn player() -> Arc<StreamingPlayer<CpalBackend>> {
        StreamingPlayer::new(
            CpalBackend::new(CpalConfig::default()),
            Box::new(MpegFrameParser::new()),
            PlayerConfig::default(),
        )
    }

    #[test]
    fn url_extension_ignores_query_and_host() {
        assert_eq!(url_extension("http://radio.example/live.OGG?sid=1"), Some("ogg".into()));
        assert_eq!(url_extension("https://cdn.example/a/b/track.flac#t=3"), Some("flac".into()));
        assert_eq!(url_extension("http://radio.example/stream"), None);
        assert_eq!(url_extension("http://radio.example.com"), None);
        assert_eq!(url_extension("http://radio.example/dir.v2/"), None);
    }

    #[test]
    fn pump_reads_in_chunks_and_finishes() {
        let player = player();
        let mut source = Cursor::new(vec![0u8; 40_000]);
        let cancel = AtomicBool::new(false);

        let summary = pump(&mut source, &player, 16 * 1024, &cancel).unwrap();
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.bytes, 40_000);
        assert!(summary.finished);
        // No frame sync in silence, so nothing was ever buffered.
        assert_eq!(player.state(), RunState::Stopped);
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Eof));
    }

    #[test]
    fn pump_stops_reading_when_canceled() {
        let player = player();
        let mut source = Cursor::new(vec![0u8; 1024]);
        let cancel = AtomicBool::new(true);

        let summary = pump(&mut source, &player, 256, &cancel).unwrap();
        assert_eq!(summary, PumpSummary::default());
        assert_eq!(player.state(), RunState::Idle);
    }

    #[test]
    fn pump_closes_when_player_was_stopped() {
        let player = player();
        player.stop();
        let mut source = Cursor::new(vec![0u8; 1024]);
        let cancel = AtomicBool::new(false);

        let summary = pump(&mut source, &player, 256, &cancel).unwrap();
        assert_eq!(summary.chunks, 1);
        assert!(!summary.finished);
    }

    struct EndedSession {
        reason: PlaybackEndReason,
        error: Option<String>,
    }

    impl Session for EndedSession {
        fn wait_until_stopped(&self, _timeout: std::time::Duration) -> bool {
            true
        }

        fn status(&self) -> PlayerStatus {
            PlayerStatus {
                state: RunState::Stopped,
                end_reason: Some(self.reason),
                ..PlayerStatus::default()
            }
        }

        fn output_status(&self) -> Option<OutputStatus> {
            None
        }

        fn stop(&self) {}

        fn last_error(&self) -> Option<String> {
            self.error.clone()
        }
    }

    #[test]
    fn finish_report_surfaces_errors() {
        let failed = EndedSession {
            reason: PlaybackEndReason::Error,
            error: Some("enqueue of slot 1 failed: device lost".into()),
        };
        let err = finish_report(&failed).unwrap_err();
        assert!(err.to_string().contains("device lost"));

        let unexplained = EndedSession {
            reason: PlaybackEndReason::Error,
            error: None,
        };
        assert!(finish_report(&unexplained).unwrap_err().to_string().contains("unknown error"));
    }

    #[test]
    fn finish_report_accepts_clean_endings() {
        let player = player();
        player.stop();
        assert!(finish_report(&*player).is_ok());

        let drained = EndedSession {
            reason: PlaybackEndReason::Eof,
            error: None,
        };
        assert!(finish_report(&drained).is_ok());
    }

    #[test]
    fn status_line_serializes_both_halves() {
        let status = PlayerStatus::default();
        let line = serde_json::to_value(StatusLine {
            player: &status,
            output: None,
        })
        .unwrap();
        assert_eq!(line["player"]["state"], "idle");
        assert!(line["output"].is_null());
    }
}
