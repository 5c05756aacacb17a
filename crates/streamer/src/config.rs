use std::path::PathBuf;
use std::time::Duration;

pub use stream_player::config::PlayerConfig;
pub use stream_player::output::CpalConfig;

use crate::cli::Args;
use crate::http_source::HttpSourceConfig;

/// How status reports are emitted while playing.
#[derive(Clone, Debug)]
pub struct StatusConfig {
    pub interval: Duration,
    pub json: bool,
}

#[derive(Clone, Debug)]
pub struct StreamRunConfig {
    pub url: String,
    pub player: PlayerConfig,
    pub output: CpalConfig,
    pub source: HttpSourceConfig,
    pub status: StatusConfig,
}

#[derive(Clone, Debug)]
pub struct PlayRunConfig {
    pub path: PathBuf,
    pub output: CpalConfig,
    pub status: StatusConfig,
}

impl Args {
    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            buffer_count: self.buffers,
            start_threshold_seconds: self.start_seconds,
            refill_window_seconds: self.refill_seconds,
            resume_threshold_seconds: self.resume_seconds,
        }
        .sanitized()
    }

    pub fn output_config(&self) -> CpalConfig {
        CpalConfig {
            device: normalize_device_name(self.device.clone()),
            queue_seconds: self.queue_seconds,
            ..CpalConfig::default()
        }
    }

    pub fn status_config(&self) -> StatusConfig {
        StatusConfig {
            interval: Duration::from_millis(self.status_interval_ms.max(100)),
            json: self.status_json,
        }
    }

    pub fn stream_config(&self, url: &str) -> StreamRunConfig {
        StreamRunConfig {
            url: url.to_string(),
            player: self.player_config(),
            output: self.output_config(),
            source: HttpSourceConfig {
                chunk_bytes: self.chunk_bytes.max(1),
                ..HttpSourceConfig::default()
            },
            status: self.status_config(),
        }
    }

    pub fn play_config(&self, path: PathBuf) -> PlayRunConfig {
        PlayRunConfig {
            path,
            output: self.output_config(),
            status: self.status_config(),
        }
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn stream_config_maps_flags() {
        let args = Args::try_parse_from([
            "streamer",
            "--buffers",
            "4",
            "--refill-seconds",
            "2.5",
            "--chunk-bytes",
            "4096",
            "--status-interval-ms",
            "500",
            "stream",
            "http://radio.example/live.mp3",
        ])
        .unwrap();
        let cfg = args.stream_config("http://radio.example/live.mp3");
        assert_eq!(cfg.player.buffer_count, 4);
        assert_eq!(cfg.player.refill_window_seconds, 2.5);
        assert_eq!(cfg.player.start_threshold_seconds, 3.0);
        assert_eq!(cfg.source.chunk_bytes, 4096);
        assert_eq!(cfg.status.interval, Duration::from_millis(500));
        assert!(cfg.output.device.is_none());
    }

    #[test]
    fn invalid_thresholds_fall_back_to_defaults() {
        let args = Args::try_parse_from([
            "streamer",
            "--buffers",
            "0",
            "--start-seconds=-2",
            "play",
            "a.flac",
        ])
        .unwrap();
        let cfg = args.player_config();
        assert_eq!(cfg.buffer_count, 1);
        assert_eq!(cfg.start_threshold_seconds, 3.0);
    }

    #[test]
    fn blank_device_name_means_default() {
        assert_eq!(normalize_device_name(Some("  ".into())), None);
        assert_eq!(normalize_device_name(Some(" DAC ".into())), Some("DAC".into()));
        assert_eq!(normalize_device_name(None), None);
    }
}
