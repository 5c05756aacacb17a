use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "streamer", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Hardware buffers cycled through the output device
    #[arg(long, default_value_t = 3)]
    pub buffers: usize,

    /// Audio to buffer before playback starts (seconds)
    #[arg(long, default_value_t = 3.0)]
    pub start_seconds: f64,

    /// Audio placed in each buffer on refill (seconds)
    #[arg(long, default_value_t = 5.0)]
    pub refill_seconds: f64,

    /// Backlog that restarts buffers parked after a network stall (seconds)
    #[arg(long, default_value_t = 1.0)]
    pub resume_seconds: f64,

    /// Bytes requested per network read
    #[arg(long, default_value_t = 16 * 1024)]
    pub chunk_bytes: usize,

    /// Decoded audio queued ahead of the output callback (seconds)
    #[arg(long, default_value_t = 2.0)]
    pub queue_seconds: f32,

    /// Interval between status reports (milliseconds)
    #[arg(long, default_value_t = 2000)]
    pub status_interval_ms: u64,

    /// Print status reports as JSON lines on stdout
    #[arg(long)]
    pub status_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream an MPEG audio URL over HTTP
    Stream {
        /// HTTP(S) URL of an MP3/MP2 stream
        url: String,
    },

    /// Play a local file
    Play {
        /// Path to audio file
        path: PathBuf,
    },
}
