//! Streamer: plays compressed audio arriving over HTTP, or from a local file,
//! through a multi-buffered CPAL output.
//!
//! ## Modes
//! - `stream <URL>`: fetch an MPEG audio stream, demux it into frames as it arrives,
//!   and start playback once enough audio is buffered.
//! - `play <PATH>`: read packets from a local file on demand.
//!
//! Ctrl-C stops playback; a second Ctrl-C exits immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use streamer::cli::{Args, Command};
use streamer::runtime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,streamer=info,stream_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            if cancel.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
        })
        .context("install ctrl-c handler")?;
    }

    match &args.cmd {
        Some(Command::Stream { url }) => runtime::run_stream(args.stream_config(url), cancel),
        Some(Command::Play { path }) => runtime::run_play(args.play_config(path.clone()), cancel),
        None => bail!("no command given; use `stream <URL>`, `play <PATH>` or --list-devices"),
    }
}
