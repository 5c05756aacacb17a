pub mod config;
pub mod demux;
pub mod device;
pub mod error;
pub mod format;
pub mod local_file;
pub mod output;
pub mod packet;
pub mod player;
pub mod playback;
pub mod queue;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ParseError, PlayerError, Result};
pub use stream_player_types::{OutputStatus, PlaybackEndReason, PlayerStatus, RunState};
