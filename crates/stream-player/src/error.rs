//! Error types for the packet pipeline.

use std::io;

use stream_player_types::RunState;
use thiserror::Error;

/// Malformed or unsupported container data reported by a demuxer.
///
/// Never fatal to a session: the demuxer resynchronises and playback continues
/// with the packets already buffered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no frame sync found in {skipped} bytes at offset {offset}")]
    LostSync { offset: u64, skipped: usize },

    #[error("packets emitted before stream format at offset {offset}")]
    PacketsBeforeFormat { offset: u64 },

    #[error("unsupported stream: {0}")]
    Unsupported(String),
}

/// Errors surfaced by the player, its output devices, and the local-file variant.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("output device cannot realise format: {0}")]
    DeviceConfig(String),

    #[error("buffer allocation failed: {0}")]
    BufferAllocation(String),

    #[error("output device error: {0}")]
    Device(String),

    /// A broken invariant; the session is aborted.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: RunState },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),
}

impl PlayerError {
    /// Errors that end the session they occur in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlayerError::DeviceConfig(_)
                | PlayerError::BufferAllocation(_)
                | PlayerError::Device(_)
                | PlayerError::Internal(_)
        )
    }
}

/// Result type for player operations.
pub type Result<T> = std::result::Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_converts_and_is_not_fatal() {
        let err: PlayerError = ParseError::LostSync {
            offset: 10,
            skipped: 70_000,
        }
        .into();
        assert!(matches!(err, PlayerError::Parse(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn device_and_internal_errors_are_fatal() {
        assert!(PlayerError::DeviceConfig("8 channels".into()).is_fatal());
        assert!(PlayerError::BufferAllocation("oom".into()).is_fatal());
        assert!(PlayerError::Internal("slot 1 enqueued twice".into()).is_fatal());
    }

    #[test]
    fn invalid_state_display_names_operation() {
        let err = PlayerError::InvalidState {
            op: "pause",
            state: RunState::Buffering,
        };
        assert_eq!(err.to_string(), "cannot pause while Buffering");
    }
}
