//! Track error types

use thiserror::Error;

/// Errors reported by track operations on both sides of the control block.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackError {
    #[error("audio server unreachable or track not initialized")]
    NoInit,

    #[error("operation not permitted in the current state: {0}")]
    InvalidOperation(&'static str),

    #[error("invalid parameter: {0}")]
    BadValue(&'static str),

    #[error("track is not active, no more buffers will be granted")]
    NoMoreBuffers,

    #[error("ring is full and the call is non-blocking")]
    WouldBlock,

    /// The buffer in the descriptor is valid; the caller should drain it and
    /// exit instead of requesting more.
    #[error("track stopped while a buffer was pending")]
    Stopped,
}

/// Result type alias
pub type TrackResult<T> = Result<T, TrackError>;
