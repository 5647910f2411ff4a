//! al-track: Client-side audio track for an out-of-process mixer
//!
//! Provides:
//! - [`Track`]: transport, volume, loop/seek and the write path over a
//!   shared-memory ring
//! - Blocking and non-blocking ring acquisition (`obtain_buffer` /
//!   `release_buffer`)
//! - A pump thread delivering underrun, loop-end, marker, position and
//!   more-data events
//! - The [`MixerServer`] / [`ServerHandle`] contracts a mixer implements

mod buffer;
mod callback;
mod config;
mod events;
mod server;
mod track;

pub use buffer::{AudioBuffer, BUFFER_FLAG_MUTE};
pub use config::TrackConfig;
pub use events::{EventCallback, TrackEvent};
pub use server::{MixerServer, NoopPriority, PriorityHook, ServerHandle, TrackParams};
pub use track::{LoopSettings, Track};

// The contract types move with the track API.
pub use al_core::{
    SampleFormat, SharedBuffer, StreamType, TrackError, TrackMemory, TrackResult,
    MAX_SAMPLE_RATE,
};
