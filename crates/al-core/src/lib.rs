//! al-core: Shared contract between AudioLink clients and the mixer
//!
//! Everything both sides of a track must agree on:
//! - The shared [`ControlBlock`] and its ring discipline
//! - Track memory regions and client-supplied shared buffers
//! - Sample formats, stream types and PCM conversion
//! - The error kinds track operations report

mod control;
mod error;
mod format;
mod region;

pub use control::{ControlBlock, NO_LOOP};
pub use error::{TrackError, TrackResult};
pub use format::{
    expand_pcm8, expand_pcm8_in_place, pack_volume, unpack_volume, SampleFormat,
    StreamType, MAX_SAMPLE_RATE,
};
pub use region::{SharedBuffer, TrackMemory};
