//! Track event callbacks

use crate::buffer::AudioBuffer;

/// Events delivered to the client callback from the pump thread.
pub enum TrackEvent<'a> {
    /// The ring has room; fill up to `size` bytes of the descriptor and set
    /// `size` to the byte count actually produced.
    MoreData(&'a mut AudioBuffer),
    /// The consumer found the ring empty. Reported once per starvation.
    Underrun,
    /// The consumer reached the end of a shared buffer.
    BufferEnd,
    /// One loop pass completed; `remaining` passes are left, `-1` when the
    /// loop is infinite.
    LoopEnd { remaining: i32 },
    /// Playback crossed the one-shot marker position.
    Marker { frame: u32 },
    /// Playback crossed the next periodic position.
    NewPosition { frame: u32 },
}

/// Client event callback, invoked on the track's pump thread.
pub type EventCallback = Box<dyn FnMut(TrackEvent<'_>) + Send>;
