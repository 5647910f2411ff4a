//! Mixer server contracts
//!
//! The mixer lives in another process; the client only sees these seams:
//! - [`MixerServer`] hands out system defaults and creates tracks
//! - [`ServerHandle`] is the per-track transport surface plus the mapped
//!   region
//! - [`PriorityHook`] stands in for platform scheduling adjustments

use std::sync::Arc;

use al_core::{SampleFormat, SharedBuffer, StreamType, TrackMemory, TrackResult};

/// Everything the server needs to build one track.
#[derive(Clone)]
pub struct TrackParams {
    pub stream_type: StreamType,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channel_count: u32,
    pub frame_count: u32,
    pub flags: u32,
    /// Client-supplied sample region, if the track plays one.
    pub shared_buffer: Option<SharedBuffer>,
}

/// Connection to the mixer process.
///
/// Implementations must populate `channels` and the authoritative
/// `frame_count` of the control block before `create_track` returns; the
/// returned ring may be smaller than requested and clients re-read the
/// block rather than trust their own number.
pub trait MixerServer: Send + Sync {
    /// Mixer output sample rate in Hz.
    fn output_sample_rate(&self) -> TrackResult<u32>;

    /// Mixer block size in frames.
    fn output_frame_count(&self) -> TrackResult<u32>;

    /// Output path latency in milliseconds.
    fn output_latency_ms(&self) -> TrackResult<u32>;

    /// Allocate a track and map its region.
    fn create_track(&self, params: &TrackParams) -> TrackResult<Arc<dyn ServerHandle>>;
}

/// Handle to one server-side track.
pub trait ServerHandle: Send + Sync {
    /// The mapped control block and sample area.
    fn memory(&self) -> &Arc<TrackMemory>;

    fn start(&self);

    fn stop(&self);

    /// Halts consumption but keeps the ring position.
    fn pause(&self);

    /// Resets both cursors; only meaningful while the track is stopped.
    /// Invoked with the control-block lock held, so implementations must
    /// not take it.
    fn flush(&self);

    fn set_mute(&self, muted: bool);

    /// Recovery hook fired when the producer waited a full timeout without
    /// any consumer progress. The consumer is presumed wedged; the default
    /// re-issues `start` as a nudge. Servers with a better resurrection
    /// path can override this without the client changing.
    fn kick(&self) {
        self.start();
    }
}

/// Scheduling adjustment applied around active playback. Platform
/// integrations raise the pumping thread to an audio-appropriate priority;
/// the default does nothing.
pub trait PriorityHook: Send + Sync {
    fn raise(&self) {}
    fn lower(&self) {}
}

/// No-op [`PriorityHook`].
#[derive(Debug, Default)]
pub struct NoopPriority;

impl PriorityHook for NoopPriority {}
