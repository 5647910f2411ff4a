//! Track configuration

use al_core::{SampleFormat, StreamType};
use serde::{Deserialize, Serialize};

/// Parameters a client asks for when opening a track.
///
/// Zero means "use the server default": sample rate falls back to the mixer
/// output rate, channel count to stereo, frame count to the computed
/// latency-covering minimum and notification frames to half the ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    pub stream_type: StreamType,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channel_count: u32,
    pub frame_count: u32,
    /// Chunk granularity at which the callback is asked for more data.
    pub notification_frames: u32,
    /// Opaque flags forwarded to the server.
    pub flags: u32,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            stream_type: StreamType::Music,
            sample_rate: 0,
            format: SampleFormat::Pcm16Bit,
            channel_count: 0,
            frame_count: 0,
            notification_frames: 0,
            flags: 0,
        }
    }
}

impl TrackConfig {
    /// Config for a stereo PCM16 stream at an explicit rate, everything else
    /// at server defaults.
    pub fn streaming(stream_type: StreamType, sample_rate: u32) -> Self {
        Self {
            stream_type,
            sample_rate,
            ..Self::default()
        }
    }
}
