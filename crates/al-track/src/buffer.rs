//! Ring buffer descriptor

use al_core::SampleFormat;

/// The descriptor is for a muted track; fill with data anyway, the mixer
/// drops it.
pub const BUFFER_FLAG_MUTE: u32 = 1 << 0;

/// A window into the track ring handed out by `obtain_buffer` and passed to
/// the more-data callback.
///
/// `frame_count` carries the request on the way in and the grant on the way
/// out; `size` is the granted byte count, always in 16-bit units regardless
/// of the track's external format.
pub struct AudioBuffer {
    pub frame_count: u32,
    pub size: usize,
    pub channel_count: u32,
    pub format: SampleFormat,
    pub flags: u32,
    raw: *mut i16,
}

// SAFETY: the pointer targets plain PCM memory inside the track region;
// aliasing is governed by the obtain/release protocol, which hands a window
// to exactly one producer at a time.
unsafe impl Send for AudioBuffer {}

impl AudioBuffer {
    /// Descriptor requesting up to `frames` frames.
    pub fn request(frames: u32) -> Self {
        Self {
            frame_count: frames,
            size: 0,
            channel_count: 0,
            format: SampleFormat::Pcm16Bit,
            flags: 0,
            raw: std::ptr::null_mut(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.frame_count = 0;
        self.size = 0;
        self.raw = std::ptr::null_mut();
    }

    pub(crate) fn grant(
        &mut self,
        raw: *mut i16,
        frames: u32,
        channel_count: u32,
        muted: bool,
    ) {
        self.raw = raw;
        self.frame_count = frames;
        self.channel_count = channel_count;
        self.size = frames as usize * channel_count as usize * 2;
        self.format = SampleFormat::Pcm16Bit;
        self.flags = if muted { BUFFER_FLAG_MUTE } else { 0 };
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.flags & BUFFER_FLAG_MUTE != 0
    }

    /// Raw base of the granted window.
    #[inline]
    pub fn raw(&self) -> *mut i16 {
        self.raw
    }

    /// Granted window as bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.raw.is_null() || self.size == 0);
        // SAFETY: `grant` sized the window to `size` bytes of live PCM
        // memory and the descriptor is the only writer handle for it.
        unsafe { std::slice::from_raw_parts_mut(self.raw as *mut u8, self.size) }
    }

    /// Granted window as 16-bit samples.
    pub fn samples_mut(&mut self) -> &mut [i16] {
        debug_assert!(!self.raw.is_null() || self.size == 0);
        // SAFETY: as `bytes_mut`, and the region is 16-bit aligned.
        unsafe { std::slice::from_raw_parts_mut(self.raw, self.size / 2) }
    }
}
