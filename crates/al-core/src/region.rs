//! Track memory regions
//!
//! A track's shared region is a [`ControlBlock`] followed by its PCM16
//! sample area. For server-allocated tracks both live in one allocation;
//! for client-supplied tracks the block stands alone and `buffers` points
//! into the separately owned [`SharedBuffer`].
//!
//! The sample area is accessed through raw pointers under the ring's
//! single-producer / single-consumer discipline: the client writes between
//! `user` and the ring limit, the mixer reads between `server` and `user`.

use std::sync::Arc;

use crate::control::ControlBlock;

/// Client-owned PCM16 region presented to the mixer in a single pass,
/// typically looped. Cheap to clone; all clones alias the same samples.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<SharedBufferInner>,
}

struct SharedBufferInner {
    data: Box<[i16]>,
}

// SAFETY: the region is plain PCM memory. Concurrent access is governed by
// the ring cursors of the track the buffer is attached to; the owner only
// writes while no track is consuming it.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Allocate a zeroed region of `samples` 16-bit samples.
    pub fn new(samples: usize) -> Self {
        Self {
            inner: Arc::new(SharedBufferInner {
                data: vec![0i16; samples].into_boxed_slice(),
            }),
        }
    }

    /// Allocate a region pre-filled with `samples`.
    pub fn from_pcm16(samples: &[i16]) -> Self {
        Self {
            inner: Arc::new(SharedBufferInner {
                data: samples.to_vec().into_boxed_slice(),
            }),
        }
    }

    /// Region size in bytes.
    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.inner.data.len() * 2
    }

    /// Number of frames the region holds at the given channel count.
    #[inline]
    pub fn frames(&self, channels: u32) -> u32 {
        (self.inner.data.len() / channels as usize) as u32
    }

    /// Base address of the sample area.
    #[inline]
    pub fn as_ptr(&self) -> *mut i16 {
        self.inner.data.as_ptr() as *mut i16
    }

    /// Overwrite samples starting at `offset`. Callers must not race the
    /// consumer; preload before the track starts or between passes.
    pub fn write_samples(&self, offset: usize, samples: &[i16]) {
        assert!(offset + samples.len() <= self.inner.data.len());
        // SAFETY: bounds asserted above; writer exclusivity is the caller's
        // side of the shared-region contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                samples.as_ptr(),
                self.as_ptr().add(offset),
                samples.len(),
            );
        }
    }

    /// Copy samples starting at `offset` out of the region.
    pub fn read_samples(&self, offset: usize, out: &mut [i16]) {
        assert!(offset + out.len() <= self.inner.data.len());
        // SAFETY: bounds asserted above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.as_ptr().add(offset) as *const i16,
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }
}

/// One track's mapped region: the control block plus whichever sample area
/// backs it. Created by the server while building a track; both sides then
/// share it by reference.
pub struct TrackMemory {
    cblk: ControlBlock,
    /// Sample storage for server-allocated tracks; empty when a client
    /// buffer is attached.
    _pcm: Box<[i16]>,
    /// Keeps a client-supplied region alive as long as the block points
    /// into it.
    _shared: Option<SharedBuffer>,
}

// SAFETY: the PCM area is only touched through `ControlBlock::buffer_at`
// under the SPSC cursor discipline; everything else is atomics and locks.
unsafe impl Send for TrackMemory {}
unsafe impl Sync for TrackMemory {}

impl TrackMemory {
    /// Allocate a region with its own sample area: `frame_count` frames of
    /// `channels` interleaved PCM16 samples directly after the block.
    pub fn allocate(frame_count: u32, channels: u32) -> Arc<Self> {
        let pcm =
            vec![0i16; frame_count as usize * channels as usize].into_boxed_slice();
        let cblk = ControlBlock::new();
        cblk.init_geometry(frame_count, channels);
        cblk.set_buffers(pcm.as_ptr() as *mut i16);
        Arc::new(Self {
            cblk,
            _pcm: pcm,
            _shared: None,
        })
    }

    /// Build a region around a client-supplied sample area.
    pub fn with_shared_buffer(
        frame_count: u32,
        channels: u32,
        buffer: SharedBuffer,
    ) -> Arc<Self> {
        let cblk = ControlBlock::new();
        cblk.init_geometry(frame_count, channels);
        cblk.set_buffers(buffer.as_ptr());
        Arc::new(Self {
            cblk,
            _pcm: Box::new([]),
            _shared: Some(buffer),
        })
    }

    #[inline]
    pub fn control_block(&self) -> &ControlBlock {
        &self.cblk
    }
}
