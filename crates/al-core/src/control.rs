//! Shared track control block
//!
//! The `ControlBlock` is the metadata header both sides of a track agree on:
//! - Producer cursor `user` advanced by the client, consumer cursor `server`
//!   advanced by the mixer
//! - Ring wrap bases keeping `cursor - base` inside the ring
//! - Loop window, packed volume, flow-control flags
//! - A shared mutex/condvar pair for the blocking producer path
//!
//! Cursor ownership is strict: the client is the only writer of `user`,
//! `user_base`, the loop window, `force_ready` and the flow-control clear;
//! the mixer is the only writer of `server`, `server_base`, the loop-count
//! decrement and the flow-control set. All cursor arithmetic is unsigned
//! 32-bit with wrapping; distances such as `user - server` are meaningful
//! modulo 2^32 and bounded by `frame_count`.

use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Sentinel for a cleared loop window.
pub const NO_LOOP: u32 = u32::MAX;

/// Shared metadata header for one track ring.
///
/// Lives at the head of the track's shared region; the PCM area follows it
/// (or sits in a separate client-supplied region, see
/// [`TrackMemory`](crate::region::TrackMemory)).
pub struct ControlBlock {
    /// Shared lock guarding the condvar and the loop window.
    pub lock: Mutex<()>,
    /// Signalled by the consumer after every `step_server`.
    pub cv: Condvar,

    user: AtomicU32,
    server: AtomicU32,
    user_base: AtomicU32,
    server_base: AtomicU32,

    frame_count: AtomicU32,
    channels: AtomicU32,
    sample_rate: AtomicU32,

    loop_start: AtomicU32,
    loop_end: AtomicU32,
    loop_count: AtomicI32,

    /// Packed Q4.12 gain pair, `(left << 16) | right`.
    volume_lr: AtomicU32,

    /// Set once the consumer reported an underrun; cleared by any producer
    /// advance so the event fires once per starvation.
    flow_control_flag: AtomicU8,
    /// Set after a seek placed the producer behind the consumer; tells the
    /// mixer to re-read `server` before its next pass.
    force_ready: AtomicU8,
    /// 1 for playback, 0 for record.
    out: AtomicU8,

    /// Base address of the PCM16 sample area.
    buffers: AtomicPtr<i16>,
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
            user: AtomicU32::new(0),
            server: AtomicU32::new(0),
            user_base: AtomicU32::new(0),
            server_base: AtomicU32::new(0),
            frame_count: AtomicU32::new(0),
            channels: AtomicU32::new(0),
            sample_rate: AtomicU32::new(0),
            loop_start: AtomicU32::new(NO_LOOP),
            loop_end: AtomicU32::new(NO_LOOP),
            loop_count: AtomicI32::new(0),
            volume_lr: AtomicU32::new(0),
            // A fresh ring is empty, so starvation is already "reported".
            flow_control_flag: AtomicU8::new(1),
            force_ready: AtomicU8::new(0),
            out: AtomicU8::new(0),
            buffers: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    // ── Cursor and parameter access ────────────────────────────────────────

    #[inline]
    pub fn user(&self) -> u32 {
        self.user.load(Ordering::Acquire)
    }

    #[inline]
    pub fn server(&self) -> u32 {
        self.server.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_base(&self) -> u32 {
        self.user_base.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn server_base(&self) -> u32 {
        self.server_base.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.frame_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn loop_start(&self) -> u32 {
        self.loop_start.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn loop_end(&self) -> u32 {
        self.loop_end.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn loop_count(&self) -> i32 {
        self.loop_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn volume_lr(&self) -> u32 {
        self.volume_lr.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn flow_control_flag(&self) -> u8 {
        self.flow_control_flag.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn force_ready(&self) -> u8 {
        self.force_ready.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_out(&self) -> bool {
        self.out.load(Ordering::Relaxed) != 0
    }

    /// Client: force the producer cursor, e.g. to present a pre-filled
    /// shared buffer as full.
    #[inline]
    pub fn store_user(&self, value: u32) {
        self.user.store(value, Ordering::Release);
    }

    /// Reposition the consumer cursor. Used by the client for a seek (under
    /// `lock`, track stopped) and by the mixer for a flush.
    #[inline]
    pub fn store_server(&self, value: u32) {
        self.server.store(value, Ordering::Release);
    }

    #[inline]
    pub fn store_user_base(&self, value: u32) {
        self.user_base.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn store_server_base(&self, value: u32) {
        self.server_base.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn store_sample_rate(&self, value: u32) {
        self.sample_rate.store(value, Ordering::Relaxed);
    }

    /// One 32-bit store is the cross-process delivery of a volume change.
    #[inline]
    pub fn store_volume_lr(&self, packed: u32) {
        self.volume_lr.store(packed, Ordering::Relaxed);
    }

    /// Consumer: record that an underrun has been reported.
    #[inline]
    pub fn set_flow_control_flag(&self) {
        self.flow_control_flag.store(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_flow_control_flag(&self) {
        self.flow_control_flag.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_force_ready(&self) {
        self.force_ready.store(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_force_ready(&self) {
        self.force_ready.store(0, Ordering::Relaxed);
    }

    /// Select the data direction; playback tracks set `out`.
    #[inline]
    pub fn set_output(&self, out: bool) {
        self.out.store(out as u8, Ordering::Relaxed);
    }

    /// Server: record ring geometry while creating the track. `frame_count`
    /// is authoritative from here on; clients re-read it after creation.
    pub fn init_geometry(&self, frame_count: u32, channels: u32) {
        self.frame_count.store(frame_count, Ordering::Relaxed);
        self.channels.store(channels, Ordering::Relaxed);
    }

    /// Point the block at its PCM area.
    pub fn set_buffers(&self, base: *mut i16) {
        self.buffers.store(base, Ordering::Release);
    }

    /// Store a loop window. Callers serialize through `lock`; the stores
    /// themselves are plain so a half-written window is never published
    /// outside it.
    pub fn store_loop(&self, start: u32, end: u32, count: i32) {
        self.loop_start.store(start, Ordering::Relaxed);
        self.loop_end.store(end, Ordering::Relaxed);
        self.loop_count.store(count, Ordering::Relaxed);
    }

    // ── Ring discipline ────────────────────────────────────────────────────

    /// Advance the producer cursor after `frames` frames were written.
    ///
    /// Client-only. No lock is taken: `user` has a single writer, and the
    /// consumer tolerates a stale read because the producer's blocking path
    /// rechecks under `lock`.
    pub fn step_user(&self, frames: u32) -> u32 {
        let mut u = self.user.load(Ordering::Acquire).wrapping_add(frames);

        // A record-direction producer must never run ahead of its reader.
        if !self.is_out() {
            let s = self.server.load(Ordering::Acquire);
            if u > s {
                log::warn!("step_user caught up with a reset consumer cursor");
                u = s;
            }
        }

        let frame_count = self.frame_count();
        let base = self.user_base();
        if u.wrapping_sub(base) >= frame_count {
            self.user_base
                .store(base.wrapping_add(frame_count), Ordering::Relaxed);
        }

        self.user.store(u, Ordering::Release);

        // New data is in flight, so the next starvation is a fresh event.
        self.flow_control_flag.store(0, Ordering::Relaxed);
        u
    }

    /// Advance the consumer cursor after `frames` frames were mixed.
    ///
    /// Mixer-only. The lock is shared with the client, so the consumer never
    /// waits on it: one try, a 1 ms pause, one retry. `false` means the lock
    /// could not be taken and no state was touched; the client has most
    /// likely died holding it.
    pub fn step_server(&self, frames: u32) -> bool {
        let guard = match self.lock.try_lock() {
            Some(guard) => guard,
            None => {
                thread::sleep(Duration::from_millis(1));
                match self.lock.try_lock() {
                    Some(guard) => guard,
                    None => return false,
                }
            }
        };

        let mut s = self.server.load(Ordering::Acquire).wrapping_add(frames);

        // A flush can land while a mix block is in flight and reset both
        // cursors under us; clamp rather than run past the producer.
        if self.is_out() {
            let u = self.user.load(Ordering::Acquire);
            if s > u {
                log::warn!("step_server caught up with a reset producer cursor");
                s = u;
            }
        }

        let loop_end = self.loop_end();
        if s >= loop_end {
            if s > loop_end {
                log::warn!("step_server overshot loop end: {} > {}", s, loop_end);
            }
            s = self.loop_start();
            let remaining = self.loop_count.load(Ordering::Relaxed).wrapping_sub(1);
            self.loop_count.store(remaining, Ordering::Relaxed);
            if remaining == 0 {
                self.loop_end.store(NO_LOOP, Ordering::Relaxed);
                self.loop_start.store(NO_LOOP, Ordering::Relaxed);
            }
        }

        let frame_count = self.frame_count();
        let base = self.server_base();
        if s.wrapping_sub(base) >= frame_count {
            self.server_base
                .store(base.wrapping_add(frame_count), Ordering::Relaxed);
        }

        self.server.store(s, Ordering::Release);
        self.cv.notify_one();
        drop(guard);
        true
    }

    /// Frames the producer may still write.
    pub fn frames_available(&self) -> u32 {
        let guard = self.lock.lock();
        self.frames_available_locked(&guard)
    }

    /// Same as [`frames_available`](Self::frames_available) with the lock
    /// already held; the guard is the witness.
    pub fn frames_available_locked(&self, _guard: &MutexGuard<'_, ()>) -> u32 {
        let u = self.user();
        let s = self.server();
        let frame_count = self.frame_count();

        if self.is_out() {
            let loop_end = self.loop_end();
            if u < loop_end {
                s.wrapping_add(frame_count).wrapping_sub(u)
            } else {
                // Inside the loop window the producer may only fill up to the
                // window start (or the consumer, whichever is behind).
                let loop_start = self.loop_start();
                let limit = if s < loop_start { s } else { loop_start };
                limit.wrapping_add(frame_count).wrapping_sub(u)
            }
        } else {
            frame_count.wrapping_add(u).wrapping_sub(s)
        }
    }

    /// Frames the consumer may still read, counting pending loop passes.
    pub fn frames_ready(&self) -> u32 {
        let u = self.user();
        let s = self.server();

        if self.is_out() {
            if u < self.loop_end() {
                u.wrapping_sub(s)
            } else {
                let _guard = self.lock.lock();
                let count = self.loop_count();
                if count >= 0 {
                    self.loop_end()
                        .wrapping_sub(self.loop_start())
                        .wrapping_mul(count as u32)
                        .wrapping_add(u)
                        .wrapping_sub(s)
                } else {
                    u32::MAX
                }
            }
        } else {
            s.wrapping_sub(u)
        }
    }

    /// Address of the sample at absolute producer offset `offset`.
    ///
    /// The offset is translated through `user_base`, so the producer passes
    /// `user`. The area always holds 16-bit samples.
    pub fn buffer_at(&self, offset: u32) -> *mut i16 {
        let index =
            offset.wrapping_sub(self.user_base()) as usize * self.channels() as usize;
        let base = self.buffers.load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        // SAFETY: the region owner keeps the PCM area alive for the lifetime
        // of this block, and `offset - user_base` stays inside the ring by
        // the cursor invariants.
        unsafe { base.add(index) }
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}
