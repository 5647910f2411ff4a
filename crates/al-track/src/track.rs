//! Client-side audio track
//!
//! A `Track` streams PCM frames into a ring whose metadata lives in a
//! region shared with the mixer. Data gets in one of two ways:
//! - the streaming interface: `write` (or the more-data callback pumped by
//!   the worker thread) copies into ring windows from `obtain_buffer`
//! - a shared buffer: the client preloads a region and the mixer plays it
//!   in a single pass, usually looped
//!
//! Transport state is one atomic bit so start/stop never race the pump
//! thread; everything the mixer must observe goes through the control
//! block.

use std::io::{self, Write as IoWrite};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use al_core::{
    pack_volume, SampleFormat, SharedBuffer, StreamType, TrackError, TrackMemory,
    TrackResult, MAX_SAMPLE_RATE, NO_LOOP,
};

use crate::buffer::AudioBuffer;
use crate::callback::CallbackThread;
use crate::config::TrackConfig;
use crate::events::EventCallback;
use crate::server::{MixerServer, NoopPriority, PriorityHook, ServerHandle, TrackParams};

/// Bit 0 of the active word; the only transport state the pump thread reads.
const ACTIVE_BIT: u32 = 1;

/// Upper bound on one producer wait for ring space. Hitting it means the
/// consumer went silent; the server gets kicked and the wait re-enters.
const OBTAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Loop window as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub start: u32,
    pub end: u32,
    /// Remaining passes; `-1` when infinite.
    pub count: i32,
}

/// Client endpoint of one mixer track.
///
/// All methods take `&self`; a `Track` can be shared across threads behind
/// an `Arc`. Dropping it stops playback, wakes any blocked producer and
/// joins the pump thread.
pub struct Track {
    inner: Arc<TrackInner>,
}

pub(crate) struct TrackInner {
    pub(crate) mixer: Arc<dyn MixerServer>,
    pub(crate) server: Arc<dyn ServerHandle>,
    pub(crate) memory: Arc<TrackMemory>,

    pub(crate) stream_type: StreamType,
    pub(crate) format: SampleFormat,
    pub(crate) channel_count: u32,
    /// Authoritative ring size, read back from the control block after the
    /// server created the track.
    pub(crate) frame_count: u32,
    pub(crate) shared_buffer: Option<SharedBuffer>,
    pub(crate) latency_ms: u32,
    pub(crate) notification_frames: u32,

    pub(crate) active: AtomicU32,
    pub(crate) muted: AtomicBool,
    pub(crate) volume_bits: [AtomicU32; 2],

    pub(crate) remaining_frames: AtomicU32,
    pub(crate) marker_position: AtomicU32,
    pub(crate) new_position: AtomicU32,
    pub(crate) update_period: AtomicU32,
    /// Client mirror of the shared loop count, drained by the pump thread
    /// to emit one loop-end event per wrap.
    pub(crate) loop_count: AtomicI32,

    pub(crate) callback: Option<Mutex<EventCallback>>,
    pub(crate) worker: Option<CallbackThread>,
    pub(crate) priority: Box<dyn PriorityHook>,

    /// Serializes start/stop transitions against each other.
    transport_lock: Mutex<()>,
}

impl Track {
    /// Open a streaming track; the application feeds it through [`write`]
    /// (or the more-data callback when one is given).
    ///
    /// [`write`]: Track::write
    pub fn new(
        mixer: Arc<dyn MixerServer>,
        config: TrackConfig,
        callback: Option<EventCallback>,
    ) -> TrackResult<Self> {
        Self::with_priority_hook(mixer, config, None, callback, Box::new(NoopPriority))
    }

    /// Open a track over a client-supplied, pre-filled sample region.
    /// [`write`](Track::write) is forbidden on such tracks.
    pub fn with_shared_buffer(
        mixer: Arc<dyn MixerServer>,
        config: TrackConfig,
        buffer: SharedBuffer,
        callback: Option<EventCallback>,
    ) -> TrackResult<Self> {
        Self::with_priority_hook(
            mixer,
            config,
            Some(buffer),
            callback,
            Box::new(NoopPriority),
        )
    }

    /// Full-control constructor with a platform scheduling hook.
    pub fn with_priority_hook(
        mixer: Arc<dyn MixerServer>,
        config: TrackConfig,
        shared_buffer: Option<SharedBuffer>,
        callback: Option<EventCallback>,
        priority: Box<dyn PriorityHook>,
    ) -> TrackResult<Self> {
        let af_sample_rate = mixer.output_sample_rate()?;
        let af_frame_count = mixer.output_frame_count()?;
        let af_latency = mixer.output_latency_ms()?;
        if af_sample_rate == 0 || af_frame_count == 0 {
            return Err(TrackError::NoInit);
        }

        let stream_type = config.stream_type;
        let sample_rate = if config.sample_rate == 0 {
            af_sample_rate
        } else {
            config.sample_rate
        };
        let format = config.format;
        let channel_count = if config.channel_count == 0 {
            2
        } else {
            config.channel_count
        };

        if format == SampleFormat::Pcm8Bit && shared_buffer.is_some() {
            log::error!("8-bit data cannot back a shared-buffer track");
            return Err(TrackError::BadValue(
                "8-bit format requires the streaming interface",
            ));
        }
        if channel_count != 1 && channel_count != 2 {
            log::error!("invalid channel count {}", channel_count);
            return Err(TrackError::BadValue("channel count must be 1 or 2"));
        }

        // Ring depth must cover the output path latency.
        let block_ms = (1000 * af_frame_count) / af_sample_rate;
        if block_ms == 0 {
            return Err(TrackError::NoInit);
        }
        let mut min_buf_count = af_latency / block_ms;
        // A shared buffer may start on a partly filled final mixer block.
        if shared_buffer.is_some() && min_buf_count > 1 {
            min_buf_count -= 1;
        }
        let min_frame_count = (af_frame_count as u64
            * sample_rate as u64
            * min_buf_count as u64
            / af_sample_rate as u64) as u32;

        let mut frame_count = config.frame_count;
        let mut notification_frames = config.notification_frames;
        match &shared_buffer {
            None => {
                if frame_count == 0 {
                    frame_count = min_frame_count;
                }
                if notification_frames == 0 {
                    notification_frames = frame_count / 2;
                }
                // Keep enough margin to refill before the ring drains.
                if notification_frames > frame_count / 2 {
                    notification_frames = frame_count / 2;
                }
            }
            Some(buffer) => {
                // Historical check: the mask is `channel_count | 1`, not a
                // power-of-two alignment mask. Kept bit-for-bit.
                if buffer.as_ptr() as usize & (channel_count as usize | 1) != 0 {
                    log::error!(
                        "invalid shared buffer alignment: {:p}, channel count {}",
                        buffer.as_ptr(),
                        channel_count
                    );
                    return Err(TrackError::BadValue(
                        "shared buffer misaligned for channel count",
                    ));
                }
                frame_count = (buffer.len_bytes() / channel_count as usize / 2) as u32;
            }
        }
        if frame_count < min_frame_count {
            log::error!(
                "invalid buffer size: min frame count {}, frame count {}",
                min_frame_count,
                frame_count
            );
            return Err(TrackError::BadValue("frame count below the server minimum"));
        }

        let params = TrackParams {
            stream_type,
            sample_rate,
            format,
            channel_count,
            frame_count,
            flags: config.flags,
            shared_buffer: shared_buffer.clone(),
        };
        let server = mixer.create_track(&params)?;
        let memory = Arc::clone(server.memory());
        let cblk = memory.control_block();

        cblk.set_output(true);
        cblk.store_sample_rate(sample_rate);
        cblk.store_volume_lr(pack_volume(1.0, 1.0));

        // The server may have granted a smaller ring than requested.
        let frame_count = cblk.frame_count();
        let latency_ms = af_latency + (1000 * frame_count) / sample_rate;

        let worker = callback.as_ref().map(|_| CallbackThread::new());
        let inner = Arc::new(TrackInner {
            mixer,
            server,
            memory,
            stream_type,
            format,
            channel_count,
            frame_count,
            shared_buffer,
            latency_ms,
            notification_frames,
            active: AtomicU32::new(0),
            muted: AtomicBool::new(false),
            volume_bits: [
                AtomicU32::new(1.0f32.to_bits()),
                AtomicU32::new(1.0f32.to_bits()),
            ],
            remaining_frames: AtomicU32::new(notification_frames),
            marker_position: AtomicU32::new(0),
            new_position: AtomicU32::new(0),
            update_period: AtomicU32::new(0),
            loop_count: AtomicI32::new(0),
            callback: callback.map(Mutex::new),
            worker,
            priority,
            transport_lock: Mutex::new(()),
        });
        Ok(Track { inner })
    }

    /// Constructed tracks are initialized; kept for API parity with remote
    /// handles that can outlive their server.
    pub fn init_check(&self) -> TrackResult<()> {
        Ok(())
    }

    // ── Transport ──────────────────────────────────────────────────────────

    pub fn start(&self) {
        TrackInner::start(&self.inner);
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    /// True while no playback is in flight.
    pub fn stopped(&self) -> bool {
        !self.inner.is_active()
    }

    /// Halt consumption without losing the ring position.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Reset the ring. No-op while the track is active.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Re-present the whole shared region for another pass.
    pub fn reload(&self) -> TrackResult<()> {
        self.inner.reload()
    }

    // ── Query and configuration ────────────────────────────────────────────

    /// Total output latency in milliseconds: server path plus ring depth.
    pub fn latency(&self) -> u32 {
        self.inner.latency_ms
    }

    pub fn stream_type(&self) -> StreamType {
        self.inner.stream_type
    }

    /// Current request rate; the mixer resamples to its own.
    pub fn sample_rate(&self) -> u32 {
        self.inner.memory.control_block().sample_rate()
    }

    /// Change the request rate, clamped to twice the mixer output rate and
    /// the global ceiling.
    pub fn set_sample_rate(&self, rate: u32) -> TrackResult<()> {
        let af_sample_rate = self.inner.mixer.output_sample_rate()?;
        let rate = rate.min(af_sample_rate * 2).min(MAX_SAMPLE_RATE);
        self.inner.memory.control_block().store_sample_rate(rate);
        Ok(())
    }

    pub fn format(&self) -> SampleFormat {
        self.inner.format
    }

    pub fn channel_count(&self) -> u32 {
        self.inner.channel_count
    }

    pub fn frame_count(&self) -> u32 {
        self.inner.frame_count
    }

    /// Bytes per frame as the application sees them.
    pub fn frame_size(&self) -> usize {
        self.inner.channel_count as usize * self.inner.format.bytes_per_sample()
    }

    pub fn shared_buffer(&self) -> Option<&SharedBuffer> {
        self.inner.shared_buffer.as_ref()
    }

    // ── Volume and mute ────────────────────────────────────────────────────

    pub fn set_volume(&self, left: f32, right: f32) {
        self.inner.volume_bits[0].store(left.to_bits(), Ordering::Relaxed);
        self.inner.volume_bits[1].store(right.to_bits(), Ordering::Relaxed);
        // One packed store is the cross-process delivery.
        self.inner
            .memory
            .control_block()
            .store_volume_lr(pack_volume(left, right));
    }

    pub fn volume(&self) -> (f32, f32) {
        (
            f32::from_bits(self.inner.volume_bits[0].load(Ordering::Relaxed)),
            f32::from_bits(self.inner.volume_bits[1].load(Ordering::Relaxed)),
        )
    }

    pub fn mute(&self, muted: bool) {
        self.inner.server.set_mute(muted);
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    // ── Loop and position ──────────────────────────────────────────────────

    /// Configure loop playback over `[start, end)` absolute frames for
    /// `count` passes (`0` clears, negative loops forever).
    pub fn set_loop(&self, start: u32, end: u32, count: i32) -> TrackResult<()> {
        self.inner.set_loop(start, end, count)
    }

    pub fn loop_state(&self) -> LoopSettings {
        let cblk = self.inner.memory.control_block();
        let count = cblk.loop_count();
        LoopSettings {
            start: cblk.loop_start(),
            end: cblk.loop_end(),
            count: if count < 0 { -1 } else { count },
        }
    }

    /// Arm the one-shot marker event; `0` disarms it. Requires a callback.
    pub fn set_marker_position(&self, marker: u32) -> TrackResult<()> {
        if self.inner.callback.is_none() {
            return Err(TrackError::InvalidOperation(
                "marker events need a callback",
            ));
        }
        self.inner.marker_position.store(marker, Ordering::Relaxed);
        Ok(())
    }

    pub fn marker_position(&self) -> u32 {
        self.inner.marker_position.load(Ordering::Relaxed)
    }

    /// Configure periodic position events every `period` frames, measured
    /// from the current playback position. Requires a callback.
    pub fn set_position_update_period(&self, period: u32) -> TrackResult<()> {
        if self.inner.callback.is_none() {
            return Err(TrackError::InvalidOperation(
                "position events need a callback",
            ));
        }
        let position = self.position();
        self.inner
            .new_position
            .store(position.wrapping_add(period), Ordering::Relaxed);
        self.inner.update_period.store(period, Ordering::Relaxed);
        Ok(())
    }

    pub fn position_update_period(&self) -> u32 {
        self.inner.update_period.load(Ordering::Relaxed)
    }

    /// Seek the consumer cursor. Only while stopped, and never past data
    /// the producer has written.
    pub fn set_position(&self, position: u32) -> TrackResult<()> {
        let cblk = self.inner.memory.control_block();
        let _guard = cblk.lock.lock();

        if self.inner.is_active() {
            return Err(TrackError::InvalidOperation("seek on an active track"));
        }
        if position > cblk.user() {
            return Err(TrackError::BadValue("seek past the producer cursor"));
        }

        cblk.store_server(position);
        // The producer is now behind the consumer; tell the mixer to
        // re-read before judging readiness.
        cblk.set_force_ready();
        Ok(())
    }

    /// Current playback position in frames.
    pub fn position(&self) -> u32 {
        self.inner.memory.control_block().server()
    }

    // ── I/O ────────────────────────────────────────────────────────────────

    /// Copy `data` into the ring, blocking for space as needed. Returns the
    /// bytes consumed from `data`, which is less than `data.len()` only if
    /// the track stopped underway.
    pub fn write(&self, data: &[u8]) -> TrackResult<usize> {
        self.inner.write(data)
    }

    /// Acquire a window of ring space. See [`AudioBuffer`] for the
    /// descriptor contract; `Err(Stopped)` still carries a valid window.
    pub fn obtain_buffer(
        &self,
        audio_buffer: &mut AudioBuffer,
        blocking: bool,
    ) -> TrackResult<()> {
        self.inner.obtain_buffer(audio_buffer, blocking)
    }

    /// Publish a previously obtained window to the consumer.
    pub fn release_buffer(&self, audio_buffer: &AudioBuffer) {
        self.inner.release_buffer(audio_buffer);
    }

    // ── Diagnostics ────────────────────────────────────────────────────────

    /// Write a multi-line state snapshot, one field group per line.
    pub fn dump<W: IoWrite>(&self, w: &mut W) -> io::Result<()> {
        let (left, right) = self.volume();
        writeln!(w, " Track::dump")?;
        writeln!(
            w,
            "  stream type({:?}), left - right volume({}, {})",
            self.inner.stream_type, left, right
        )?;
        writeln!(
            w,
            "  format({:?}), channel count({}), frame count({})",
            self.inner.format, self.inner.channel_count, self.inner.frame_count
        )?;
        writeln!(
            w,
            "  sample rate({}), status({}), muted({})",
            self.sample_rate(),
            if self.init_check().is_ok() { "ok" } else { "dead" },
            self.muted()
        )?;
        writeln!(
            w,
            "  active({}), latency ({})",
            self.inner.is_active(),
            self.inner.latency_ms
        )?;
        Ok(())
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        // Stop first so the pump loop stops asking for buffers, then wake
        // anything still blocked on the condvar before joining.
        self.inner.stop();
        if let Some(worker) = &self.inner.worker {
            worker.request_exit();
            self.inner.memory.control_block().cv.notify_one();
            worker.join();
        }
    }
}

impl TrackInner {
    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) & ACTIVE_BIT != 0
    }

    pub(crate) fn start(self: &Arc<Self>) {
        if let Some(worker) = &self.worker {
            // The pump thread restarting itself would deadlock on the join
            // inside `run`; a start from inside the callback is a no-op.
            if worker.is_worker_thread() {
                log::error!("start() called from the callback thread");
                return;
            }
        }

        let _transport = self.transport_lock.lock();
        if self.active.fetch_or(ACTIVE_BIT, Ordering::AcqRel) & ACTIVE_BIT == 0 {
            let cblk = self.memory.control_block();
            if self.shared_buffer.is_some() {
                // The region is preloaded; present the ring as full.
                cblk.store_user(self.frame_count);
                cblk.clear_flow_control_flag();
            }
            self.new_position.store(
                cblk.server()
                    .wrapping_add(self.update_period.load(Ordering::Relaxed)),
                Ordering::Relaxed,
            );
            match &self.worker {
                Some(worker) => worker.run(Arc::clone(self)),
                None => self.priority.raise(),
            }
            self.server.start();
        }
    }

    pub(crate) fn stop(&self) {
        let _transport = self.transport_lock.lock();
        if self.active.fetch_and(!ACTIVE_BIT, Ordering::AcqRel) & ACTIVE_BIT != 0 {
            self.server.stop();
            // A stop inside a loop window would otherwise keep playing
            // until the pass count drains.
            let _ = self.set_loop(0, 0, 0);
            // The server only notices the end of a shared buffer through a
            // flush.
            if self.shared_buffer.is_some() {
                self.flush();
            }
            match &self.worker {
                Some(worker) => worker.request_exit(),
                None => self.priority.lower(),
            }
        }
    }

    pub(crate) fn pause(&self) {
        if self.active.fetch_and(!ACTIVE_BIT, Ordering::AcqRel) & ACTIVE_BIT != 0 {
            self.server.pause();
        }
    }

    pub(crate) fn flush(&self) {
        if self.is_active() {
            return;
        }
        let cblk = self.memory.control_block();
        let _guard = cblk.lock.lock();
        self.server.flush();
        // Release a producer waiting for space against the old cursors.
        cblk.cv.notify_one();
    }

    pub(crate) fn reload(&self) -> TrackResult<()> {
        if self.is_active() {
            return Err(TrackError::InvalidOperation("reload on an active track"));
        }
        self.flush();
        self.memory.control_block().step_user(self.frame_count);
        Ok(())
    }

    pub(crate) fn set_loop(&self, start: u32, end: u32, count: i32) -> TrackResult<()> {
        let cblk = self.memory.control_block();
        let _guard = cblk.lock.lock();

        if count == 0 {
            cblk.store_loop(NO_LOOP, NO_LOOP, 0);
            self.loop_count.store(0, Ordering::Relaxed);
            return Ok(());
        }

        if start >= end
            || start < cblk.user()
            || end - start > self.frame_count
        {
            log::warn!(
                "set_loop rejected: start {}, end {}, count {}, frame count {}, user {}",
                start,
                end,
                count,
                self.frame_count,
                cblk.user()
            );
            return Err(TrackError::BadValue("loop window out of range"));
        }

        cblk.store_loop(start, end, count);
        self.loop_count.store(count, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn obtain_buffer(
        &self,
        audio_buffer: &mut AudioBuffer,
        blocking: bool,
    ) -> TrackResult<()> {
        let cblk = self.memory.control_block();
        let mut frames_req = audio_buffer.frame_count;
        audio_buffer.reset();

        let mut timed_out = false;
        let mut frames_avail = cblk.frames_available();

        if frames_avail == 0 {
            let mut guard = cblk.lock.lock();
            frames_avail = cblk.frames_available_locked(&guard);
            while frames_avail == 0 {
                if !self.is_active() {
                    log::debug!("obtain_buffer: not active, no more buffers");
                    return Err(TrackError::NoMoreBuffers);
                }
                if !blocking {
                    return Err(TrackError::WouldBlock);
                }
                timed_out = false;
                let result = cblk.cv.wait_for(&mut guard, OBTAIN_TIMEOUT);
                if result.timed_out() {
                    log::warn!(
                        "obtain_buffer timed out (is the consumer stalled?) user={:08x} server={:08x}",
                        cblk.user(),
                        cblk.server()
                    );
                    self.server.kick();
                    timed_out = true;
                }
                frames_avail = cblk.frames_available_locked(&guard);
            }
        }

        if frames_req > frames_avail {
            frames_req = frames_avail;
        }

        // Never hand out a window that crosses the ring wrap.
        let u = cblk.user();
        let contiguous = cblk
            .user_base()
            .wrapping_add(cblk.frame_count())
            .wrapping_sub(u);
        if frames_req > contiguous {
            frames_req = contiguous;
        }

        if timed_out {
            log::warn!(
                "obtain_buffer recovered right after a timeout; consumer is limping (user={:08x} server={:08x})",
                cblk.user(),
                cblk.server()
            );
        }

        audio_buffer.grant(
            cblk.buffer_at(u),
            frames_req,
            self.channel_count,
            self.muted.load(Ordering::Relaxed),
        );

        if self.is_active() {
            Ok(())
        } else {
            Err(TrackError::Stopped)
        }
    }

    pub(crate) fn release_buffer(&self, audio_buffer: &AudioBuffer) {
        self.memory.control_block().step_user(audio_buffer.frame_count);
    }

    pub(crate) fn write(&self, data: &[u8]) -> TrackResult<usize> {
        if self.shared_buffer.is_some() {
            return Err(TrackError::InvalidOperation(
                "write on a shared-buffer track",
            ));
        }

        log::debug!("write {} bytes, active={}", data.len(), self.is_active());

        let mut written = 0usize;
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut frames = remaining.len() / self.channel_count as usize;
            if self.format == SampleFormat::Pcm16Bit {
                frames /= 2;
            }
            if frames == 0 {
                // Trailing partial frame; nothing more to place.
                break;
            }

            let mut audio_buffer = AudioBuffer::request(frames as u32);
            match self.obtain_buffer(&mut audio_buffer, true) {
                // A stopped grant is still a grant; keep draining the
                // caller's bytes until the ring refuses more.
                Ok(()) | Err(TrackError::Stopped) => {}
                Err(TrackError::NoMoreBuffers) => break,
                Err(err) => return Err(err),
            }

            let to_write = match self.format {
                SampleFormat::Pcm8Bit => {
                    // Half the window in source bytes; each byte expands to
                    // one 16-bit sample.
                    let count = audio_buffer.size / 2;
                    al_core::expand_pcm8(
                        &remaining[..count],
                        &mut audio_buffer.samples_mut()[..count],
                    );
                    count
                }
                SampleFormat::Pcm16Bit => {
                    let count = audio_buffer.size;
                    audio_buffer.bytes_mut()[..count]
                        .copy_from_slice(&remaining[..count]);
                    count
                }
            };

            remaining = &remaining[to_write..];
            written += to_write;
            self.release_buffer(&audio_buffer);
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use al_core::unpack_volume;

    /// Passive mixer: creates regions but never consumes.
    struct StubMixer {
        frame_cap: u32,
    }

    impl StubMixer {
        fn new() -> Arc<Self> {
            Arc::new(Self { frame_cap: u32::MAX })
        }

        fn with_frame_cap(frame_cap: u32) -> Arc<Self> {
            Arc::new(Self { frame_cap })
        }
    }

    // 20 ms blocks at 48 kHz with one block of latency: the minimum ring is
    // 960 frames at the native rate.
    impl MixerServer for StubMixer {
        fn output_sample_rate(&self) -> TrackResult<u32> {
            Ok(48_000)
        }

        fn output_frame_count(&self) -> TrackResult<u32> {
            Ok(960)
        }

        fn output_latency_ms(&self) -> TrackResult<u32> {
            Ok(20)
        }

        fn create_track(
            &self,
            params: &TrackParams,
        ) -> TrackResult<Arc<dyn ServerHandle>> {
            let frames = params.frame_count.min(self.frame_cap);
            let memory = match &params.shared_buffer {
                Some(buffer) => TrackMemory::with_shared_buffer(
                    frames,
                    params.channel_count,
                    buffer.clone(),
                ),
                None => TrackMemory::allocate(frames, params.channel_count),
            };
            Ok(Arc::new(StubHandle { memory }))
        }
    }

    struct StubHandle {
        memory: Arc<TrackMemory>,
    }

    impl ServerHandle for StubHandle {
        fn memory(&self) -> &Arc<TrackMemory> {
            &self.memory
        }

        fn start(&self) {}

        fn stop(&self) {}

        fn pause(&self) {}

        fn flush(&self) {
            let cblk = self.memory.control_block();
            cblk.store_user(0);
            cblk.store_server(0);
            cblk.store_user_base(0);
            cblk.store_server_base(0);
        }

        fn set_mute(&self, _muted: bool) {}
    }

    fn stereo_16(frame_count: u32) -> TrackConfig {
        TrackConfig {
            sample_rate: 48_000,
            channel_count: 2,
            frame_count,
            ..TrackConfig::default()
        }
    }

    #[test]
    fn test_defaults_resolve_against_the_server() {
        let track = Track::new(StubMixer::new(), TrackConfig::default(), None).unwrap();
        assert_eq!(track.sample_rate(), 48_000);
        assert_eq!(track.channel_count(), 2);
        assert_eq!(track.frame_count(), 960);
        assert_eq!(track.inner.notification_frames, 480);
        // One server block of latency plus one ring of depth.
        assert_eq!(track.latency(), 40);
    }

    #[test]
    fn test_notification_frames_clamped_to_half_ring() {
        let config = TrackConfig {
            notification_frames: 4000,
            ..stereo_16(1920)
        };
        let track = Track::new(StubMixer::new(), config, None).unwrap();
        assert_eq!(track.inner.notification_frames, 960);
    }

    #[test]
    fn test_rejects_bad_channel_count() {
        let config = TrackConfig {
            channel_count: 3,
            ..TrackConfig::default()
        };
        assert!(matches!(
            Track::new(StubMixer::new(), config, None),
            Err(TrackError::BadValue(_))
        ));
    }

    #[test]
    fn test_rejects_8bit_shared_buffer() {
        let config = TrackConfig {
            format: SampleFormat::Pcm8Bit,
            channel_count: 1,
            ..TrackConfig::default()
        };
        let buffer = SharedBuffer::new(4096);
        assert!(matches!(
            Track::with_shared_buffer(StubMixer::new(), config, buffer, None),
            Err(TrackError::BadValue(_))
        ));
    }

    #[test]
    fn test_rejects_ring_below_server_minimum() {
        assert!(matches!(
            Track::new(StubMixer::new(), stereo_16(100), None),
            Err(TrackError::BadValue(_))
        ));
    }

    #[test]
    fn test_reads_back_granted_frame_count() {
        let track =
            Track::new(StubMixer::with_frame_cap(960), stereo_16(1920), None).unwrap();
        assert_eq!(track.frame_count(), 960);
    }

    #[test]
    fn test_volume_reaches_the_control_block() {
        let track = Track::new(StubMixer::new(), stereo_16(960), None).unwrap();
        assert_eq!(
            track.inner.memory.control_block().volume_lr(),
            0x1000_1000,
            "fresh tracks play at unity gain"
        );

        track.set_volume(0.5, 0.25);
        assert_eq!(track.volume(), (0.5, 0.25));
        let (l, r) = unpack_volume(track.inner.memory.control_block().volume_lr());
        assert_eq!((l, r), (0x0800, 0x0400));
    }

    #[test]
    fn test_start_stop_transitions_are_idempotent() {
        let track = Track::new(StubMixer::new(), stereo_16(960), None).unwrap();

        assert!(track.stopped());
        track.start();
        assert!(!track.stopped());
        track.start();
        assert!(!track.stopped());
        track.stop();
        assert!(track.stopped());
        track.stop();
        assert!(track.stopped());
    }

    #[test]
    fn test_shared_buffer_start_presents_full_ring() {
        let buffer = SharedBuffer::new(4096);
        let track = Track::with_shared_buffer(
            StubMixer::new(),
            TrackConfig::default(),
            buffer,
            None,
        )
        .unwrap();
        let cblk = track.inner.memory.control_block();

        track.start();
        assert_eq!(cblk.user(), track.frame_count());
        assert_eq!(cblk.flow_control_flag(), 0);
        track.stop();
    }

    #[test]
    fn test_write_primes_a_stopped_ring() {
        let track = Track::new(StubMixer::new(), stereo_16(960), None).unwrap();
        // With room in the ring, writes land even before start; that is how
        // callers prime playback.
        let written = track.write(&vec![0u8; 100 * 4]).unwrap();
        assert_eq!(written, 400);
        assert_eq!(track.inner.memory.control_block().user(), 100);
    }

    #[test]
    fn test_reload_requires_stopped() {
        let buffer = SharedBuffer::new(4096);
        let track = Track::with_shared_buffer(
            StubMixer::new(),
            TrackConfig::default(),
            buffer,
            None,
        )
        .unwrap();
        track.start();
        assert!(matches!(
            track.reload(),
            Err(TrackError::InvalidOperation(_))
        ));
        track.stop();
        track.reload().unwrap();
        assert_eq!(
            track.inner.memory.control_block().user(),
            track.frame_count()
        );
    }
}
