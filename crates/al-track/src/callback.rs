//! Pump thread
//!
//! One named worker per callback-driven track. Each pass of
//! `process_audio_buffer` reports underruns, drains loop/marker/period
//! events and refills the ring through the more-data callback; the loop
//! ends when the pass reports a terminal condition or an exit was
//! requested.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use al_core::{expand_pcm8_in_place, SampleFormat, TrackError};

use crate::buffer::AudioBuffer;
use crate::events::TrackEvent;
use crate::track::TrackInner;

/// Idle backoff when a pass produced nothing; the ring is full and polling
/// harder would just burn the core.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Handle to the track's pump worker.
pub(crate) struct CallbackThread {
    state: Mutex<WorkerState>,
    exit_requested: AtomicBool,
}

struct WorkerState {
    handle: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl CallbackThread {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState {
                handle: None,
                worker_id: None,
            }),
            exit_requested: AtomicBool::new(false),
        }
    }

    /// True when called from the pump thread itself.
    pub(crate) fn is_worker_thread(&self) -> bool {
        self.state.lock().worker_id == Some(thread::current().id())
    }

    /// Start the pump loop, reaping a previously finished worker first.
    /// No-op when the loop is still running.
    pub(crate) fn run(&self, inner: Arc<TrackInner>) {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            if !handle.is_finished() {
                state.handle = Some(handle);
                return;
            }
            let _ = handle.join();
            state.worker_id = None;
        }

        self.exit_requested.store(false, Ordering::Release);
        match thread::Builder::new()
            .name("al-track-pump".into())
            .spawn(move || {
                let Some(worker) = inner.worker.as_ref() else {
                    return;
                };
                loop {
                    if worker.exit_requested() {
                        break;
                    }
                    if !inner.process_audio_buffer() {
                        break;
                    }
                }
            }) {
            Ok(handle) => {
                state.worker_id = Some(handle.thread().id());
                state.handle = Some(handle);
            }
            Err(err) => {
                log::error!("failed to spawn track pump thread: {}", err);
            }
        }
    }

    /// Ask the loop to end after the current pass; does not wait.
    pub(crate) fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    /// Wait for the worker to finish.
    pub(crate) fn join(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.worker_id = None;
            state.handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl TrackInner {
    /// One pump pass. Returns `false` to end the loop.
    pub(crate) fn process_audio_buffer(self: &Arc<Self>) -> bool {
        let cblk = self.memory.control_block();

        // Starvation: report once per gap, then wait for a producer advance
        // to clear the flag.
        if self.is_active() && cblk.frames_ready() == 0 {
            log::debug!(
                "underrun user={:08x} server={:08x} flow_control={}",
                cblk.user(),
                cblk.server(),
                cblk.flow_control_flag()
            );
            if cblk.flow_control_flag() == 0 {
                self.dispatch(TrackEvent::Underrun);
                if cblk.server() == self.frame_count {
                    self.dispatch(TrackEvent::BufferEnd);
                }
                cblk.set_flow_control_flag();
                if self.shared_buffer.is_some() {
                    // A one-shot region that ran dry is finished.
                    return false;
                }
            }
        }

        // Loop passes completed since the last pump.
        while self.loop_count.load(Ordering::Relaxed) > cblk.loop_count() {
            let mine = self.loop_count.load(Ordering::Relaxed) - 1;
            self.loop_count.store(mine, Ordering::Relaxed);
            let remaining = if mine >= 0 { mine } else { -1 };
            self.dispatch(TrackEvent::LoopEnd { remaining });
        }

        // One-shot marker.
        let marker = self.marker_position.load(Ordering::Relaxed);
        if marker > 0 && cblk.server() >= marker {
            self.dispatch(TrackEvent::Marker { frame: marker });
            self.marker_position.store(0, Ordering::Relaxed);
        }

        // Periodic position updates.
        if self.update_period.load(Ordering::Relaxed) > 0 {
            while cblk.server() >= self.new_position.load(Ordering::Relaxed) {
                let frame = self.new_position.load(Ordering::Relaxed);
                self.dispatch(TrackEvent::NewPosition { frame });
                self.new_position.store(
                    frame.wrapping_add(self.update_period.load(Ordering::Relaxed)),
                    Ordering::Relaxed,
                );
            }
        }

        // A shared buffer needs no refill; the client preloaded it.
        let mut frames = if self.shared_buffer.is_some() {
            0
        } else {
            self.remaining_frames.load(Ordering::Relaxed)
        };
        let mut written_size = 0usize;

        loop {
            let mut audio_buffer = AudioBuffer::request(frames);
            match self.obtain_buffer(&mut audio_buffer, false) {
                Ok(()) => {}
                // Routine backpressure; fall through to the empty-window
                // break below.
                Err(TrackError::WouldBlock) => {}
                Err(TrackError::Stopped) => return false,
                Err(err) => {
                    log::error!("failed to obtain an audio buffer ({}), giving up", err);
                    return false;
                }
            }

            if audio_buffer.size == 0 {
                break;
            }

            // The callback fills half the window for 8-bit tracks; the
            // in-place expansion doubles it back afterwards.
            if self.format == SampleFormat::Pcm8Bit {
                audio_buffer.size /= 2;
            }
            let req_size = audio_buffer.size;
            self.dispatch(TrackEvent::MoreData(&mut audio_buffer));
            written_size = audio_buffer.size;

            if written_size == 0 {
                break;
            }
            if written_size > req_size {
                written_size = req_size;
            }

            if self.format == SampleFormat::Pcm8Bit {
                // SAFETY: the window holds `written_size` callback bytes at
                // its base and room for as many 16-bit samples; the
                // descending expansion never overtakes the unread bytes.
                unsafe { expand_pcm8_in_place(audio_buffer.raw(), written_size) };
                written_size *= 2;
            }

            audio_buffer.size = written_size;
            audio_buffer.frame_count =
                (written_size / self.channel_count as usize / 2) as u32;
            frames = frames.saturating_sub(audio_buffer.frame_count);
            self.release_buffer(&audio_buffer);

            if frames == 0 {
                break;
            }
        }

        // Nothing was placed; the ring is full. Yield before polling again.
        if written_size == 0 {
            thread::sleep(IDLE_SLEEP);
        }

        self.remaining_frames.store(
            if frames == 0 {
                self.notification_frames
            } else {
                frames
            },
            Ordering::Relaxed,
        );
        true
    }

    fn dispatch(&self, event: TrackEvent<'_>) {
        if let Some(callback) = &self.callback {
            let mut guard = callback.lock();
            (&mut **guard)(event);
        }
    }
}
