#![allow(dead_code)]

//! Test mixer: an in-process stand-in for the out-of-process consumer.
//!
//! `FakeMixer` implements the server contracts; each created track gets a
//! consumer thread that drains the ring through `step_server`, honouring
//! loop windows, and records everything it consumed for verification.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use al_core::{ControlBlock, NO_LOOP};
use al_track::{MixerServer, ServerHandle, TrackMemory, TrackParams, TrackResult};

/// Events recorded by test callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestEvent {
    Underrun,
    BufferEnd,
    LoopEnd(i32),
    Marker(u32),
    NewPosition(u32),
}

/// Shared vector the test callbacks push into.
pub type EventLog = Arc<Mutex<Vec<TestEvent>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub struct FakeMixer {
    sample_rate: u32,
    frame_count: u32,
    latency_ms: u32,
    /// Cap on granted ring sizes, to exercise the read-back path.
    max_track_frames: u32,
    handles: Mutex<Vec<Arc<FakeTrackHandle>>>,
}

impl FakeMixer {
    /// Mixer with a 1024-frame block at 44.1 kHz and ~46 ms of latency,
    /// giving a 2-block minimum ring.
    pub fn new() -> Arc<Self> {
        Self::with_output(44_100, 1024, 46)
    }

    pub fn with_output(sample_rate: u32, frame_count: u32, latency_ms: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            frame_count,
            latency_ms,
            max_track_frames: u32::MAX,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Mixer that silently grants smaller rings than requested.
    pub fn with_track_frame_cap(cap: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate: 44_100,
            frame_count: 1024,
            latency_ms: 46,
            max_track_frames: cap,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Handle of the most recently created track.
    pub fn last_handle(&self) -> Arc<FakeTrackHandle> {
        self.handles
            .lock()
            .last()
            .cloned()
            .expect("no track created yet")
    }
}

impl MixerServer for FakeMixer {
    fn output_sample_rate(&self) -> TrackResult<u32> {
        Ok(self.sample_rate)
    }

    fn output_frame_count(&self) -> TrackResult<u32> {
        Ok(self.frame_count)
    }

    fn output_latency_ms(&self) -> TrackResult<u32> {
        Ok(self.latency_ms)
    }

    fn create_track(&self, params: &TrackParams) -> TrackResult<Arc<dyn ServerHandle>> {
        let frames = params.frame_count.min(self.max_track_frames);
        let memory = match &params.shared_buffer {
            Some(buffer) => {
                TrackMemory::with_shared_buffer(frames, params.channel_count, buffer.clone())
            }
            None => TrackMemory::allocate(frames, params.channel_count),
        };
        let handle = FakeTrackHandle::spawn(memory);
        self.handles.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}

/// Switches and counters shared between the handle and its drain thread.
#[derive(Default)]
struct DrainState {
    playing: AtomicBool,
    /// Cleared to simulate a consumer that stopped making progress.
    draining: AtomicBool,
    shutdown: AtomicBool,
    start_calls: AtomicU32,
    /// Stop consuming once this many frames went through.
    frame_budget: AtomicU64,
    consumed_frames: AtomicU64,
    consumed: Mutex<Vec<i16>>,
}

/// Server side of one fake track: a consumer thread plus the switches the
/// tests flip to simulate a healthy, paused or wedged mixer.
pub struct FakeTrackHandle {
    memory: Arc<TrackMemory>,
    state: Arc<DrainState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Frames the consumer takes per pass. The pace is brisk enough to finish
/// tests quickly but leaves the 5 ms pump loop several passes per loop
/// window, as a real-time mixer would.
const DRAIN_CHUNK: u32 = 256;
/// Consumer pass interval.
const DRAIN_PACE: Duration = Duration::from_millis(2);

impl FakeTrackHandle {
    fn spawn(memory: Arc<TrackMemory>) -> Arc<Self> {
        let state = Arc::new(DrainState {
            draining: AtomicBool::new(true),
            frame_budget: AtomicU64::new(u64::MAX),
            ..DrainState::default()
        });

        let thread_state = Arc::clone(&state);
        let thread_memory = Arc::clone(&memory);
        let join = thread::Builder::new()
            .name("fake-mixer-drain".into())
            .spawn(move || drain_loop(&thread_memory, &thread_state))
            .expect("spawn fake mixer thread");

        Arc::new(Self {
            memory,
            state,
            thread: Mutex::new(Some(join)),
        })
    }

    pub fn set_draining(&self, draining: bool) {
        self.state.draining.store(draining, Ordering::Release);
    }

    pub fn set_frame_budget(&self, frames: u64) {
        self.state.frame_budget.store(frames, Ordering::Release);
    }

    pub fn start_calls(&self) -> u32 {
        self.state.start_calls.load(Ordering::Acquire)
    }

    pub fn consumed_frames(&self) -> u64 {
        self.state.consumed_frames.load(Ordering::Acquire)
    }

    pub fn consumed(&self) -> Vec<i16> {
        self.state.consumed.lock().clone()
    }

    /// Spin until the consumer went through `frames` frames.
    pub fn wait_consumed(&self, frames: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.consumed_frames() < frames {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl ServerHandle for FakeTrackHandle {
    fn memory(&self) -> &Arc<TrackMemory> {
        &self.memory
    }

    fn start(&self) {
        self.state.start_calls.fetch_add(1, Ordering::AcqRel);
        self.state.playing.store(true, Ordering::Release);
        // A start revives a wedged consumer, which is what the client-side
        // kick relies on.
        self.state.draining.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.state.playing.store(false, Ordering::Release);
    }

    fn pause(&self) {
        self.state.playing.store(false, Ordering::Release);
    }

    fn flush(&self) {
        let cblk = self.memory.control_block();
        cblk.store_user(0);
        cblk.store_server(0);
        cblk.store_user_base(0);
        cblk.store_server_base(0);
    }

    fn set_mute(&self, _muted: bool) {}
}

impl Drop for FakeTrackHandle {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.thread.lock().take() {
            let _ = join.join();
        }
    }
}

fn drain_loop(memory: &TrackMemory, state: &DrainState) {
    let cblk = memory.control_block();
    loop {
        if state.shutdown.load(Ordering::Acquire) {
            break;
        }
        if state.playing.load(Ordering::Acquire) && state.draining.load(Ordering::Acquire)
        {
            drain_once(cblk, state);
        }
        thread::sleep(DRAIN_PACE);
    }
}

fn drain_once(cblk: &ControlBlock, state: &DrainState) {
    let ready = cblk.frames_ready();
    if ready == 0 {
        return;
    }

    let mut n = if ready == u32::MAX {
        DRAIN_CHUNK
    } else {
        DRAIN_CHUNK.min(ready)
    };

    // Honour the frame budget the test set.
    let budget = state.frame_budget.load(Ordering::Acquire);
    let total = state.consumed_frames.load(Ordering::Acquire);
    if total >= budget {
        return;
    }
    n = n.min((budget - total) as u32);

    // Consume up to the loop end, never across it; the cursor step does the
    // wrap.
    let s = cblk.server();
    let loop_end = cblk.loop_end();
    if loop_end != NO_LOOP && s < loop_end {
        n = n.min(loop_end - s);
    }
    if n == 0 {
        return;
    }

    let samples = read_ring(cblk, s, n);
    if !cblk.step_server(n) {
        // Lock contention; retry next pass.
        return;
    }
    state.consumed.lock().extend_from_slice(&samples);
    state.consumed_frames.fetch_add(n as u64, Ordering::AcqRel);
}

/// Copy `n` frames starting at absolute consumer offset `s` out of the ring.
fn read_ring(cblk: &ControlBlock, s: u32, n: u32) -> Vec<i16> {
    let frame_count = cblk.frame_count();
    let channels = cblk.channels();
    let offset = s.wrapping_sub(cblk.server_base());
    // `buffer_at` translates through the producer base; feeding it that
    // base yields the raw start of the sample area.
    let base = cblk.buffer_at(cblk.user_base());

    let mut out = vec![0i16; n as usize * channels as usize];
    let first = (frame_count - offset).min(n);
    unsafe {
        std::ptr::copy_nonoverlapping(
            base.add(offset as usize * channels as usize) as *const i16,
            out.as_mut_ptr(),
            first as usize * channels as usize,
        );
        if n > first {
            std::ptr::copy_nonoverlapping(
                base as *const i16,
                out.as_mut_ptr().add(first as usize * channels as usize),
                (n - first) as usize * channels as usize,
            );
        }
    }
    out
}
