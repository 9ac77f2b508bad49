//! The pacing scheduler.
//!
//! [`FrameScheduler`] owns the ingestion queue and the single worker that
//! drains it: for each queued frame it decides when the frame should be shown
//! and whether it should be dropped, then hands it to the attached
//! [`DisplayBackend`] at the right wall-clock moment.
//!
//! Two pacing algorithms exist, selected by the session's tunnel flag. In
//! tunnel mode the worker asks the engine for an estimated wall-clock display
//! time per pts and sleeps out the difference to the next vsync. In policy
//! mode the engine returns an explicit `{output, hold, drop}` verdict per
//! frame. When the engine is unbound or silent the worker degrades to
//! pts-delta pacing so playback never stalls on a missing collaborator.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use log::{debug, info, warn};

use std::{
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::backend::{BackendState, DisplayBackend};
use crate::clock::{self, monotonic_us};
use crate::frames::{FrameBuffer, PTS_UNKNOWN};
use crate::pool::FrameLifecycle;
use crate::queue::FrameQueue;
use crate::session::{SyncEngine, SyncMode, SyncPolicy, SyncSession};
use crate::{Error, Result};

/// Worker wake quantum while paused, flushing, or waiting on the engine.
const SCHED_QUANTUM_US: i64 = 4_000;
/// Smallest honored policy hold; engines occasionally return a non-positive
/// duration.
const MIN_HOLD_US: i64 = 4_000;
/// Bounded wait for the audio anchor in amaster tunnel mode before demoting
/// the session to vmaster.
const AUDIO_ANCHOR_WAIT_CEILING_US: i64 = 3_000_000;
/// Bounded cumulative policy hold before the head frame is output anyway.
const POLICY_HOLD_CEILING_US: i64 = 3_000_000;
/// Latency between handing a frame to a backend and light leaving the panel.
const OUTPUT_LATENCY_US: i64 = 16_000;
/// Number of leading frames over which the input interval is averaged.
const FPS_ESTIMATE_WINDOW: u32 = 100;
/// Sanity bound for an explicitly configured frame rate.
const MAX_CONFIGURED_FPS: i64 = 1_000;

/// Keys accepted by [`FrameScheduler::set_prop`] and
/// [`FrameScheduler::get_prop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum PropertyKey {
    SyncMode = 0,
    TunnelMode,
    DemuxId,
    PcrId,
    HasAudio,
    SourceType,
    WorkMode,
    StartThreshold,
    DisplayLatency,
    PlayerInstanceId,
    FrameRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Paused,
    Flushing,
}

struct Shown {
    pts_us: i64,
    wall_us: i64,
}

struct SchedState {
    run: RunState,
    resume_to: RunState,
    stop: bool,
    anchored: bool,
    last_input_pts: i64,
    input_count: u64,
    interval_sum_us: i64,
    interval_samples: u32,
    configured_fps: i64,
    last_shown: Option<Shown>,
    audio_anchor_wait_us: i64,
    policy_hold_us: i64,
}

impl SchedState {
    /// Estimated or configured input interval, when one exists.
    fn interval_us(&self) -> Option<i64> {
        if self.configured_fps > 0 {
            Some(1_000_000 / self.configured_fps)
        } else if self.interval_samples > 0 {
            Some(self.interval_sum_us / i64::from(self.interval_samples))
        } else {
            None
        }
    }

    /// Back-off used when no frame is ready.
    fn default_backoff_us(&self) -> i64 {
        self.interval_us().unwrap_or(SCHED_QUANTUM_US).max(1)
    }
}

struct Shared {
    queue: FrameQueue<FrameBuffer>,
    lifecycle: FrameLifecycle,
    session: SyncSession,
    backend: Mutex<Option<Arc<dyn DisplayBackend>>>,
    state: Mutex<SchedState>,
    cv: Condvar,
}

/// Construction parameters for a [`FrameScheduler`].
pub struct SchedulerOptions {
    engine: Arc<dyn SyncEngine>,
    lifecycle: FrameLifecycle,
    backend: Option<Arc<dyn DisplayBackend>>,
    fps: i64,
    tunnel_mode: bool,
}

impl SchedulerOptions {
    /// Creates a builder over the required collaborators.
    pub fn builder(engine: Arc<dyn SyncEngine>, lifecycle: FrameLifecycle) -> SchedulerOptionsBuilder {
        SchedulerOptionsBuilder {
            engine,
            lifecycle,
            backend: None,
            fps: None,
            tunnel_mode: false,
        }
    }
}

/// Builder for [`SchedulerOptions`] with ergonomic method chaining.
pub struct SchedulerOptionsBuilder {
    engine: Arc<dyn SyncEngine>,
    lifecycle: FrameLifecycle,
    backend: Option<Arc<dyn DisplayBackend>>,
    fps: Option<i64>,
    tunnel_mode: bool,
}

impl SchedulerOptionsBuilder {
    /// Attaches the display backend frames are handed to.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn DisplayBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Configures an explicit input frame rate instead of estimating one.
    #[must_use]
    pub fn frame_rate(mut self, fps: u32) -> Self {
        self.fps = Some(i64::from(fps));
        self
    }

    /// Selects the tunnel-mode pacing algorithm.
    #[must_use]
    pub fn tunnel_mode(mut self, on: bool) -> Self {
        self.tunnel_mode = on;
        self
    }

    /// Builds the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the configured frame rate
    /// is zero or implausibly large.
    pub fn build(self) -> Result<SchedulerOptions> {
        if let Some(fps) = self.fps {
            if fps <= 0 || fps > MAX_CONFIGURED_FPS {
                return Err(Error::InvalidConfiguration(format!(
                    "frame rate {fps} out of range 1..={MAX_CONFIGURED_FPS}"
                )));
            }
        }
        Ok(SchedulerOptions {
            engine: self.engine,
            lifecycle: self.lifecycle,
            backend: self.backend,
            fps: self.fps.unwrap_or(0),
            tunnel_mode: self.tunnel_mode,
        })
    }
}

/// The single cooperative worker that paces frame presentation.
///
/// Created from [`SchedulerOptions`]; the worker thread starts lazily on the
/// first [`display_frame`](Self::display_frame) and stops on
/// [`stop`](Self::stop) or drop.
pub struct FrameScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameScheduler {
    /// Creates a scheduler from the given options.
    pub fn new(options: SchedulerOptions) -> Self {
        clock::init();
        let session = SyncSession::new(options.engine);
        session.set_tunnel_mode(options.tunnel_mode);
        Self {
            shared: Arc::new(Shared {
                queue: FrameQueue::new(),
                lifecycle: options.lifecycle,
                session,
                backend: Mutex::new(options.backend),
                state: Mutex::new(SchedState {
                    run: RunState::Idle,
                    resume_to: RunState::Idle,
                    stop: false,
                    anchored: false,
                    last_input_pts: PTS_UNKNOWN,
                    input_count: 0,
                    interval_sum_us: 0,
                    interval_samples: 0,
                    configured_fps: options.fps,
                    last_shown: None,
                    audio_anchor_wait_us: 0,
                    policy_hold_us: 0,
                }),
                cv: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The sync session this scheduler paces against.
    pub fn session(&self) -> &SyncSession {
        &self.shared.session
    }

    /// Number of frames waiting in the ingestion queue.
    pub fn pending_frames(&self) -> usize {
        self.shared.queue.len()
    }

    /// Submits a frame for presentation.
    ///
    /// An unknown pts is synthesized from the previous input and the frame
    /// interval when an estimate exists. A pts equal to the immediately
    /// preceding input is treated as a duplicate and silently dropped and
    /// released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no backend is attached; the
    /// frame is dropped and released on the spot since ownership was never
    /// accepted.
    pub fn display_frame(&self, mut frame: FrameBuffer) -> Result<()> {
        if self.shared.backend.lock().unwrap().is_none() {
            self.shared.lifecycle.discard(frame);
            return Err(Error::NotInitialized);
        }

        let payload = frame.payload_size();
        let pts_ns;
        {
            let mut st = self.shared.state.lock().unwrap();
            if frame.pts == PTS_UNKNOWN {
                if let (Some(interval_us), true) =
                    (st.interval_us(), st.last_input_pts != PTS_UNKNOWN)
                {
                    frame.pts = st.last_input_pts + interval_us * 1_000;
                }
            }
            if st.input_count > 0 && frame.pts != PTS_UNKNOWN && frame.pts == st.last_input_pts {
                drop(st);
                debug!("duplicate pts {}; discarding frame {}", frame.pts, frame.id());
                self.shared.lifecycle.discard(frame);
                return Ok(());
            }
            if st.configured_fps == 0
                && st.interval_samples < FPS_ESTIMATE_WINDOW
                && st.last_input_pts != PTS_UNKNOWN
                && frame.pts > st.last_input_pts
            {
                st.interval_sum_us += (frame.pts - st.last_input_pts) / 1_000;
                st.interval_samples += 1;
            }
            st.last_input_pts = frame.pts;
            st.input_count += 1;
            if st.run == RunState::Idle {
                st.run = RunState::Running;
            }
            pts_ns = frame.pts;
        }

        if self.shared.session.is_bound() && self.shared.session.tunnel_mode() {
            if let Err(err) = self.shared.session.queue_video_frame(pts_ns / 1_000, payload) {
                debug!("queue_video_frame skipped: {err}");
            }
        }

        if let Err(frame) = self.shared.queue.push(frame) {
            self.shared.lifecycle.discard(frame);
            return Err(Error::QueueClosed("scheduler stopped".into()));
        }
        self.shared.cv.notify_all();
        self.ensure_worker();
        Ok(())
    }

    /// Sets one scheduler or session property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for out-of-range values.
    pub fn set_prop(&self, key: PropertyKey, value: i64) -> Result<()> {
        let session = &self.shared.session;
        match key {
            PropertyKey::SyncMode => {
                let mode = SyncMode::try_from(value as i32).map_err(|_| {
                    Error::InvalidConfiguration(format!("unknown sync mode {value}"))
                })?;
                session.set_sync_mode(mode)
            }
            PropertyKey::TunnelMode => {
                session.set_tunnel_mode(value != 0);
                Ok(())
            }
            PropertyKey::DemuxId => {
                let (_, pcr) = session.stream_ids();
                session.set_stream_ids(value as i32, pcr);
                Ok(())
            }
            PropertyKey::PcrId => {
                let (demux, _) = session.stream_ids();
                session.set_stream_ids(demux, value as i32);
                Ok(())
            }
            PropertyKey::HasAudio => session.set_has_audio(value),
            PropertyKey::SourceType => session.set_source_type(value),
            PropertyKey::WorkMode => session.set_work_mode(value),
            PropertyKey::StartThreshold => session.set_start_threshold(value),
            PropertyKey::DisplayLatency => session.set_display_latency(value),
            PropertyKey::PlayerInstanceId => {
                session.set_player_instance_id(value);
                Ok(())
            }
            PropertyKey::FrameRate => {
                if value <= 0 || value > MAX_CONFIGURED_FPS {
                    return Err(Error::InvalidConfiguration(format!(
                        "frame rate {value} out of range 1..={MAX_CONFIGURED_FPS}"
                    )));
                }
                self.shared.state.lock().unwrap().configured_fps = value;
                Ok(())
            }
        }
    }

    /// Reads one scheduler or session property.
    pub fn get_prop(&self, key: PropertyKey) -> i64 {
        let session = &self.shared.session;
        match key {
            PropertyKey::SyncMode => i64::from(i32::from(session.sync_mode())),
            PropertyKey::TunnelMode => i64::from(session.tunnel_mode()),
            PropertyKey::DemuxId => i64::from(session.stream_ids().0),
            PropertyKey::PcrId => i64::from(session.stream_ids().1),
            PropertyKey::HasAudio => session.has_audio(),
            PropertyKey::SourceType => session.source_type(),
            PropertyKey::WorkMode => session.work_mode(),
            PropertyKey::StartThreshold => session.start_threshold(),
            PropertyKey::DisplayLatency => session.display_latency(),
            PropertyKey::PlayerInstanceId => session.player_instance_id(),
            PropertyKey::FrameRate => {
                let st = self.shared.state.lock().unwrap();
                if st.configured_fps > 0 {
                    st.configured_fps
                } else {
                    st.interval_us().map_or(0, |interval| 1_000_000 / interval.max(1))
                }
            }
        }
    }

    /// Opens the attached backend's display and window, then binds the sync
    /// session.
    ///
    /// A bind failure is tolerated: the scheduler falls back to
    /// unsynchronized pacing until the engine becomes available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no backend is attached, or the
    /// backend's own error when a lifecycle step fails.
    pub fn connect(&self) -> Result<()> {
        let backend = self
            .shared
            .backend
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotInitialized)?;
        if !backend.state().contains(BackendState::INITED) {
            backend.init()?;
        }
        if !backend.state().contains(BackendState::DISPLAY_OPENED) {
            backend.open_display()?;
        }
        if !backend.state().contains(BackendState::WINDOW_OPENED) {
            backend.open_window()?;
        }

        if !self.shared.session.is_bound() {
            let (demux, pcr) = self.shared.session.stream_ids();
            match self.shared.session.alloc_and_bind_instance(demux, pcr) {
                Ok(instance) => info!("connected with sync instance {instance}"),
                Err(err) => warn!("sync bind failed ({err}); pacing unsynchronized"),
            }
        }
        Ok(())
    }

    /// Closes the attached backend's window and display.
    pub fn disconnect(&self) {
        if let Some(backend) = self.shared.backend.lock().unwrap().clone() {
            backend.close_window();
            backend.close_display();
        }
    }

    /// Suspends scheduling; queued frames are kept.
    pub fn pause(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            match st.run {
                RunState::Running | RunState::Idle => st.run = RunState::Paused,
                RunState::Flushing => st.resume_to = RunState::Paused,
                RunState::Paused => {}
            }
        }
        if let Some(backend) = self.shared.backend.lock().unwrap().clone() {
            backend.pause();
        }
    }

    /// Resumes scheduling.
    pub fn resume(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            match st.run {
                RunState::Paused => st.run = RunState::Running,
                RunState::Flushing => st.resume_to = RunState::Running,
                _ => {}
            }
            self.shared.cv.notify_all();
        }
        if let Some(backend) = self.shared.backend.lock().unwrap().clone() {
            backend.resume();
        }
    }

    /// Drains every pending frame, dropping and releasing each, and resets
    /// the pacing anchor.
    ///
    /// On return, every frame submitted before the call has received its
    /// release notification; the backend's own queues are flushed as part of
    /// this.
    pub fn flush(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.run != RunState::Flushing {
                st.resume_to = st.run;
            }
            st.run = RunState::Flushing;
            st.anchored = false;
            st.last_shown = None;
            st.last_input_pts = PTS_UNKNOWN;
            st.audio_anchor_wait_us = 0;
            st.policy_hold_us = 0;
            self.shared.cv.notify_all();
        }

        self.shared
            .queue
            .flush_with(|frame| self.shared.lifecycle.discard(frame));
        if let Some(backend) = self.shared.backend.lock().unwrap().clone() {
            backend.flush();
        }
        if let Err(err) = self.shared.session.reset() {
            debug!("engine reset skipped: {err}");
        }

        let mut st = self.shared.state.lock().unwrap();
        if st.run == RunState::Flushing {
            st.run = st.resume_to;
        }
        self.shared.cv.notify_all();
    }

    /// Stops the worker after flushing everything still queued.
    ///
    /// Also runs on drop. Shutdown latency is bounded by one worker wait
    /// quantum.
    pub fn stop(&self) {
        self.flush();
        {
            let mut st = self.shared.state.lock().unwrap();
            st.stop = true;
            self.shared.cv.notify_all();
        }
        self.shared.queue.close();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn ensure_worker(&self) {
        let mut slot = self.worker.lock().unwrap();
        if slot.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("framepacer-sched".into())
                .spawn(move || worker_loop(&shared))
                .expect("spawn scheduler worker");
            *slot = Some(handle);
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn us(value: i64) -> Duration {
    Duration::from_micros(value.max(0) as u64)
}

fn worker_loop(shared: &Arc<Shared>) {
    loop {
        let mut st = shared.state.lock().unwrap();
        if st.stop {
            break;
        }
        let wait = match st.run {
            RunState::Idle | RunState::Paused | RunState::Flushing => Some(us(SCHED_QUANTUM_US)),
            RunState::Running => step(shared, &mut st),
        };
        if let Some(duration) = wait {
            let _ = shared.cv.wait_timeout(st, duration);
        }
    }
}

/// One scheduling iteration. Returns how long to block before the next, or
/// `None` when progress was made and the next iteration should run at once.
fn step(shared: &Shared, st: &mut SchedState) -> Option<Duration> {
    let Some(backend) = shared.backend.lock().unwrap().clone() else {
        return Some(us(SCHED_QUANTUM_US));
    };
    let Some(head_pts_ns) = shared.queue.peek_map(Duration::ZERO, |f| f.pts) else {
        return Some(us(st.default_backoff_us()));
    };

    if !shared.session.is_bound() {
        step_unbound(shared, st, &backend, head_pts_ns)
    } else if shared.session.tunnel_mode() {
        step_tunnel(shared, st, &backend, head_pts_ns)
    } else {
        step_policy(shared, st, &backend, head_pts_ns)
    }
}

/// Degraded best-effort mode: no engine, so no drop or hold logic. Show the
/// head frame now and back off for one frame interval.
fn step_unbound(
    shared: &Shared,
    st: &mut SchedState,
    backend: &Arc<dyn DisplayBackend>,
    head_pts_ns: i64,
) -> Option<Duration> {
    if let Some(frame) = shared.queue.pop_if(|f| f.pts == head_pts_ns) {
        let now = monotonic_us();
        hand_off(shared, st, backend, frame, now);
    }
    Some(us(st.default_backoff_us()))
}

fn step_tunnel(
    shared: &Shared,
    st: &mut SchedState,
    backend: &Arc<dyn DisplayBackend>,
    head_pts_ns: i64,
) -> Option<Duration> {
    let pts_us = head_pts_ns / 1_000;

    if !st.anchored {
        match shared.session.anchor_at(pts_us) {
            Ok(()) => st.anchored = true,
            Err(err) => {
                debug!("anchor at {pts_us}us not accepted: {err}");
                return Some(us(SCHED_QUANTUM_US));
            }
        }
    }

    match shared.session.estimated_realtime(pts_us) {
        Ok(realtime_us) => {
            let vsync_us = shared
                .session
                .next_vsync_wallclock()
                .unwrap_or_else(|_| monotonic_us());
            let delay_us = realtime_us - vsync_us - OUTPUT_LATENCY_US;
            if delay_us <= 0 {
                if let Some(frame) = shared.queue.pop_if(|f| f.pts == head_pts_ns) {
                    hand_off(shared, st, backend, frame, realtime_us);
                    st.audio_anchor_wait_us = 0;
                }
                None
            } else {
                Some(us(delay_us))
            }
        }
        Err(_) => step_tunnel_fallback(shared, st, backend, head_pts_ns),
    }
}

/// The engine produced no estimate: pace off pts deltas, after a bounded
/// wait for the audio anchor in amaster mode.
fn step_tunnel_fallback(
    shared: &Shared,
    st: &mut SchedState,
    backend: &Arc<dyn DisplayBackend>,
    head_pts_ns: i64,
) -> Option<Duration> {
    if shared.session.sync_mode() == SyncMode::Amaster
        && shared.session.first_audio_pts().is_err()
    {
        if st.audio_anchor_wait_us < AUDIO_ANCHOR_WAIT_CEILING_US {
            st.audio_anchor_wait_us += SCHED_QUANTUM_US;
            return Some(us(SCHED_QUANTUM_US));
        }
        warn!(
            "no audio anchor after {}us; demoting session to vmaster",
            st.audio_anchor_wait_us
        );
        if let Err(err) = shared.session.set_sync_mode(SyncMode::Vmaster) {
            debug!("vmaster demotion not applied: {err}");
        }
    }

    let pts_us = head_pts_ns / 1_000;
    let now = monotonic_us();
    let due_us = match &st.last_shown {
        Some(shown) => shown.wall_us + (pts_us - shown.pts_us).max(0),
        None => now,
    };
    if now >= due_us {
        if let Some(frame) = shared.queue.pop_if(|f| f.pts == head_pts_ns) {
            hand_off(shared, st, backend, frame, now);
        }
        None
    } else {
        Some(us(due_us - now))
    }
}

fn step_policy(
    shared: &Shared,
    st: &mut SchedState,
    backend: &Arc<dyn DisplayBackend>,
    head_pts_ns: i64,
) -> Option<Duration> {
    let pts_us = head_pts_ns / 1_000;
    let last_pts_us = st.last_shown.as_ref().map_or(-1, |s| s.pts_us);

    let decision = match shared.session.process_policy(pts_us, last_pts_us) {
        Ok(decision) => decision,
        Err(_) => return Some(us(SCHED_QUANTUM_US)),
    };

    match decision.policy {
        SyncPolicy::NormalOutput => {
            let display_at = if decision.param1 > 0 {
                decision.param1
            } else {
                monotonic_us()
            };
            if let Some(frame) = shared.queue.pop_if(|f| f.pts == head_pts_ns) {
                hand_off(shared, st, backend, frame, display_at);
                st.policy_hold_us = 0;
            }
            None
        }
        SyncPolicy::Hold => {
            if st.policy_hold_us >= POLICY_HOLD_CEILING_US {
                warn!("hold ceiling reached at pts {pts_us}us; outputting anyway");
                if let Some(frame) = shared.queue.pop_if(|f| f.pts == head_pts_ns) {
                    hand_off(shared, st, backend, frame, monotonic_us());
                    st.policy_hold_us = 0;
                }
                return None;
            }
            let hold_us = if decision.param1 > 0 {
                decision.param1
            } else {
                MIN_HOLD_US
            };
            st.policy_hold_us += hold_us;
            Some(us(hold_us))
        }
        SyncPolicy::Drop => {
            if let Some(frame) = shared.queue.pop_if(|f| f.pts == head_pts_ns) {
                debug!("policy drop for frame {} at pts {pts_us}us", frame.id());
                shared.lifecycle.discard(frame);
            }
            None
        }
    }
}

/// Hands one frame to the backend. Runs under the scheduler state lock so
/// hand-offs stay serialized in FIFO order.
fn hand_off(
    shared: &Shared,
    st: &mut SchedState,
    backend: &Arc<dyn DisplayBackend>,
    frame: FrameBuffer,
    display_at_us: i64,
) {
    let pts_us = frame.pts / 1_000;
    match backend.display_frame(frame, display_at_us) {
        Ok(()) => {
            st.last_shown = Some(Shown {
                pts_us,
                wall_us: monotonic_us(),
            });
        }
        Err(rejected) => {
            warn!(
                "backend rejected frame {}: {}",
                rejected.frame.id(),
                rejected.reason
            );
            shared.lifecycle.discard(rejected.frame);
        }
    }
}
