//! Pacing behavior of the scheduler against a silent or degraded engine,
//! exercised through the public API only.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

use framepacer::{
    AllocFlags, BackendPixelFormat, BackendState, DisplayBackend, DmaDescriptor, EngineParam,
    Error, FrameBuffer, FramePool, FrameScheduler, FrameSize, Plane, PolicyDecision, PropertyKey,
    RejectedFrame, Result, SchedulerOptions, SyncEngine, SyncMode, WindowRect,
};

/// Engine that never produces an estimate, forcing pts-delta fallback.
struct SilentEngine {
    audio_ready: AtomicBool,
    mode: Mutex<SyncMode>,
}

impl SilentEngine {
    fn new() -> Self {
        Self {
            audio_ready: AtomicBool::new(false),
            mode: Mutex::new(SyncMode::Vmaster),
        }
    }
}

impl SyncEngine for SilentEngine {
    fn bind_instance(&self, _demux_id: i32, _pcr_id: i32) -> Result<i32> {
        Ok(7)
    }

    fn set_mode(&self, _instance: i32, mode: SyncMode) -> Result<()> {
        *self.mode.lock().unwrap() = mode;
        Ok(())
    }

    fn set_parameter(&self, _instance: i32, _param: EngineParam, _value: i64) -> Result<()> {
        Ok(())
    }

    fn queue_frame(&self, _instance: i32, _pts_us: i64, _size: usize) -> Result<()> {
        Ok(())
    }

    fn anchor(&self, _instance: i32, _pts_us: i64) -> Result<()> {
        Ok(())
    }

    fn estimated_realtime(&self, _instance: i32, _pts_us: i64) -> Result<i64> {
        Err(Error::EngineNotReady)
    }

    fn next_vsync_wallclock(&self, _instance: i32) -> Result<i64> {
        Err(Error::EngineNotReady)
    }

    fn process_policy(
        &self,
        _instance: i32,
        _pts_us: i64,
        _last_pts_us: i64,
    ) -> Result<PolicyDecision> {
        Err(Error::EngineNotReady)
    }

    fn reset(&self, _instance: i32) -> Result<()> {
        Ok(())
    }

    fn first_audio_pts(&self, _instance: i32) -> Result<i64> {
        if self.audio_ready.load(Ordering::Acquire) {
            Ok(0)
        } else {
            Err(Error::EngineNotReady)
        }
    }

    fn current_audio_pts(&self, instance: i32) -> Result<i64> {
        self.first_audio_pts(instance)
    }
}

/// Backend that stamps each hand-off with its arrival time.
struct TimestampingBackend {
    lifecycle: framepacer::FrameLifecycle,
    arrivals: Mutex<Vec<(i64, Instant)>>,
}

impl TimestampingBackend {
    fn new(pool: &FramePool) -> Self {
        Self {
            lifecycle: pool.lifecycle(),
            arrivals: Mutex::new(Vec::new()),
        }
    }

    fn arrivals(&self) -> Vec<(i64, Instant)> {
        self.arrivals.lock().unwrap().clone()
    }
}

impl DisplayBackend for TimestampingBackend {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) {}

    fn open_display(&self) -> Result<()> {
        Ok(())
    }

    fn close_display(&self) {}

    fn open_window(&self) -> Result<()> {
        Ok(())
    }

    fn close_window(&self) {}

    fn display_frame(
        &self,
        frame: FrameBuffer,
        _when_us: i64,
    ) -> std::result::Result<(), RejectedFrame> {
        self.arrivals
            .lock()
            .unwrap()
            .push((frame.pts, Instant::now()));
        self.lifecycle.displayed(&frame);
        self.lifecycle.released(frame);
        Ok(())
    }

    fn flush(&self) {}

    fn pause(&self) {}

    fn resume(&self) {}

    fn set_window_rect(&self, _rect: WindowRect) -> Result<()> {
        Ok(())
    }

    fn window_rect(&self) -> WindowRect {
        WindowRect::default()
    }

    fn set_frame_size(&self, _size: FrameSize) -> Result<()> {
        Ok(())
    }

    fn frame_size(&self) -> FrameSize {
        FrameSize::default()
    }

    fn set_pixel_format(&self, _format: BackendPixelFormat) -> Result<()> {
        Ok(())
    }

    fn pixel_format(&self) -> BackendPixelFormat {
        BackendPixelFormat::default()
    }

    fn set_extra(&self, _key: &str, _value: i64) -> Result<()> {
        Ok(())
    }

    fn extra(&self, _key: &str) -> Option<i64> {
        None
    }

    fn state(&self) -> BackendState {
        BackendState::INITED | BackendState::DISPLAY_OPENED | BackendState::WINDOW_OPENED
    }
}

fn make_frame(pool: &FramePool, pts_ns: i64) -> FrameBuffer {
    let mut frame = pool.acquire(AllocFlags::DMA, 0);
    frame.pts = pts_ns;
    frame.dma = Some(
        DmaDescriptor::builder(32, 32)
            .plane(Plane {
                fd: 4,
                stride: 32,
                offset: 0,
                size: 1024,
            })
            .build()
            .unwrap(),
    );
    frame
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn silent_engine_falls_back_to_pts_delta_pacing() {
    init_logging();
    let pool = FramePool::new();
    let engine = Arc::new(SilentEngine::new());
    let backend = Arc::new(TimestampingBackend::new(&pool));

    let scheduler = FrameScheduler::new(
        SchedulerOptions::builder(engine as Arc<dyn SyncEngine>, pool.lifecycle())
            .backend(backend.clone() as Arc<dyn DisplayBackend>)
            .tunnel_mode(true)
            .build()
            .unwrap(),
    );
    scheduler.session().alloc_and_bind_instance(0, 0).unwrap();

    scheduler.display_frame(make_frame(&pool, 0)).unwrap();
    scheduler.display_frame(make_frame(&pool, 33_000_000)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        backend.arrivals().len() == 2
    }));

    let arrivals = backend.arrivals();
    assert_eq!(arrivals[0].0, 0);
    assert_eq!(arrivals[1].0, 33_000_000);

    // Second frame trails the first by roughly its pts delta.
    let gap = arrivals[1].1.duration_since(arrivals[0].1);
    assert!(
        gap >= Duration::from_millis(20) && gap <= Duration::from_millis(150),
        "expected ~33ms pacing gap, got {gap:?}"
    );
    assert!(wait_until(Duration::from_secs(1), || pool.outstanding() == 0));
}

#[test]
fn amaster_without_audio_anchor_demotes_to_vmaster() {
    init_logging();
    let pool = FramePool::new();
    let engine = Arc::new(SilentEngine::new());
    let backend = Arc::new(TimestampingBackend::new(&pool));

    let scheduler = FrameScheduler::new(
        SchedulerOptions::builder(engine.clone() as Arc<dyn SyncEngine>, pool.lifecycle())
            .backend(backend.clone() as Arc<dyn DisplayBackend>)
            .tunnel_mode(true)
            .build()
            .unwrap(),
    );
    scheduler.session().alloc_and_bind_instance(0, 0).unwrap();
    scheduler
        .set_prop(PropertyKey::SyncMode, i64::from(i32::from(SyncMode::Amaster)))
        .unwrap();

    let submitted = Instant::now();
    scheduler.display_frame(make_frame(&pool, 0)).unwrap();

    // The frame is held back while the scheduler waits for the audio anchor.
    thread::sleep(Duration::from_millis(300));
    assert!(backend.arrivals().is_empty());

    // After the bounded wait the session demotes itself and output resumes.
    assert!(wait_until(Duration::from_secs(6), || {
        backend.arrivals().len() == 1
    }));
    assert!(submitted.elapsed() >= Duration::from_secs(2));
    assert_eq!(scheduler.get_prop(PropertyKey::SyncMode), 0);
}

#[test]
fn audio_anchor_arrival_unblocks_amaster() {
    let pool = FramePool::new();
    let engine = Arc::new(SilentEngine::new());
    let backend = Arc::new(TimestampingBackend::new(&pool));

    let scheduler = FrameScheduler::new(
        SchedulerOptions::builder(engine.clone() as Arc<dyn SyncEngine>, pool.lifecycle())
            .backend(backend.clone() as Arc<dyn DisplayBackend>)
            .tunnel_mode(true)
            .build()
            .unwrap(),
    );
    scheduler.session().alloc_and_bind_instance(0, 0).unwrap();
    scheduler
        .set_prop(PropertyKey::SyncMode, i64::from(i32::from(SyncMode::Amaster)))
        .unwrap();

    scheduler.display_frame(make_frame(&pool, 0)).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(backend.arrivals().is_empty());

    engine.audio_ready.store(true, Ordering::Release);
    assert!(wait_until(Duration::from_secs(2), || {
        backend.arrivals().len() == 1
    }));
    // The anchor arrived in time, so the session keeps its clock master.
    assert_eq!(scheduler.get_prop(PropertyKey::SyncMode), 1);
}

#[test]
fn unbound_session_degrades_to_immediate_output() {
    let pool = FramePool::new();
    let engine = Arc::new(SilentEngine::new());
    let backend = Arc::new(TimestampingBackend::new(&pool));

    // Never bound: every frame is stamped with the current time and shown.
    let scheduler = FrameScheduler::new(
        SchedulerOptions::builder(engine as Arc<dyn SyncEngine>, pool.lifecycle())
            .backend(backend.clone() as Arc<dyn DisplayBackend>)
            .build()
            .unwrap(),
    );

    for i in 0..3 {
        scheduler
            .display_frame(make_frame(&pool, i * 33_000_000))
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || {
        backend.arrivals().len() == 3
    }));

    let pts: Vec<i64> = backend.arrivals().iter().map(|(p, _)| *p).collect();
    assert_eq!(pts, vec![0, 33_000_000, 66_000_000]);
}
