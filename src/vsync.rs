//! Vsync-paced exemplar backend.
//!
//! [`VsyncBackend`] shows how a concrete backend satisfies the scheduler's
//! real-time contract with two cooperating workers over one device handle:
//!
//! * the **poster** aligns to the device's vertical-blank signal, selects at
//!   most one winner per vsync from the frames whose display time falls
//!   inside the expiry horizon, and posts it;
//! * the **recycler** waits for each posted buffer's completion fence before
//!   declaring it displayed and releasing it.
//!
//! The split exists because fence latency must never block the poster's
//! vsync-timing loop; coupling them would slip every frame's presentation by
//! the fence wait.

use log::{debug, warn};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::backend::{
    BackendPixelFormat, BackendState, DisplayBackend, FrameSize, RejectedFrame, WindowRect,
};
use crate::fence::Fence;
use crate::frames::{DmaDescriptor, FrameBuffer};
use crate::pool::FrameLifecycle;
use crate::queue::FrameQueue;
use crate::{Error, Result};

/// Expiry horizon in refresh intervals past the observed vblank.
const VSYNC_EXPIRY_FACTOR: i64 = 3;
/// Bounded wait for one completion fence; a timeout is non-fatal.
const FENCE_TIMEOUT: Duration = Duration::from_millis(100);
/// Upper bound on a single vblank wait.
const VBLANK_TIMEOUT: Duration = Duration::from_millis(50);
/// Recycler idle sleep before enough frames are in flight.
const RECYCLER_IDLE: Duration = Duration::from_millis(4);
/// Posted-frame count past which fences become retrievable.
const RECYCLER_ACTIVATION_DEPTH: i64 = 2;
/// Upper bound on waiting out in-flight recycler work during a flush.
const FLUSH_SETTLE_TIMEOUT: Duration = Duration::from_millis(400);

/// One vertical-blank observation.
#[derive(Debug, Clone, Copy)]
pub struct Vblank {
    /// Wall-clock time of the blank, process-monotonic microseconds.
    pub timestamp_us: i64,
    /// Current refresh interval in microseconds.
    pub refresh_interval_us: i64,
}

/// Opaque device-native handle for an imported buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// The hardware seam the exemplar pipeline drives.
///
/// Implementations wrap whatever the platform exposes for scanout; methods
/// must be callable from the poster and recycler threads concurrently.
pub trait VsyncDevice: Send + Sync {
    /// Imports a DMA descriptor into a device-native buffer handle.
    fn import_buffer(&self, dma: &DmaDescriptor) -> Result<NativeHandle>;

    /// Blocks until the next vertical blank, up to `timeout`.
    fn wait_vblank(&self, timeout: Duration) -> Result<Vblank>;

    /// Posts an imported buffer for scanout, returning its completion fence.
    fn post(&self, handle: &NativeHandle) -> Result<Fence>;

    /// Returns an imported handle to the device once the pipeline is done
    /// with it.
    fn drop_buffer(&self, handle: NativeHandle);
}

/// A frame paired with its imported handle and target display time.
struct FrameEntity {
    frame: FrameBuffer,
    handle: NativeHandle,
    display_at_us: i64,
}

/// A posted frame awaiting its completion fence.
struct PostedEntity {
    entity: FrameEntity,
    fence: Fence,
}

struct BackendShared {
    device: Arc<dyn VsyncDevice>,
    lifecycle: FrameLifecycle,
    pending: FrameQueue<FrameEntity>,
    posted: FrameQueue<PostedEntity>,
    stop: AtomicBool,
    paused: AtomicBool,
    posted_total: AtomicI64,
    dropped_total: AtomicI64,
    recycler_busy: AtomicI64,
    state: Mutex<BackendState>,
    props: Mutex<BackendProps>,
}

#[derive(Default)]
struct BackendProps {
    window_rect: WindowRect,
    frame_size: FrameSize,
    pixel_format: BackendPixelFormat,
    extras: HashMap<String, i64>,
}

impl BackendShared {
    fn discard_entity(&self, entity: FrameEntity) {
        self.device.drop_buffer(entity.handle);
        self.lifecycle.discard(entity.frame);
    }
}

/// Vsync-aligned post/recycle backend over a [`VsyncDevice`].
///
/// `release` is terminal for this backend: its queues close and the workers
/// join. Create a new instance to present again.
///
/// # Example
///
/// ```ignore
/// let backend = Arc::new(VsyncBackend::new(device, pool.lifecycle()));
/// backend.init()?;
/// backend.open_display()?;
/// backend.open_window()?;
/// ```
pub struct VsyncBackend {
    shared: Arc<BackendShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl VsyncBackend {
    /// Creates an uninitialized backend over the given device.
    pub fn new(device: Arc<dyn VsyncDevice>, lifecycle: FrameLifecycle) -> Self {
        Self {
            shared: Arc::new(BackendShared {
                device,
                lifecycle,
                pending: FrameQueue::new(),
                posted: FrameQueue::new(),
                stop: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                posted_total: AtomicI64::new(0),
                dropped_total: AtomicI64::new(0),
                recycler_busy: AtomicI64::new(0),
                state: Mutex::new(BackendState::NONE),
                props: Mutex::new(BackendProps::default()),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Frames posted to the device so far.
    pub fn posted_frames(&self) -> i64 {
        self.shared.posted_total.load(Ordering::Acquire)
    }

    /// Frames superseded or refused before reaching the device.
    pub fn dropped_frames(&self) -> i64 {
        self.shared.dropped_total.load(Ordering::Acquire)
    }

    /// Blocks until in-flight recycler work settles, bounded by the fence
    /// timeout. Spin-then-sleep, since the window is tiny.
    fn settle_recycler(&self) {
        let start = Instant::now();
        while self.shared.recycler_busy.load(Ordering::Acquire) > 0 {
            if start.elapsed() > FLUSH_SETTLE_TIMEOUT {
                warn!("recycler did not settle within {FLUSH_SETTLE_TIMEOUT:?}");
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl DisplayBackend for VsyncBackend {
    fn init(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::Release);

        let poster = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("framepacer-poster".into())
                .spawn(move || poster_loop(&shared))
                .map_err(|e| Error::BackendRejected(format!("spawn poster: {e}")))?
        };
        let recycler = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("framepacer-recycler".into())
                .spawn(move || recycler_loop(&shared))
                .map_err(|e| Error::BackendRejected(format!("spawn recycler: {e}")))?
        };
        workers.push(poster);
        workers.push(recycler);

        self.shared.state.lock().unwrap().insert(BackendState::INITED);
        Ok(())
    }

    fn release(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pending.close();
        self.shared.posted.close();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        // Workers flush their own queues on exit; anything pushed after they
        // stopped is swept here.
        self.shared
            .pending
            .flush_with(|entity| self.shared.discard_entity(entity));
        self.shared
            .posted
            .flush_with(|posted| self.shared.discard_entity(posted.entity));
        *self.shared.state.lock().unwrap() = BackendState::NONE;
    }

    fn open_display(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.contains(BackendState::INITED) {
            return Err(Error::NotInitialized);
        }
        state.insert(BackendState::DISPLAY_OPENED);
        Ok(())
    }

    fn close_display(&self) {
        self.shared
            .state
            .lock()
            .unwrap()
            .remove(BackendState::DISPLAY_OPENED);
    }

    fn open_window(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.contains(BackendState::DISPLAY_OPENED) {
            return Err(Error::NotInitialized);
        }
        state.insert(BackendState::WINDOW_OPENED);
        Ok(())
    }

    fn close_window(&self) {
        self.shared
            .state
            .lock()
            .unwrap()
            .remove(BackendState::WINDOW_OPENED);
    }

    fn display_frame(
        &self,
        frame: FrameBuffer,
        when_us: i64,
    ) -> std::result::Result<(), RejectedFrame> {
        if !self.state().contains(BackendState::WINDOW_OPENED) {
            return Err(RejectedFrame {
                frame,
                reason: Error::NotInitialized,
            });
        }
        let Some(dma) = frame.dma.as_ref() else {
            return Err(RejectedFrame {
                frame,
                reason: Error::BackendRejected("frame carries no DMA descriptor".into()),
            });
        };
        let handle = match self.shared.device.import_buffer(dma) {
            Ok(handle) => handle,
            Err(err) => {
                return Err(RejectedFrame {
                    frame,
                    reason: Error::BackendRejected(format!("buffer import failed: {err}")),
                });
            }
        };

        let entity = FrameEntity {
            frame,
            handle,
            display_at_us: when_us,
        };
        if let Err(entity) = self.shared.pending.push(entity) {
            self.shared.device.drop_buffer(entity.handle);
            return Err(RejectedFrame {
                frame: entity.frame,
                reason: Error::QueueClosed("backend released".into()),
            });
        }
        Ok(())
    }

    fn flush(&self) {
        self.shared
            .pending
            .flush_with(|entity| self.shared.discard_entity(entity));
        self.shared
            .posted
            .flush_with(|posted| self.shared.discard_entity(posted.entity));
        self.settle_recycler();
    }

    fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    fn set_window_rect(&self, rect: WindowRect) -> Result<()> {
        if rect.width == 0 || rect.height == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "degenerate window rect {}x{}",
                rect.width, rect.height
            )));
        }
        self.shared.props.lock().unwrap().window_rect = rect;
        Ok(())
    }

    fn window_rect(&self) -> WindowRect {
        self.shared.props.lock().unwrap().window_rect
    }

    fn set_frame_size(&self, size: FrameSize) -> Result<()> {
        self.shared.props.lock().unwrap().frame_size = size;
        Ok(())
    }

    fn frame_size(&self) -> FrameSize {
        self.shared.props.lock().unwrap().frame_size
    }

    fn set_pixel_format(&self, format: BackendPixelFormat) -> Result<()> {
        self.shared.props.lock().unwrap().pixel_format = format;
        Ok(())
    }

    fn pixel_format(&self) -> BackendPixelFormat {
        self.shared.props.lock().unwrap().pixel_format
    }

    fn set_extra(&self, key: &str, value: i64) -> Result<()> {
        self.shared
            .props
            .lock()
            .unwrap()
            .extras
            .insert(key.to_owned(), value);
        Ok(())
    }

    fn extra(&self, key: &str) -> Option<i64> {
        match key {
            "posted_frames" => Some(self.posted_frames()),
            "dropped_frames" => Some(self.dropped_frames()),
            _ => self.shared.props.lock().unwrap().extras.get(key).copied(),
        }
    }

    fn state(&self) -> BackendState {
        *self.shared.state.lock().unwrap()
    }
}

impl Drop for VsyncBackend {
    fn drop(&mut self) {
        self.release();
    }
}

/// Vsync-aligned selection and posting.
fn poster_loop(shared: &Arc<BackendShared>) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if shared.paused.load(Ordering::Acquire) {
            thread::sleep(RECYCLER_IDLE);
            continue;
        }

        let vblank = match shared.device.wait_vblank(VBLANK_TIMEOUT) {
            Ok(vblank) => vblank,
            Err(err) => {
                debug!("vblank wait yielded nothing: {err}");
                continue;
            }
        };
        let expiry_us = vblank.timestamp_us + VSYNC_EXPIRY_FACTOR * vblank.refresh_interval_us;

        // One winner per vsync: drain every due frame, keep the last, and
        // drop the ones it supersedes.
        let mut winner: Option<FrameEntity> = None;
        while let Some(entity) = shared.pending.pop_if(|e| e.display_at_us <= expiry_us) {
            if let Some(superseded) = winner.replace(entity) {
                debug!(
                    "frame {} superseded within vblank window",
                    superseded.frame.id()
                );
                shared.dropped_total.fetch_add(1, Ordering::AcqRel);
                shared.discard_entity(superseded);
            }
        }
        let Some(entity) = winner else {
            continue;
        };

        if shared.stop.load(Ordering::Acquire) {
            shared.discard_entity(entity);
            break;
        }

        match shared.device.post(&entity.handle) {
            Ok(fence) => {
                shared.posted_total.fetch_add(1, Ordering::AcqRel);
                if let Err(posted) = shared.posted.push(PostedEntity { entity, fence }) {
                    shared.discard_entity(posted.entity);
                }
            }
            Err(err) => {
                warn!("device post failed for frame {}: {err}", entity.frame.id());
                shared.dropped_total.fetch_add(1, Ordering::AcqRel);
                shared.discard_entity(entity);
            }
        }
    }

    shared.pending.flush_with(|entity| shared.discard_entity(entity));
}

/// Fence-gated displayed/released notification.
fn recycler_loop(shared: &Arc<BackendShared>) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        // Fences are only retrievable once the scanout pipeline is primed;
        // idle until enough frames have been posted.
        if shared.posted_total.load(Ordering::Acquire) <= RECYCLER_ACTIVATION_DEPTH {
            thread::sleep(RECYCLER_IDLE);
            continue;
        }

        let Some(posted) = shared.posted.pop_wait() else {
            break;
        };
        shared.recycler_busy.fetch_add(1, Ordering::AcqRel);

        if let Err(err) = posted.fence.wait_timeout(FENCE_TIMEOUT) {
            warn!(
                "fence for frame {} timed out ({err}); assuming displayed",
                posted.entity.frame.id()
            );
        }

        let FrameEntity { frame, handle, .. } = posted.entity;
        shared.lifecycle.displayed(&frame);
        shared.device.drop_buffer(handle);
        shared.lifecycle.released(frame);
        shared.recycler_busy.fetch_sub(1, Ordering::AcqRel);
    }

    shared
        .posted
        .flush_with(|posted| shared.discard_entity(posted.entity));
}
