//! Frame presentation pacing and buffer lifecycle for embedded video
//! pipelines.
//!
//! This crate is the scheduling core of a set-top video presentation path:
//! it accepts decoded frames as DMA buffer descriptors, paces their
//! presentation against an audio/video synchronization engine, and hands
//! each frame to a pluggable display backend at the right wall-clock moment,
//! with full drop/hold/flush handling and buffer-lifecycle accounting.
//!
//! # Quick Start
//!
//! ```
//! use framepacer::frames::AllocFlags;
//! use framepacer::pool::{FramePool, LifecycleEvent};
//!
//! // The pool owns every frame wrapper and tracks each one by id.
//! let pool = FramePool::new();
//! let events = pool.subscribe();
//! let lifecycle = pool.lifecycle();
//!
//! let mut frame = pool.acquire(AllocFlags::RAW, 4096);
//! frame.pts = 33_000_000; // nanoseconds on the producer clock
//!
//! // Stages report each buffer's fate through the lifecycle handle;
//! // `released` fires exactly once per wrapper on every path.
//! let id = frame.id();
//! lifecycle.discard(frame);
//! assert_eq!(events.recv().unwrap(), LifecycleEvent::Dropped(id));
//! assert_eq!(events.recv().unwrap(), LifecycleEvent::Released(id));
//! ```
//!
//! # Core Concepts
//!
//! ## Buffer Lifecycle
//!
//! [`pool::FramePool`] allocates and recycles [`frames::FrameBuffer`]
//! wrappers. A wrapper is exclusively owned by whichever stage currently
//! holds it; ownership moves producer to scheduler to backend, and the
//! wrapper returns to the pool through exactly one terminal
//! [`released`](pool::FrameLifecycle::released) notification, optionally
//! preceded by one of `dropped` or `displayed`.
//!
//! ## Pacing
//!
//! [`scheduler::FrameScheduler`] runs one cooperative worker over a FIFO
//! ingestion queue. With the session's tunnel flag set it paces off the
//! engine's per-pts wall-clock estimates; otherwise it follows the engine's
//! explicit output/hold/drop policy verdicts. If the engine is unbound or
//! silent, it degrades to pts-delta pacing rather than stalling.
//!
//! ## Display Backends
//!
//! Backends implement [`backend::DisplayBackend`] and are driven purely
//! through that trait. [`vsync::VsyncBackend`] is the bundled exemplar: a
//! vblank-aligned poster that keeps one winner per vsync, and a fence-gated
//! recycler that releases buffers only once the hardware is done reading
//! them.
//!
//! # Thread Safety
//!
//! The scheduler, pool, and backends are safe to drive from an owning thread
//! while their dedicated workers run; there are exactly three workers
//! (scheduler, poster, recycler), each a plain loop with explicit blocking
//! points. Stop and flush are cooperative and bounded by one wait quantum.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// Internal modules
mod clock;
mod error;

// Public modules
pub mod backend;
pub mod fence;
pub mod frames;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod vsync;

// Re-exports
pub use {
    backend::{
        BackendPixelFormat, BackendState, DisplayBackend, FrameSize, RejectedFrame, WindowRect,
    },
    error::Error,
    fence::Fence,
    frames::{
        AllocFlags, DmaDescriptor, DmaDescriptorBuilder, FrameBuffer, Plane, MAX_PLANES,
        PTS_UNKNOWN,
    },
    pool::{FrameLifecycle, FramePool, LifecycleEvent},
    queue::FrameQueue,
    scheduler::{FrameScheduler, PropertyKey, SchedulerOptions, SchedulerOptionsBuilder},
    session::{EngineParam, PolicyDecision, SyncEngine, SyncMode, SyncPolicy, SyncSession},
    vsync::{NativeHandle, Vblank, VsyncBackend, VsyncDevice},
};

/// Alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
