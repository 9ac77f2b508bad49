//! Buffer lifecycle management.
//!
//! The [`FramePool`] allocates and recycles [`FrameBuffer`] wrappers and
//! tracks every outstanding wrapper by id. The [`FrameLifecycle`] handle is
//! how downstream stages (the scheduler and backends, from any of their
//! worker threads) report the fate of each buffer back to the pool:
//! [`dropped`](FrameLifecycle::dropped) and
//! [`displayed`](FrameLifecycle::displayed) are informational,
//! [`released`](FrameLifecycle::released) is terminal and fires exactly once
//! per wrapper on every path through the pipeline.
//!
//! Lifecycle notifications are also mirrored onto a subscription channel so
//! tests and diagnostics can observe the event stream without hooking the
//! data path.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::frames::{AllocFlags, FrameBuffer};

/// A lifecycle notification for one buffer, identified by wrapper id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The buffer was discarded without reaching the display.
    Dropped(i64),
    /// The buffer reached the display.
    Displayed(i64),
    /// The buffer's wrapper was reclaimed. Terminal; fires exactly once.
    Released(i64),
}

struct PoolState {
    next_id: i64,
    outstanding: HashMap<i64, AllocFlags>,
    free: Vec<FrameBuffer>,
    subscribers: Vec<Sender<LifecycleEvent>>,
}

impl PoolState {
    fn emit(&mut self, event: LifecycleEvent) {
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

/// Allocates, tracks, and recycles frame wrappers.
///
/// Cloning is cheap; clones share the same pool.
///
/// # Example
///
/// ```
/// use framepacer::frames::AllocFlags;
/// use framepacer::pool::{FramePool, LifecycleEvent};
///
/// let pool = FramePool::new();
/// let events = pool.subscribe();
/// let lifecycle = pool.lifecycle();
///
/// let frame = pool.acquire(AllocFlags::RAW, 4096);
/// let id = frame.id();
/// lifecycle.discard(frame);
///
/// assert_eq!(events.recv().unwrap(), LifecycleEvent::Dropped(id));
/// assert_eq!(events.recv().unwrap(), LifecycleEvent::Released(id));
/// assert_eq!(pool.outstanding(), 0);
/// ```
#[derive(Clone)]
pub struct FramePool {
    state: Arc<Mutex<PoolState>>,
}

impl FramePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                next_id: 1,
                outstanding: HashMap::new(),
                free: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Acquires a frame wrapper.
    ///
    /// Reuses a free wrapper when one exists with the same ownership flags
    /// and, for raw payloads, at least `raw_capacity` bytes of capacity;
    /// otherwise allocates fresh. Either way the wrapper is registered
    /// outstanding under a newly assigned id. Ids are monotone and never
    /// reused.
    pub fn acquire(&self, flags: AllocFlags, raw_capacity: usize) -> FrameBuffer {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        let reusable = state.free.iter().position(|f| {
            f.flags() == flags
                && (!flags.contains(AllocFlags::RAW)
                    || f.raw.as_ref().is_some_and(|r| r.capacity() >= raw_capacity))
        });

        let mut frame = match reusable {
            Some(index) => state.free.swap_remove(index),
            None => FrameBuffer::new(id, flags, raw_capacity),
        };
        frame.reassign(id);
        state.outstanding.insert(id, flags);
        frame
    }

    /// Creates a lifecycle handle for downstream stages.
    pub fn lifecycle(&self) -> FrameLifecycle {
        FrameLifecycle {
            state: Arc::clone(&self.state),
        }
    }

    /// Subscribes to the lifecycle event stream.
    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (tx, rx) = unbounded();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Number of wrappers currently out in the pipeline.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding.len()
    }

    /// Number of wrappers parked on the free list.
    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable handle through which pipeline stages report buffer outcomes.
///
/// Safe to invoke from any worker thread.
#[derive(Clone)]
pub struct FrameLifecycle {
    state: Arc<Mutex<PoolState>>,
}

impl FrameLifecycle {
    /// Reports that a buffer was discarded without being displayed.
    /// Informational; the wrapper is still owned by the caller until
    /// [`released`](Self::released).
    pub fn dropped(&self, frame: &FrameBuffer) {
        let mut state = self.state.lock().unwrap();
        state.emit(LifecycleEvent::Dropped(frame.id()));
    }

    /// Reports that a buffer reached the display.
    pub fn displayed(&self, frame: &FrameBuffer) {
        let mut state = self.state.lock().unwrap();
        state.emit(LifecycleEvent::Displayed(frame.id()));
    }

    /// Returns a wrapper to the pool. Terminal: after this the caller no
    /// longer owns the buffer.
    ///
    /// Releasing a wrapper the pool is not tracking is tolerated (the
    /// boundary stays robust against mis-paired calls from a backend); the
    /// wrapper is dropped in place with a warning.
    pub fn released(&self, mut frame: FrameBuffer) {
        let id = frame.id();
        let mut state = self.state.lock().unwrap();
        if state.outstanding.remove(&id).is_some() {
            frame.clear_transient();
            state.free.push(frame);
            debug!("frame {id} released to pool");
        } else {
            warn!("released untracked frame {id}; dropping wrapper");
        }
        state.emit(LifecycleEvent::Released(id));
    }

    /// Drop-and-release in one step; the path taken by every discarded frame.
    pub fn discard(&self, frame: FrameBuffer) {
        self.dropped(&frame);
        self.released(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_assigns_monotone_ids() {
        let pool = FramePool::new();
        let a = pool.acquire(AllocFlags::NONE, 0);
        let b = pool.acquire(AllocFlags::NONE, 0);
        assert!(b.id() > a.id());
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn release_recycles_wrapper_under_new_id() {
        let pool = FramePool::new();
        let lifecycle = pool.lifecycle();

        let frame = pool.acquire(AllocFlags::RAW, 1024);
        let first_id = frame.id();
        lifecycle.released(frame);
        assert_eq!(pool.free_count(), 1);

        let again = pool.acquire(AllocFlags::RAW, 512);
        assert_ne!(again.id(), first_id);
        assert_eq!(pool.free_count(), 0);
        assert!(again.raw.as_ref().unwrap().capacity() >= 1024);
    }

    #[test]
    fn reuse_requires_matching_flags() {
        let pool = FramePool::new();
        let lifecycle = pool.lifecycle();

        let raw = pool.acquire(AllocFlags::RAW, 64);
        lifecycle.released(raw);

        // A DMA-only request must not be served from the RAW free entry.
        let dma = pool.acquire(AllocFlags::DMA, 0);
        assert!(dma.raw.is_none());
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn untracked_release_is_tolerated() {
        let pool = FramePool::new();
        let lifecycle = pool.lifecycle();

        let frame = pool.acquire(AllocFlags::NONE, 0);
        let stray = FrameBuffer::new(frame.id() + 1000, AllocFlags::NONE, 0);
        lifecycle.released(stray);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.outstanding(), 1);
        lifecycle.released(frame);
    }

    #[test]
    fn events_mirror_lifecycle() {
        let pool = FramePool::new();
        let events = pool.subscribe();
        let lifecycle = pool.lifecycle();

        let frame = pool.acquire(AllocFlags::NONE, 0);
        let id = frame.id();
        lifecycle.displayed(&frame);
        lifecycle.released(frame);

        assert_eq!(events.recv().unwrap(), LifecycleEvent::Displayed(id));
        assert_eq!(events.recv().unwrap(), LifecycleEvent::Released(id));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let pool = FramePool::new();
        let lifecycle = pool.lifecycle();
        drop(pool.subscribe());

        let frame = pool.acquire(AllocFlags::NONE, 0);
        lifecycle.released(frame);
        assert_eq!(pool.state.lock().unwrap().subscribers.len(), 0);
    }
}
