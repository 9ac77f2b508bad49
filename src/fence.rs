//! Completion fences for posted buffers.
//!
//! A [`Fence`] is the signal that the display hardware has finished reading a
//! posted buffer and the buffer may be reclaimed. Devices hand one out per
//! post; the recycler worker blocks on it with a bounded timeout.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{Error, Result};

struct Inner {
    signaled: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

/// A completion signal shared between a device and the worker reclaiming its
/// buffers.
///
/// Clones observe the same underlying state: signaling through one handle
/// wakes waiters blocked on any other. The implementation uses an atomic flag
/// for lock-free checks and a mutex + condvar for efficient blocking waits,
/// recovering from mutex poisoning rather than panicking.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<Inner>,
}

impl Fence {
    /// Creates a new fence in the unsignaled state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                signaled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Creates a fence that is already signaled.
    ///
    /// Useful for devices whose post call completes synchronously and which
    /// have no retrievable hardware fence.
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.inner.signaled.store(true, Ordering::Release);
        fence
    }

    /// Signals the fence and wakes all waiting threads.
    ///
    /// Safe to call multiple times; subsequent calls are no-ops for the flag
    /// but still notify waiters.
    pub fn signal(&self) {
        self.inner.signaled.store(true, Ordering::Release);
        let _lock = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.inner.cv.notify_all();
    }

    /// Lock-free check of the fence state.
    pub fn is_signaled(&self) -> bool {
        self.inner.signaled.load(Ordering::Acquire)
    }

    /// Blocks until the fence signals or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FenceTimeout`] if the timeout elapses first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let mut guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let start = Instant::now();

        while !self.inner.signaled.load(Ordering::Acquire) {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::FenceTimeout(timeout));
            }

            match self.inner.cv.wait_timeout(guard, timeout - elapsed) {
                Ok((new_guard, wait_result)) => {
                    guard = new_guard;
                    if wait_result.timed_out() && !self.inner.signaled.load(Ordering::Acquire) {
                        return Err(Error::FenceTimeout(timeout));
                    }
                }
                Err(poisoned) => {
                    let (new_guard, _) = poisoned.into_inner();
                    guard = new_guard;
                }
            }
        }

        Ok(())
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn new_starts_unsignaled() {
        let fence = Fence::new();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn signaled_constructor_is_signaled() {
        let fence = Fence::signaled();
        assert!(fence.is_signaled());
        assert!(fence.wait_timeout(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn signal_before_wait() {
        let fence = Fence::new();
        fence.signal();
        assert!(fence.wait_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn wait_then_signal() {
        let fence = Fence::new();
        let remote = fence.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal();
        });

        assert!(fence.wait_timeout(Duration::from_secs(1)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn timeout_expires() {
        let fence = Fence::new();
        match fence.wait_timeout(Duration::from_millis(10)) {
            Err(Error::FenceTimeout(_)) => {}
            other => panic!("expected FenceTimeout, got {other:?}"),
        }
    }

    #[test]
    fn clones_share_state() {
        let fence = Fence::new();
        let clone = fence.clone();
        fence.signal();
        assert!(clone.is_signaled());
    }

    #[test]
    fn multiple_signals_are_idempotent() {
        let fence = Fence::new();
        fence.signal();
        fence.signal();
        assert!(fence.is_signaled());
    }

    #[test]
    fn concurrent_signal_and_wait() {
        for _ in 0..100 {
            let fence = Fence::new();
            let remote = fence.clone();

            let signaler = thread::spawn(move || remote.signal());
            let result = fence.wait_timeout(Duration::from_secs(1));
            signaler.join().unwrap();

            assert!(result.is_ok() || fence.is_signaled());
        }
    }
}
