//! FIFO queues connecting one producer to one consumer worker.
//!
//! The same queue type serves the scheduler's ingestion queue and the
//! exemplar backend's two internal queues. Insertion order is presentation
//! order; the queue itself never reorders. Consumers select with a
//! non-removing [`peek_map`](FrameQueue::peek_map) and then commit with
//! [`pop_if`](FrameQueue::pop_if), which re-validates the selection in case
//! the queue was flushed in between.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An unbounded FIFO safe for one producer and one consumer thread.
///
/// All critical sections are O(1); no lock is held across a blocking wait.
/// Back-pressure is the producer's job: pushes never block.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    cv: Condvar,
}

impl<T> FrameQueue<T> {
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Appends an entry and wakes any blocked consumer.
    ///
    /// # Errors
    ///
    /// Returns the entry back if the queue has been closed, so the caller can
    /// discard it through its own lifecycle path.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        self.cv.notify_all();
        Ok(())
    }

    /// Removes and returns the head entry, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Blocking pop with no timeout; used by fence-bound consumers.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop_wait(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Applies `f` to the head entry without removing it, blocking up to
    /// `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or if the queue is closed while empty.
    pub fn peek_map<R>(&self, timeout: Duration, f: impl FnOnce(&T) -> R) -> Option<R> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.front() {
                return Some(f(item));
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (new_state, wait) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = new_state;
            if wait.timed_out() && state.items.is_empty() {
                return None;
            }
        }
    }

    /// Pops the head entry only if it satisfies `pred`.
    ///
    /// The peek-then-pop discipline of the consumers runs through here: the
    /// predicate re-checks identity so a concurrent flush between the peek
    /// and the pop cannot hand back a different frame.
    pub fn pop_if(&self, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if state.items.front().is_some_and(|item| pred(item)) {
            state.items.pop_front()
        } else {
            None
        }
    }

    /// Atomically drains every entry, then invokes `f` on each in FIFO order.
    ///
    /// The callback runs outside the queue lock.
    pub fn flush_with(&self, f: impl FnMut(T)) {
        let drained: VecDeque<T> = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.items)
        };
        drained.into_iter().for_each(f);
    }

    /// Closes the queue: blocked consumers wake and drain, later pushes are
    /// rejected.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cv.notify_all();
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = FrameQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn peek_does_not_remove() {
        let queue = FrameQueue::new();
        queue.push(7).unwrap();
        assert_eq!(queue.peek_map(Duration::ZERO, |v| *v), Some(7));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn peek_times_out_when_empty() {
        let queue: FrameQueue<i32> = FrameQueue::new();
        let start = Instant::now();
        assert_eq!(queue.peek_map(Duration::from_millis(20), |v| *v), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn peek_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new());
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push(42).unwrap();
        });

        assert_eq!(queue.peek_map(Duration::from_secs(1), |v| *v), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn pop_if_revalidates() {
        let queue = FrameQueue::new();
        queue.push(5).unwrap();
        assert_eq!(queue.pop_if(|v| *v == 6), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_if(|v| *v == 5), Some(5));
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_drains_in_order() {
        let queue = FrameQueue::new();
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        let mut seen = Vec::new();
        queue.flush_with(|v| seen.push(v));
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn close_rejects_push_and_wakes_pop_wait() {
        let queue = Arc::new(FrameQueue::new());
        let consumer = Arc::clone(&queue);

        let handle = thread::spawn(move || consumer.pop_wait());
        thread::sleep(Duration::from_millis(10));
        queue.close();

        assert_eq!(handle.join().unwrap(), None::<i32>);
        assert_eq!(queue.push(1), Err(1));
    }

    #[test]
    fn pop_wait_drains_before_reporting_closed() {
        let queue = FrameQueue::new();
        queue.push(9).unwrap();
        queue.close();
        assert_eq!(queue.pop_wait(), Some(9));
        assert_eq!(queue.pop_wait(), None);
    }
}
