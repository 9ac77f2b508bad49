//! Process-monotonic clock shared by the scheduler and backend workers.

use once_cell::sync::Lazy;

use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds elapsed since the process epoch.
///
/// All wall-clock arithmetic in this crate (target display times, vblank
/// stamps, pacing deadlines) shares this time base.
pub fn monotonic_us() -> i64 {
    EPOCH.elapsed().as_micros() as i64
}

/// Captures the epoch eagerly so that worker threads never observe time zero
/// racing with their first read.
pub(crate) fn init() {
    Lazy::force(&EPOCH);
}
