//! The display backend contract driven by the pacing scheduler.
//!
//! A backend is anything that can take scheduler-approved frames and put them
//! on glass: a compositor binding, a socket-framed video server, a kernel
//! capture device. Concrete backends are selected at construction time and
//! driven exclusively through [`DisplayBackend`].
//!
//! The lifecycle contract is the load-bearing part: for every buffer a
//! backend accepts through [`display_frame`](DisplayBackend::display_frame)
//! it must eventually issue exactly one terminal `released` notification,
//! optionally preceded by at most one of `dropped` or `displayed`. A frame
//! rejected synchronously (returned as [`RejectedFrame`]) reverts to the
//! caller, and the backend must not issue any notification for it.

use std::fmt;

use crate::frames::FrameBuffer;
use crate::{Error, Result};

/// Lifecycle state bits reported by [`DisplayBackend::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendState(u32);

impl BackendState {
    /// No lifecycle step completed yet.
    pub const NONE: BackendState = BackendState(0);
    /// `init` has succeeded.
    pub const INITED: BackendState = BackendState(1 << 0);
    /// `open_display` has succeeded.
    pub const DISPLAY_OPENED: BackendState = BackendState(1 << 1);
    /// `open_window` has succeeded.
    pub const WINDOW_OPENED: BackendState = BackendState(1 << 2);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: BackendState) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn insert(&mut self, other: BackendState) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: BackendState) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for BackendState {
    type Output = BackendState;

    fn bitor(self, rhs: BackendState) -> BackendState {
        BackendState(self.0 | rhs.0)
    }
}

/// A frame a backend refused synchronously.
///
/// Ownership of the buffer reverts to the caller, which must drop and
/// release it through its own lifecycle handle; the backend will not issue
/// any notification for a rejected frame.
pub struct RejectedFrame {
    /// The buffer, returned untouched.
    pub frame: FrameBuffer,
    /// Why the backend refused it.
    pub reason: Error,
}

impl fmt::Debug for RejectedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedFrame")
            .field("frame", &self.frame.id())
            .field("reason", &self.reason)
            .finish()
    }
}

/// Placement of the video window on the display, in display pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Source frame dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Pixel layouts a backend can be asked to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPixelFormat {
    /// Semi-planar YCbCr 4:2:0, the common decoder output on this class of
    /// hardware.
    #[default]
    Nv12,
    /// Semi-planar YCbCr 4:2:0 with swapped chroma order.
    Nv21,
    /// Planar YCbCr 4:2:0.
    Yuv420,
    /// Interleaved 8-bit RGBA.
    Rgba,
}

/// Capability set every display backend implements.
///
/// Lifecycle methods are ordered: `init`, then `open_display`, then
/// `open_window`; `state` reports which steps have completed. Frames are only
/// accepted while the window is open.
pub trait DisplayBackend: Send + Sync {
    /// Brings up the backend (spawns its workers, connects its device).
    fn init(&self) -> Result<()>;

    /// Tears the backend down, flushing and releasing anything in flight.
    fn release(&self);

    /// Opens the output display.
    fn open_display(&self) -> Result<()>;

    /// Closes the output display.
    fn close_display(&self);

    /// Opens the video window on the display.
    fn open_window(&self) -> Result<()>;

    /// Closes the video window.
    fn close_window(&self);

    /// Accepts a frame for presentation at `when_us` (process-monotonic
    /// microseconds).
    ///
    /// # Errors
    ///
    /// Returns the buffer back as a [`RejectedFrame`] if the backend cannot
    /// accept it; no lifecycle notification follows for a rejected frame.
    fn display_frame(
        &self,
        frame: FrameBuffer,
        when_us: i64,
    ) -> std::result::Result<(), RejectedFrame>;

    /// Drops and releases every frame currently held by the backend. On
    /// return no previously accepted frame is still awaiting its release
    /// notification.
    fn flush(&self);

    /// Holds presentation; accepted frames accumulate.
    fn pause(&self);

    /// Resumes presentation.
    fn resume(&self);

    /// Sets the window placement.
    fn set_window_rect(&self, rect: WindowRect) -> Result<()>;

    /// Current window placement.
    fn window_rect(&self) -> WindowRect;

    /// Sets the source frame dimensions.
    fn set_frame_size(&self, size: FrameSize) -> Result<()>;

    /// Current source frame dimensions.
    fn frame_size(&self) -> FrameSize;

    /// Sets the presented pixel format.
    fn set_pixel_format(&self, format: BackendPixelFormat) -> Result<()>;

    /// Current presented pixel format.
    fn pixel_format(&self) -> BackendPixelFormat;

    /// Sets a backend-specific scalar extra.
    fn set_extra(&self, key: &str, value: i64) -> Result<()>;

    /// Reads a backend-specific scalar extra.
    fn extra(&self, key: &str) -> Option<i64>;

    /// Which lifecycle steps have completed.
    fn state(&self) -> BackendState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bits_compose() {
        let mut state = BackendState::NONE;
        assert!(!state.contains(BackendState::INITED));

        state.insert(BackendState::INITED);
        state.insert(BackendState::DISPLAY_OPENED);
        assert!(state.contains(BackendState::INITED | BackendState::DISPLAY_OPENED));
        assert!(!state.contains(BackendState::WINDOW_OPENED));

        state.remove(BackendState::DISPLAY_OPENED);
        assert!(state.contains(BackendState::INITED));
        assert!(!state.contains(BackendState::DISPLAY_OPENED));
    }
}
