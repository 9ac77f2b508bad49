//! Error types for the framepacer library.

use std::time::Duration;
use thiserror::Error;

/// The main error type for frame presentation operations.
///
/// Every failure in this crate degrades to "discard one buffer" or "fall back
/// to a simpler pacing strategy"; none of these variants represents a fatal
/// pipeline condition.
#[derive(Debug, Error)]
pub enum Error {
    /// No display backend is attached, or the backend is not in a state that
    /// can accept frames.
    ///
    /// A frame submitted in this state is dropped and released on the spot;
    /// ownership never transfers downstream.
    #[error("display pipeline not initialized")]
    NotInitialized,

    /// The sync engine is not bound to a session yet, or could not produce an
    /// estimate for the requested timestamp.
    ///
    /// The scheduler recovers from this locally by falling back to pts-delta
    /// pacing; it is never surfaced to the producer.
    #[error("sync engine not ready")]
    EngineNotReady,

    /// The display backend refused a frame (buffer import or post failure).
    ///
    /// The specific buffer is dropped and released; the pipeline keeps
    /// processing subsequent frames.
    #[error("backend rejected frame: {0}")]
    BackendRejected(String),

    /// A hardware completion fence did not signal within the bounded wait.
    ///
    /// Treated as "assume displayed" by the recycler.
    #[error("fence did not signal within {0:?}")]
    FenceTimeout(Duration),

    /// Configuration parameters are invalid.
    ///
    /// This can occur when builder validation fails or a property value is
    /// out of range for its key.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An internal queue was closed while a producer was still using it.
    #[error("queue closed: {0}")]
    QueueClosed(String),
}
