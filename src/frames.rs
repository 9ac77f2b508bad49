//! Frame buffers and the DMA descriptors that cross the producer boundary.

use std::{fmt, ops};

use crate::{Error, Result};

/// Presentation timestamp value meaning "unknown, infer from the frame rate".
pub const PTS_UNKNOWN: i64 = -1;

/// Maximum number of planes a DMA descriptor may carry.
pub const MAX_PLANES: usize = 3;

/// Which sub-payloads a [`FrameBuffer`] wrapper owns.
///
/// The pool keys its free list on these flags: a recycled wrapper is only
/// handed out for a request with the same ownership shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// The wrapper owns no payload; it only carries identity and timing.
    pub const NONE: AllocFlags = AllocFlags(0);
    /// The wrapper owns a DMA descriptor.
    pub const DMA: AllocFlags = AllocFlags(1 << 0);
    /// The wrapper owns a raw (non-DMA) byte payload.
    pub const RAW: AllocFlags = AllocFlags(1 << 1);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl ops::BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

/// One plane of a DMA buffer: the exported file descriptor plus its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Exported dmabuf file descriptor for this plane.
    pub fd: i32,
    /// Bytes per row.
    pub stride: u32,
    /// Byte offset of the plane within the buffer object.
    pub offset: u32,
    /// Total plane size in bytes.
    pub size: u32,
}

/// Describes a decoded frame living in DMA memory.
///
/// Built with [`DmaDescriptor::builder`], which enforces the plane-count and
/// dimension constraints up front so backends never have to re-validate.
///
/// # Example
///
/// ```
/// use framepacer::frames::{DmaDescriptor, Plane};
///
/// let dma = DmaDescriptor::builder(1920, 1080)
///     .plane(Plane { fd: 11, stride: 1920, offset: 0, size: 1920 * 1080 })
///     .plane(Plane { fd: 11, stride: 1920, offset: 1920 * 1080, size: 1920 * 1080 / 2 })
///     .build()
///     .unwrap();
/// assert_eq!(dma.planes().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    planes: Vec<Plane>,
}

impl DmaDescriptor {
    /// Creates a builder for a descriptor with the given dimensions.
    pub fn builder(width: u32, height: u32) -> DmaDescriptorBuilder {
        DmaDescriptorBuilder {
            width,
            height,
            planes: Vec::new(),
        }
    }

    /// The planes of this buffer, in plane order.
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Total payload size across all planes, in bytes.
    pub fn total_size(&self) -> usize {
        self.planes.iter().map(|p| p.size as usize).sum()
    }
}

/// Builder for [`DmaDescriptor`] with plane-count validation.
#[derive(Debug, Clone)]
pub struct DmaDescriptorBuilder {
    width: u32,
    height: u32,
    planes: Vec<Plane>,
}

impl DmaDescriptorBuilder {
    /// Appends a plane.
    #[must_use]
    pub fn plane(mut self, plane: Plane) -> Self {
        self.planes.push(plane);
        self
    }

    /// Builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the dimensions are zero or
    /// the plane count is not in `1..=MAX_PLANES`.
    pub fn build(self) -> Result<DmaDescriptor> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "DMA descriptor has degenerate dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.planes.is_empty() || self.planes.len() > MAX_PLANES {
            return Err(Error::InvalidConfiguration(format!(
                "DMA descriptor must carry 1..={} planes, got {}",
                MAX_PLANES,
                self.planes.len()
            )));
        }
        Ok(DmaDescriptor {
            width: self.width,
            height: self.height,
            planes: self.planes,
        })
    }
}

/// A video frame handed across the pipeline boundary.
///
/// Wrappers are created by the [`FramePool`](crate::pool::FramePool) and are
/// exclusively owned by whichever stage currently holds them: the value moves
/// producer to queue to scheduler to backend, and the move is the ownership
/// transfer. A wrapper returns to the pool through exactly one
/// [`released`](crate::pool::FrameLifecycle::released) notification.
pub struct FrameBuffer {
    id: i64,
    /// Presentation timestamp in nanoseconds on the producer clock, or
    /// [`PTS_UNKNOWN`].
    pub pts: i64,
    /// DMA payload, when the frame lives in device memory.
    pub dma: Option<DmaDescriptor>,
    /// Raw byte payload, when the frame was decoded to system memory.
    pub raw: Option<Vec<u8>>,
    /// Opaque caller bookkeeping tag; carried through untouched.
    pub user_tag: i64,
    flags: AllocFlags,
}

impl FrameBuffer {
    pub(crate) fn new(id: i64, flags: AllocFlags, raw_capacity: usize) -> Self {
        Self {
            id,
            pts: PTS_UNKNOWN,
            dma: None,
            raw: flags
                .contains(AllocFlags::RAW)
                .then(|| Vec::with_capacity(raw_capacity)),
            user_tag: 0,
            flags,
        }
    }

    /// Pool-assigned identity; unique for the lifetime of the process.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Ownership flags this wrapper was allocated with.
    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    /// Payload size used for engine bookkeeping: raw length if present, else
    /// the DMA total.
    pub fn payload_size(&self) -> usize {
        if let Some(raw) = &self.raw {
            raw.len()
        } else {
            self.dma.as_ref().map_or(0, DmaDescriptor::total_size)
        }
    }

    pub(crate) fn reassign(&mut self, id: i64) {
        self.id = id;
    }

    /// Clears per-frame state before the wrapper re-enters the free list.
    /// The raw allocation is kept so a recycled wrapper can be reused without
    /// reallocating.
    pub(crate) fn clear_transient(&mut self) {
        self.pts = PTS_UNKNOWN;
        self.dma = None;
        self.user_tag = 0;
        if let Some(raw) = &mut self.raw {
            raw.clear();
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.id)
            .field("pts", &self.pts)
            .field("dma", &self.dma)
            .field("raw (bytes)", &self.raw.as_ref().map_or(0, Vec::len))
            .field("user_tag", &self.user_tag)
            .field("flags", &self.flags)
            .finish()
    }
}
