//! Host and device memory containers and the transfers between them.
//!
//! # Containers
//!
//! Each container represents one allocation of `len()` elements, laid out either as a vector
//! (`Shape::Vector`) or as a row-major matrix (`Shape::Matrix`), together with the
//! [`Placement`](enum.Placement.html) it was allocated with.
//!
//! - [`HostBuffer`](struct.HostBuffer.html) owns host memory. Depending on the placement this is
//!   plain pageable memory, page-locked memory the device can reach by DMA, or memory mapped
//!   into the device address space. Host buffers dereference to slices.
//! - [`DeviceBuffer`](struct.DeviceBuffer.html) owns device memory. It cannot be read by the
//!   CPU; data moves in and out with [`copy`](fn.copy.html).
//! - [`DeviceView`](struct.DeviceView.html) aliases memory owned by another container and never
//!   frees it. On devices that share physical memory with the host, a view of a host buffer gives
//!   zero-copy access: writes through one handle are visible through the other.
//! - [`DeviceMemory`](enum.DeviceMemory.html) is either of the two device forms. Its variant is
//!   the ownership tag, so releasing a view can never free borrowed storage.
//!
//! Containers hold the backend context they were allocated in, so they remain valid after the
//! [`Device`](../device/struct.Device.html) handle selects a different device.
//!
//! # Pinned memory
//!
//! When copying from pageable memory the driver first stages the data through page-locked memory
//! before the DMA transfer. Allocating with `Placement::Pinned` skips that step. The operating
//! system cannot page out pinned memory, so excessive use degrades the whole system; it is best
//! used sparingly, for staging areas of data exchange between the host and the device.

mod copy;
mod device;
mod host;

pub use self::copy::*;
pub(crate) use self::copy::{check_extent, copy_raw};
pub use self::device::*;
pub use self::host::*;
pub use unimem_core::{Cast, DeviceCopy, DevicePointer};

use crate::backend::{Context, MemPtr};
use crate::device::Device;
use crate::error::{MemError, MemResult};
use crate::stream::CommandQueue;
use std::mem;
use std::sync::Arc;

/// Placement policy of an allocation. Purely descriptive: the backend decides what each kind
/// means for host and for device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Let the backend choose.
    Default,
    /// Page-locked host memory, reachable by the device through DMA.
    Pinned,
    /// Host memory mapped into the device address space.
    Mapped,
    /// Plain pageable host memory. Used for the host side of a staged object so that scarce
    /// pinned memory is spent only on the staging buffer.
    NotPinned,
    /// No allocation at all; the container aliases another one.
    View,
}

impl Placement {
    /// Returns true for placements whose host memory is locked against paging.
    pub fn is_page_locked(self) -> bool {
        match self {
            Placement::Pinned | Placement::Mapped => true,
            _ => false,
        }
    }

    /// Returns true for `Placement::View`.
    pub fn is_view(self) -> bool {
        self == Placement::View
    }
}

impl Default for Placement {
    fn default() -> Self {
        Placement::Default
    }
}

/// Logical shape of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    /// A vector of `cols` elements.
    Vector {
        /// Number of elements.
        cols: usize,
    },
    /// A row-major `rows` x `cols` matrix.
    Matrix {
        /// Number of rows.
        rows: usize,
        /// Number of columns; also the row pitch in elements.
        cols: usize,
    },
}

impl Shape {
    /// The shape of an unallocated container.
    pub const EMPTY: Shape = Shape::Vector { cols: 0 };

    /// Number of rows; 1 for vectors.
    pub fn rows(self) -> usize {
        match self {
            Shape::Vector { .. } => 1,
            Shape::Matrix { rows, .. } => rows,
        }
    }

    /// Number of columns.
    pub fn cols(self) -> usize {
        match self {
            Shape::Vector { cols } | Shape::Matrix { cols, .. } => cols,
        }
    }

    /// Total number of elements, saturating at `usize::MAX` for shapes too large to allocate.
    pub fn len(self) -> usize {
        self.rows().saturating_mul(self.cols())
    }

    /// Returns true if the shape holds no elements.
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Size in bytes of this shape with `T` elements, or an allocation error on overflow.
    pub(crate) fn bytes_of<T>(self) -> MemResult<usize> {
        let size = mem::size_of::<T>();
        self.rows()
            .checked_mul(self.cols())
            .and_then(|n| n.checked_mul(size))
            .ok_or(MemError::AllocationError { bytes: usize::MAX })
    }
}

impl Default for Shape {
    fn default() -> Self {
        Shape::EMPTY
    }
}

impl From<usize> for Shape {
    fn from(cols: usize) -> Shape {
        Shape::Vector { cols }
    }
}

impl From<(usize, usize)> for Shape {
    fn from((rows, cols): (usize, usize)) -> Shape {
        Shape::Matrix { rows, cols }
    }
}

/// What an allocation is made against: a device handle (its active device) or a command queue
/// (the device the queue belongs to).
#[derive(Clone, Copy, Debug)]
pub enum Scope<'a> {
    /// Allocate on the active device of this handle.
    Device(&'a Device),
    /// Allocate on the device owning this queue.
    Queue(&'a CommandQueue),
}

impl<'a> Scope<'a> {
    pub(crate) fn context(self) -> MemResult<&'a Arc<dyn Context>> {
        match self {
            Scope::Device(device) => device.context(),
            Scope::Queue(queue) => Ok(queue.context()),
        }
    }

    /// True if allocations in this scope may alias host memory from the device.
    ///
    /// Only device scopes know the capability; queue-scoped allocations always get their own
    /// device storage.
    pub fn shares_memory(self) -> bool {
        match self {
            Scope::Device(device) => device.supports_shared_memory(),
            Scope::Queue(_) => false,
        }
    }
}

impl<'a> From<&'a Device> for Scope<'a> {
    fn from(device: &'a Device) -> Scope<'a> {
        Scope::Device(device)
    }
}

impl<'a> From<&'a mut Device> for Scope<'a> {
    fn from(device: &'a mut Device) -> Scope<'a> {
        Scope::Device(device)
    }
}

impl<'a> From<&'a CommandQueue> for Scope<'a> {
    fn from(queue: &'a CommandQueue) -> Scope<'a> {
        Scope::Queue(queue)
    }
}

/// Sealed trait implemented by every container that can take part in a transfer.
pub trait Memory<T: DeviceCopy>: crate::private::Sealed {
    /// Logical shape of the container.
    fn shape(&self) -> Shape;

    /// Placement kind; `Placement::View` for non-owning containers.
    fn kind(&self) -> Placement;

    /// Number of elements.
    fn len(&self) -> usize {
        self.shape().len()
    }

    /// Returns true if the container holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one element in bytes.
    fn element_size(&self) -> usize {
        mem::size_of::<T>()
    }

    /// Size of the contents in bytes.
    fn byte_len(&self) -> usize {
        self.len() * mem::size_of::<T>()
    }

    #[doc(hidden)]
    fn mem_ptr(&self) -> MemPtr;

    #[doc(hidden)]
    fn context(&self) -> Option<&Arc<dyn Context>>;
}
