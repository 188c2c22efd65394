//! Backend runtimes that actually move bytes.
//!
//! Everything above this module is backend-agnostic. A [`Runtime`](trait.Runtime.html) reports
//! the visible devices and opens a [`Context`](trait.Context.html) on one of them. A context owns
//! the device-specific state: its allocations, its command queues and its copy engine. Containers
//! and queues hold an `Arc` to the context they were created in, so there is never an implicit
//! "current device" - switching devices on a [`Device`](../device/struct.Device.html) handle
//! opens a new context while memory from the old one stays valid until it is dropped.
//!
//! Two backends are provided:
//!
//! - [`emulated`](emulated/index.html), a host-resident model of an accelerator, always
//!   available. It is what the tests run against.
//! - `cuda`, the CUDA driver API, behind the `cuda` feature.

use crate::error::MemResult;
use crate::memory::{DevicePointer, Placement};
use crate::stream::QueueFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod emulated;

/// Static properties of one device, as reported by the runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Human-readable device name.
    pub name: String,
    /// Global memory size in bytes.
    pub total_memory: u64,
    /// Compute capability as (major, minor).
    pub compute_capability: (u32, u32),
    /// Number of multiprocessors / compute units.
    pub multiprocessors: u32,
    /// Number of cores.
    pub cores: u32,
    /// Clock rate in kHz.
    pub clock_rate_khz: u32,
    /// Maximum number of threads per block / work-group.
    pub max_threads_per_block: u32,
    /// True if host and device can address the same physical memory.
    #[serde(default)]
    pub shared_memory: bool,
    /// True if the device can overlap copies with kernel execution.
    #[serde(default)]
    pub concurrent_copy: bool,
}

impl DeviceProperties {
    /// Compute capability as a single number, eg. `7.5`.
    pub fn compute_capability_f64(&self) -> f64 {
        f64::from(self.compute_capability.0) + f64::from(self.compute_capability.1) / 10.0
    }

    /// Returns true if the device supports double precision arithmetic.
    pub fn double_precision(&self) -> bool {
        self.compute_capability >= (1, 3)
    }

    /// Global memory in gigabytes.
    pub fn gigabytes(&self) -> f64 {
        self.total_memory as f64 / 1_073_741_824.0
    }

    /// Clock rate in GHz.
    pub fn clock_rate_ghz(&self) -> f64 {
        f64::from(self.clock_rate_khz) * 1e-6
    }
}

/// Identifier of a command queue within a context. `QueueId::DEFAULT` is the context's
/// default queue, which always exists and is never destroyed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u64);

impl QueueId {
    /// The default queue of every context.
    pub const DEFAULT: QueueId = QueueId(0);
}

/// One end of a raw transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemPtr {
    /// Host memory, dereferenceable by the CPU.
    Host(*mut u8),
    /// Device memory.
    Device(DevicePointer<u8>),
}

impl MemPtr {
    /// Offset this pointer by `bytes`.
    pub fn offset(self, bytes: usize) -> MemPtr {
        match self {
            MemPtr::Host(p) => MemPtr::Host(p.wrapping_add(bytes)),
            MemPtr::Device(p) => MemPtr::Device(p.wrapping_add(bytes)),
        }
    }

    /// Returns true if this points to host memory.
    pub fn is_host(&self) -> bool {
        matches!(self, MemPtr::Host(_))
    }
}

/// Entry point of a backend: device discovery and context creation.
pub trait Runtime: fmt::Debug + Send + Sync {
    /// Name of the platform, eg. "NVIDIA Corporation NVIDIA CUDA".
    fn platform_name(&self) -> String;

    /// Query properties of every visible device.
    fn devices(&self) -> MemResult<Vec<DeviceProperties>>;

    /// Open a context on the device at `index`.
    fn open(&self, index: usize) -> MemResult<Arc<dyn Context>>;
}

/// Per-device state of a backend.
///
/// Raw allocation and copy functions are unsafe: the caller guarantees that pointers came from
/// this context and that `bytes` stays within their allocations.
pub trait Context: fmt::Debug + Send + Sync {
    /// Index of the device this context was opened on.
    fn device_index(&self) -> usize;

    /// Allocate `bytes` of host memory with the given placement. `bytes` is never zero.
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized and must be released with `free_host` using the same
    /// size and placement.
    unsafe fn alloc_host(&self, bytes: usize, placement: Placement) -> MemResult<*mut u8>;

    /// Release memory obtained from `alloc_host`.
    ///
    /// # Safety
    ///
    /// `ptr`, `bytes` and `placement` must match a live `alloc_host` call on this context.
    unsafe fn free_host(&self, ptr: *mut u8, bytes: usize, placement: Placement) -> MemResult<()>;

    /// Allocate `bytes` of device memory. `bytes` is never zero.
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized and must be released with `free_device`.
    unsafe fn alloc_device(&self, bytes: usize) -> MemResult<DevicePointer<u8>>;

    /// Release memory obtained from `alloc_device`.
    ///
    /// # Safety
    ///
    /// `ptr` and `bytes` must match a live `alloc_device` call on this context.
    unsafe fn free_device(&self, ptr: DevicePointer<u8>, bytes: usize) -> MemResult<()>;

    /// Returns true if host memory allocated with `placement` can be exposed to the device with
    /// `map_host`.
    fn can_map_host(&self, placement: Placement) -> bool {
        placement == Placement::Mapped
    }

    /// Return the device address at which the device sees a host allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_host` on this context.
    unsafe fn map_host(&self, ptr: *mut u8, placement: Placement) -> MemResult<DevicePointer<u8>>;

    /// Create a new command queue.
    fn create_queue(&self, flags: QueueFlags) -> MemResult<QueueId>;

    /// Destroy a queue created by `create_queue`.
    fn destroy_queue(&self, queue: QueueId) -> MemResult<()>;

    /// Block until all work previously issued to `queue` has completed.
    fn synchronize(&self, queue: QueueId) -> MemResult<()>;

    /// Copy `bytes` from `src` to `dst`. With `queue == None` the copy is complete when this
    /// returns; otherwise it is ordered on that queue and completion is observed through
    /// `synchronize`.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `bytes` and must not overlap. For queued copies they must
    /// stay valid until the queue is synchronized.
    unsafe fn copy(
        &self,
        dst: MemPtr,
        src: MemPtr,
        bytes: usize,
        queue: Option<QueueId>,
    ) -> MemResult<()>;

    /// Copy a block of `rows` rows of `row_bytes` each, where consecutive rows are
    /// `dst_pitch` / `src_pitch` bytes apart.
    ///
    /// # Safety
    ///
    /// See [`copy`](#tymethod.copy); every row must lie within its allocation.
    #[allow(clippy::too_many_arguments)]
    unsafe fn copy_2d(
        &self,
        dst: MemPtr,
        dst_pitch: usize,
        src: MemPtr,
        src_pitch: usize,
        row_bytes: usize,
        rows: usize,
        queue: Option<QueueId>,
    ) -> MemResult<()> {
        if dst_pitch == row_bytes && src_pitch == row_bytes {
            return self.copy(dst, src, row_bytes * rows, queue);
        }
        for row in 0..rows {
            self.copy(
                dst.offset(row * dst_pitch),
                src.offset(row * src_pitch),
                row_bytes,
                queue,
            )?;
        }
        Ok(())
    }
}
