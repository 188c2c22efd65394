//! # unimem
//! Host and device memory for heterogeneous accelerators, behind one interface for every backend.
//!
//! The central type is [`Mirrored`](mirror/struct.Mirrored.html): a host container and a device
//! container that always share one shape, with update functions that move data between them. When
//! the host and device element types are the same and the device can address host memory, the
//! device side is simply a view of the host storage. When the element types differ, data passes
//! through a host-resident cast buffer and is converted element by element.
//!
//! Below that sit the plain containers of the [`memory`](memory/index.html) module, the
//! [`copy`](memory/fn.copy.html) primitives and the [`Device`](device/struct.Device.html) handle
//! which selects a device and owns its command queues.
//!
//! # Backends
//!
//! Devices are reached through a [`Runtime`](backend/trait.Runtime.html). The
//! [emulated](backend/emulated/index.html) runtime models accelerators in host memory and is
//! always available; it is what `quick_init` uses. The CUDA driver API is available with the
//! `cuda` feature.
//!
//! # Examples
//!
//! ```
//! use unimem::prelude::*;
//!
//! # fn main() -> Result<(), MemError> {
//! let device = unimem::quick_init()?;
//! let mut data = Mirrored::<f32>::new();
//! data.alloc(1000, &device, Placement::Default, Placement::Default)?;
//!
//! // Device 0 of the emulated runtime shares memory with the host.
//! assert!(data.is_zero_copy());
//! data.host_mut()[0] = 1.5;
//! data.update_device(Extent::All, false)?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_import_braces,
    unused_results,
    unused_qualifications
)]
// Allow clippy lints
#![allow(unknown_lints)]

#[macro_use]
extern crate bitflags;

pub mod backend;
pub mod device;
pub mod error;
pub mod memory;
pub mod mirror;
pub mod prelude;
pub(crate) mod private;
pub mod stream;

mod derive_compile_fail;

pub use crate::device::Device;
pub use unimem_core::DeviceCopy;
pub use unimem_derive::DeviceCopy;

use crate::backend::emulated::EmulatedRuntime;
use crate::error::MemResult;

/// Shortcut for initializing the emulated runtime and selecting its first device, which
/// shares memory with the host.
///
/// This is useful for testing or just setting up a basic context quickly. Users with more
/// complex needs should use `Device::enumerate` with the runtime of their choice.
///
/// # Examples:
///
/// ```
/// # use unimem::*;
/// let device = quick_init().unwrap();
/// assert_eq!(Some(0), device.active_index());
/// ```
pub fn quick_init() -> MemResult<Device> {
    let mut device = Device::enumerate(EmulatedRuntime::default())?;
    device.check_available()?;
    device.select(0)?;
    Ok(device)
}

/// Initialize the CUDA driver API and select device 0.
#[cfg(feature = "cuda")]
pub fn cuda_init() -> MemResult<Device> {
    let mut device = Device::enumerate(backend::cuda::CudaRuntime::new()?)?;
    device.check_available()?;
    device.select(0)?;
    Ok(device)
}
