//! This module re-exports a number of commonly-used types for working with unimem.
//!
//! This allows the user to `use unimem::prelude::*;` and have the most commonly-used types
//! available quickly.

pub use crate::device::Device;
pub use crate::error::{MemError, MemResult};
pub use crate::memory::{
    copy, DeviceBuffer, DeviceCopy, DeviceMemory, Extent, HostBuffer, Placement, Shape, Transfer,
};
pub use crate::mirror::Mirrored;
pub use crate::stream::{CommandQueue, QueueFlags};
