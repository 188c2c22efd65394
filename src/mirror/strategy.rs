//! Allocation and transfer strategies of mirrored objects.
//!
//! A [`Mirrored`](../struct.Mirrored.html) object picks its strategy once, when it is
//! constructed, by comparing the host and device element types:
//!
//! - [`Direct`](struct.Direct.html) when they are the same type. Transfers are raw byte copies
//!   and, on devices that share memory with the host, the device side is a view of the host
//!   storage so no transfer is needed at all.
//! - [`Staged`](struct.Staged.html) when they differ. A cast buffer of the device element type
//!   sits on the host between the two sides; every transfer converts element by element on the
//!   host and moves the cast buffer to or from the device.

use crate::error::MemResult;
use crate::memory::{
    cast_to_device, cast_to_host, check_extent, copy_raw, Cast, DeviceCopy, DeviceMemory, Extent, HostBuffer,
    Memory, Placement, Scope, Shape, Transfer,
};
use std::fmt;
use std::mem;
use tracing::trace;

/// The containers of one mirrored object, borrowed for the duration of a strategy call.
///
/// Only the mirrored object can construct this, so strategies can only act on containers whose
/// shapes it keeps consistent.
pub struct Parts<'a, H: DeviceCopy, D: DeviceCopy> {
    pub(crate) host: &'a mut HostBuffer<H>,
    pub(crate) cast: &'a mut HostBuffer<D>,
    pub(crate) device: &'a mut DeviceMemory<D>,
}

impl<H: DeviceCopy, D: DeviceCopy> fmt::Debug for Parts<'_, H, D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parts")
            .field("host", &self.host)
            .field("cast", &self.cast)
            .field("device_kind", &self.device.kind())
            .finish()
    }
}

/// How a mirrored object allocates its containers and moves data between them.
///
/// This trait is sealed; the two implementations are [`Direct`](struct.Direct.html) and
/// [`Staged`](struct.Staged.html).
pub trait MirrorStrategy<H: DeviceCopy, D: DeviceCopy>:
    crate::private::Sealed + fmt::Debug + Sync
{
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns true if this strategy keeps a cast buffer.
    fn uses_cast_buffer(&self) -> bool;

    /// Allocate every container with `shape`. The containers are empty on entry.
    fn alloc(
        &self,
        parts: Parts<'_, H, D>,
        shape: Shape,
        scope: Scope<'_>,
        host: Placement,
        device: Placement,
    ) -> MemResult<()>;

    /// Resize every container to `shape`.
    fn resize(&self, parts: Parts<'_, H, D>, shape: Shape) -> MemResult<()>;

    /// Make the device side reflect the host side.
    fn to_device(
        &self,
        parts: Parts<'_, H, D>,
        extent: Extent,
        transfer: Transfer<'_>,
    ) -> MemResult<()>;

    /// Make the host side reflect the device side.
    fn to_host(
        &self,
        parts: Parts<'_, H, D>,
        extent: Extent,
        transfer: Transfer<'_>,
    ) -> MemResult<()>;
}

/// Strategy for identical host and device element types.
#[derive(Clone, Copy, Debug, Default)]
pub struct Direct;

/// Strategy for differing host and device element types, converting through a cast buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Staged;

impl crate::private::Sealed for Direct {}
impl crate::private::Sealed for Staged {}

// Direct is only ever selected when `H` and `D` are the same type, so the element layouts
// agree and byte-level copies between the two sides are exact.
impl<H: DeviceCopy, D: DeviceCopy> MirrorStrategy<H, D> for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn uses_cast_buffer(&self) -> bool {
        false
    }

    fn alloc(
        &self,
        parts: Parts<'_, H, D>,
        shape: Shape,
        scope: Scope<'_>,
        host: Placement,
        device: Placement,
    ) -> MemResult<()> {
        debug_assert_eq!(mem::size_of::<H>(), mem::size_of::<D>());
        if scope.shares_memory() {
            let host = if scope.context()?.can_map_host(host) {
                host
            } else {
                trace!(requested = ?host, "promoting host placement to mapped");
                Placement::Mapped
            };
            *parts.host = HostBuffer::alloc(shape, scope, host)?;
            unsafe { parts.device.alias_host(parts.host)? };
            trace!(len = shape.len(), "device side is a view of host storage");
        } else {
            *parts.host = HostBuffer::alloc(shape, scope, host)?;
            *parts.device = DeviceMemory::alloc(shape, scope, device)?;
        }
        Ok(())
    }

    fn resize(&self, parts: Parts<'_, H, D>, shape: Shape) -> MemResult<()> {
        parts.host.resize(shape)?;
        if parts.device.is_view() {
            // The host storage may have moved; point the view at the new allocation.
            unsafe { parts.device.alias_host(parts.host) }
        } else {
            parts.device.resize(shape)
        }
    }

    fn to_device(
        &self,
        parts: Parts<'_, H, D>,
        extent: Extent,
        transfer: Transfer<'_>,
    ) -> MemResult<()> {
        let host = &*parts.host;
        let device = &*parts.device;
        if device.is_view() {
            return check_extent(extent, device.shape(), host.shape());
        }
        copy_raw(
            (device.mem_ptr(), device.shape(), Memory::context(device)),
            (host.mem_ptr(), host.shape(), Memory::context(host)),
            mem::size_of::<D>(),
            extent,
            transfer,
        )
    }

    fn to_host(
        &self,
        parts: Parts<'_, H, D>,
        extent: Extent,
        transfer: Transfer<'_>,
    ) -> MemResult<()> {
        let host = &*parts.host;
        let device = &*parts.device;
        if device.is_view() {
            return check_extent(extent, host.shape(), device.shape());
        }
        copy_raw(
            (host.mem_ptr(), host.shape(), Memory::context(host)),
            (device.mem_ptr(), device.shape(), Memory::context(device)),
            mem::size_of::<H>(),
            extent,
            transfer,
        )
    }
}

impl<H, D> MirrorStrategy<H, D> for Staged
where
    H: DeviceCopy + Copy + Cast<D>,
    D: DeviceCopy + Copy + Cast<H>,
{
    fn name(&self) -> &'static str {
        "staged"
    }

    fn uses_cast_buffer(&self) -> bool {
        true
    }

    fn alloc(
        &self,
        parts: Parts<'_, H, D>,
        shape: Shape,
        scope: Scope<'_>,
        host: Placement,
        device: Placement,
    ) -> MemResult<()> {
        // Pinned memory is scarce; only the cast buffer takes part in DMA.
        *parts.host = HostBuffer::alloc(shape, scope, Placement::NotPinned)?;
        *parts.cast = HostBuffer::alloc(shape, scope, host)?;
        *parts.device = DeviceMemory::alloc(shape, scope, device)?;
        Ok(())
    }

    fn resize(&self, parts: Parts<'_, H, D>, shape: Shape) -> MemResult<()> {
        parts.host.resize(shape)?;
        parts.cast.resize(shape)?;
        parts.device.resize(shape)
    }

    fn to_device(
        &self,
        parts: Parts<'_, H, D>,
        extent: Extent,
        transfer: Transfer<'_>,
    ) -> MemResult<()> {
        cast_to_device(parts.device, &*parts.host, parts.cast, extent, transfer)
    }

    fn to_host(
        &self,
        parts: Parts<'_, H, D>,
        extent: Extent,
        transfer: Transfer<'_>,
    ) -> MemResult<()> {
        cast_to_host(parts.host, &*parts.device, parts.cast, extent, transfer)
    }
}
