//! Host/device mirrored objects.
//!
//! A [`Mirrored`](struct.Mirrored.html) object keeps a host container and a device container
//! of the same shape and moves data between them on request. The host element type `H` and the
//! device element type `D` may differ, for example to keep `f64` data on the host and run a
//! single precision kernel on `f32` data. Whether a conversion is needed is decided once, when
//! the object is constructed, and recorded as its
//! [`MirrorStrategy`](strategy/trait.MirrorStrategy.html).

pub mod strategy;

use self::strategy::{Direct, MirrorStrategy, Parts, Staged};
use crate::error::{MemError, MemResult};
use crate::memory::{
    Cast, DeviceCopy, DeviceMemory, Extent, HostBuffer, Memory, Placement, Scope, Shape, Transfer,
};
use std::any::TypeId;
use std::fmt;
use tracing::{debug, error, warn};

/// Element types that can live in a mirrored object.
pub trait Element: DeviceCopy + Copy + 'static {}

impl<T: DeviceCopy + Copy + 'static> Element for T {}

fn resolve<H, D>() -> &'static dyn MirrorStrategy<H, D>
where
    H: Element + Cast<D>,
    D: Element + Cast<H>,
{
    if TypeId::of::<H>() == TypeId::of::<D>() {
        &Direct
    } else {
        &Staged
    }
}

/// A pair of host and device containers that always share one shape.
///
/// With identical element types, allocating on a device that shares memory with the host makes
/// the device side a view of the host storage: writes on either side are visible on the other
/// and the update functions have nothing to transfer. Otherwise the device side is a separate
/// allocation. With differing element types a host-resident cast buffer of the device element
/// type is kept as well, and every update converts element by element through it.
///
/// # Examples:
///
/// ```
/// # use unimem::*;
/// use unimem::memory::{Extent, Placement};
/// use unimem::mirror::Mirrored;
///
/// let device = quick_init().unwrap();
/// let mut data = Mirrored::<f64, f32>::new();
/// data.alloc(4, &device, Placement::Pinned, Placement::Default).unwrap();
/// data.host_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
/// data.update_device(Extent::All, false).unwrap();
///
/// data.host_mut().iter_mut().for_each(|x| *x = 0.0);
/// data.update_host(Extent::All, false).unwrap();
/// assert_eq!(&[1.0, 2.0, 3.0, 4.0], data.host());
/// ```
pub struct Mirrored<H: Element, D: Element = H> {
    // Declared first so that a view is released before the host storage it aliases.
    device: DeviceMemory<D>,
    cast: HostBuffer<D>,
    host: HostBuffer<H>,
    shape: Shape,
    strategy: &'static dyn MirrorStrategy<H, D>,
}

impl<H, D> Mirrored<H, D>
where
    H: Element + Cast<D>,
    D: Element + Cast<H>,
{
    /// An unallocated object. The strategy is fixed here, from the element types.
    pub fn new() -> Self {
        Mirrored {
            device: DeviceMemory::default(),
            cast: HostBuffer::new(),
            host: HostBuffer::new(),
            shape: Shape::EMPTY,
            strategy: resolve::<H, D>(),
        }
    }

    fn parts(&mut self) -> Parts<'_, H, D> {
        Parts {
            host: &mut self.host,
            cast: &mut self.cast,
            device: &mut self.device,
        }
    }

    /// Allocate host, device and, if needed, cast storage of `shape`.
    ///
    /// `host` is the placement of the memory that takes part in transfers: the host buffer with
    /// identical element types, the cast buffer otherwise (the host buffer is then pageable).
    /// With a device scope whose device shares memory with the host and identical element types,
    /// the device side views the host buffer; the host placement is promoted to
    /// `Placement::Mapped` only if the backend cannot map the requested one. Queue scopes always
    /// get separate device storage.
    ///
    /// Any previous storage is released first. On failure the object is left unallocated.
    pub fn alloc<'a, S, C>(
        &mut self,
        shape: S,
        scope: C,
        host: Placement,
        device: Placement,
    ) -> MemResult<()>
    where
        S: Into<Shape>,
        C: Into<Scope<'a>>,
    {
        let shape = shape.into();
        let scope: Scope<'a> = scope.into();
        self.clear();
        let strategy = self.strategy;
        match strategy.alloc(self.parts(), shape, scope, host, device) {
            Ok(()) => {
                self.shape = shape;
                debug!(
                    strategy = strategy.name(),
                    len = shape.len(),
                    zero_copy = self.is_zero_copy(),
                    "allocated mirrored object"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, len = shape.len(), "mirrored allocation failed");
                self.clear();
                Err(e)
            }
        }
    }

    /// Resize every container. The contents are not preserved.
    ///
    /// Resizing to the current shape does nothing. A view is re-established on the resized host
    /// storage.
    ///
    /// # Errors:
    ///
    /// `ResizeFailure` if any container could not be resized, including when the object was never
    /// allocated. All storage is released in that case; a later `resize` or `alloc` may succeed.
    pub fn resize<S: Into<Shape>>(&mut self, shape: S) -> MemResult<()> {
        let shape = shape.into();
        if shape == self.shape {
            return Ok(());
        }
        let strategy = self.strategy;
        if let Err(e) = strategy.resize(self.parts(), shape) {
            error!(error = %e, len = shape.len(), "resize of mirrored object failed");
            self.clear();
            return Err(MemError::ResizeFailure);
        }
        self.shape = shape;
        Ok(())
    }

    /// Make the device side reflect the host side.
    ///
    /// Nothing is transferred when the device side views the host storage. With differing
    /// element types, the conversion into the cast buffer has completed before the transfer is
    /// issued. An asynchronous transfer is complete only after its queue is synchronized.
    pub fn update_device<'q, X: Into<Transfer<'q>>>(
        &mut self,
        extent: Extent,
        transfer: X,
    ) -> MemResult<()> {
        let strategy = self.strategy;
        strategy.to_device(self.parts(), extent, transfer.into())
    }

    /// Make the host side reflect the device side.
    ///
    /// With differing element types the transfer into the cast buffer is waited on before the
    /// conversion, so the host data is ready when this returns.
    pub fn update_host<'q, X: Into<Transfer<'q>>>(
        &mut self,
        extent: Extent,
        transfer: X,
    ) -> MemResult<()> {
        let strategy = self.strategy;
        strategy.to_host(self.parts(), extent, transfer.into())
    }

    /// Release all storage, logging rather than returning failures.
    pub fn clear(&mut self) {
        if let Err(e) = self.free() {
            error!(error = %e, "failed to release mirrored object");
        }
    }

    /// Release all storage. Views are detached, never freed.
    ///
    /// Every container keeps its context, so a later `resize` allocates again with the same
    /// placements, and a zero-copy object views its new host storage again.
    pub fn free(&mut self) -> MemResult<()> {
        self.shape = Shape::EMPTY;
        let device = self.device.free();
        let cast = self.cast.free();
        let host = self.host.free();
        device.and(cast).and(host)
    }
}

impl<H: Element, D: Element> Mirrored<H, D> {
    /// Host data, row-major.
    pub fn host(&self) -> &[H] {
        &self.host
    }

    /// Mutable host data, row-major. The storage itself cannot be replaced, since the device
    /// side may be a view of it.
    pub fn host_mut(&mut self) -> &mut [H] {
        &mut self.host
    }

    /// The host container.
    pub fn host_buffer(&self) -> &HostBuffer<H> {
        &self.host
    }

    /// The device container.
    pub fn device(&self) -> &DeviceMemory<D> {
        &self.device
    }

    /// The device container, for use as the destination of transfers.
    pub fn device_mut(&mut self) -> &mut DeviceMemory<D> {
        &mut self.device
    }

    /// The cast buffer, present only when the element types differ.
    pub fn cast_buffer(&self) -> Option<&HostBuffer<D>> {
        if self.strategy.uses_cast_buffer() {
            Some(&self.cast)
        } else {
            None
        }
    }

    /// The strategy chosen for these element types.
    pub fn strategy(&self) -> &'static dyn MirrorStrategy<H, D> {
        self.strategy
    }

    /// Shape shared by every container.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    /// Returns true if the object holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the device side is a view of the host storage.
    pub fn is_zero_copy(&self) -> bool {
        self.device.is_view()
    }
}

impl<H, D> Default for Mirrored<H, D>
where
    H: Element + Cast<D>,
    D: Element + Cast<H>,
{
    fn default() -> Self {
        Mirrored::new()
    }
}

impl<H: Element, D: Element> fmt::Debug for Mirrored<H, D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mirrored")
            .field("strategy", &self.strategy.name())
            .field("shape", &self.shape)
            .field("host", &self.host)
            .field("device_kind", &Memory::kind(&self.device))
            .field("cast", &self.cast_buffer())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::emulated::{EmulatedRuntime, EmulatorConfig};
    use crate::device::Device;
    use crate::memory::copy;

    // A discrete device with a 4 KiB memory budget.
    fn discrete() -> (EmulatedRuntime, Device) {
        let runtime = EmulatedRuntime::new(
            EmulatorConfig::empty().with_device(EmulatorConfig::device("small", 4096, false)),
        );
        let mut device = Device::enumerate(runtime.clone()).unwrap();
        device.select(0).unwrap();
        (runtime, device)
    }

    #[test]
    fn strategy_follows_element_types() {
        assert_eq!("direct", Mirrored::<f32>::new().strategy().name());
        assert_eq!("direct", Mirrored::<u8, u8>::new().strategy().name());
        assert_eq!("staged", Mirrored::<f64, f32>::new().strategy().name());
        assert_eq!("staged", Mirrored::<i32, u32>::new().strategy().name());
        assert!(Mirrored::<f32>::new().cast_buffer().is_none());
        assert!(Mirrored::<f64, f32>::new().cast_buffer().is_some());
    }

    #[test]
    fn shared_device_views_host_storage() {
        let device = crate::quick_init().unwrap();
        let mut m = Mirrored::<u32>::new();
        m.alloc(16, &device, Placement::Default, Placement::Default)
            .unwrap();
        assert!(m.is_zero_copy());
        assert_eq!(Placement::View, m.device().kind());
        assert_eq!(Placement::Default, m.host_buffer().kind());
        assert_eq!(
            m.host_buffer().as_ptr() as *mut u32,
            m.device().as_device_ptr().as_raw_mut()
        );
    }

    #[test]
    fn queue_scope_never_views() {
        let device = crate::quick_init().unwrap();
        let queue = device.default_queue().unwrap();
        let mut m = Mirrored::<u32>::new();
        m.alloc(16, queue, Placement::Pinned, Placement::Default)
            .unwrap();
        assert!(!m.is_zero_copy());
        assert_eq!(Placement::Pinned, m.host_buffer().kind());
        assert_eq!(Placement::Default, m.device().kind());
    }

    #[test]
    fn staged_allocation_placements() {
        let (_rt, device) = discrete();
        let mut m = Mirrored::<f64, f32>::new();
        m.alloc((2, 3), &device, Placement::Pinned, Placement::Default)
            .unwrap();
        assert_eq!(Placement::NotPinned, m.host_buffer().kind());
        let cast = m.cast_buffer().unwrap();
        assert_eq!(Placement::Pinned, cast.kind());
        assert_eq!(Shape::Matrix { rows: 2, cols: 3 }, cast.shape());
        assert_eq!(Shape::Matrix { rows: 2, cols: 3 }, m.device().shape());
    }

    #[test]
    fn failed_allocation_leaves_object_empty() {
        let (runtime, device) = discrete();
        let mut m = Mirrored::<u8>::new();
        let too_big = 4097;
        assert_eq!(
            Err(MemError::AllocationError { bytes: too_big }),
            m.alloc(too_big, &device, Placement::Default, Placement::Default)
        );
        assert!(m.is_empty());
        assert!(m.host().is_empty());
        let stats = runtime.stats();
        assert_eq!(0, stats.live_host());
        assert_eq!(0, stats.live_device());
    }

    #[test]
    fn failed_resize_releases_everything() {
        let (runtime, device) = discrete();
        let mut m = Mirrored::<f32, f64>::new();
        m.alloc(8, &device, Placement::Pinned, Placement::Default)
            .unwrap();
        assert_eq!(Err(MemError::ResizeFailure), m.resize(1024));
        assert!(m.is_empty());
        assert!(m.cast_buffer().unwrap().is_empty());
        assert!(m.device().is_empty());
        let stats = runtime.stats();
        assert_eq!(0, stats.live_host());
        assert_eq!(0, stats.live_device());
        assert_eq!(0, stats.invalid_frees);

        m.alloc(8, &device, Placement::Pinned, Placement::Default)
            .unwrap();
        assert_eq!(8, m.len());
    }

    #[test]
    fn resize_reestablishes_view() {
        let device = crate::quick_init().unwrap();
        let mut m = Mirrored::<i16>::new();
        m.alloc(4, &device, Placement::Default, Placement::Default)
            .unwrap();
        m.resize((3, 3)).unwrap();
        assert!(m.is_zero_copy());
        assert_eq!(Shape::Matrix { rows: 3, cols: 3 }, m.device().shape());
        assert_eq!(
            m.host_buffer().as_ptr() as *mut i16,
            m.device().as_device_ptr().as_raw_mut()
        );
    }

    #[test]
    fn device_side_can_be_written_directly() {
        let (_rt, device) = discrete();
        let mut m = Mirrored::<u64>::new();
        m.alloc(3, &device, Placement::Default, Placement::Default)
            .unwrap();
        let src = HostBuffer::from_slice(&[4u64, 5, 6], &device, Placement::Default).unwrap();
        copy(m.device_mut(), &src, Extent::All, false).unwrap();
        m.update_host(Extent::All, false).unwrap();
        assert_eq!(&[4, 5, 6], m.host());
    }

    #[test]
    fn shared_device_keeps_requested_host_placement() {
        let device = crate::quick_init().unwrap();
        let mut m = Mirrored::<u32>::new();
        m.alloc(8, &device, Placement::NotPinned, Placement::Default)
            .unwrap();
        assert!(m.is_zero_copy());
        assert_eq!(Placement::NotPinned, m.host_buffer().kind());
    }

    #[test]
    fn zero_copy_updates_check_the_extent() {
        let device = crate::quick_init().unwrap();
        let mut m = Mirrored::<u8>::new();
        m.alloc(3, &device, Placement::Default, Placement::Default)
            .unwrap();
        assert!(m.is_zero_copy());
        assert_eq!(
            Err(MemError::ShapeMismatch),
            m.update_device(Extent::Cols(10), false)
        );
        assert_eq!(
            Err(MemError::ShapeMismatch),
            m.update_host(Extent::Block { rows: 2, cols: 1 }, false)
        );
        m.update_device(Extent::Cols(3), false).unwrap();
        m.update_host(Extent::All, true).unwrap();
    }

    #[test]
    fn any_device_copy_type_mirrors_itself() {
        let (_rt, device) = discrete();
        let mut m = Mirrored::<[f32; 4]>::new();
        assert_eq!("direct", m.strategy().name());
        m.alloc(2, &device, Placement::Default, Placement::Default)
            .unwrap();
        m.host_mut()[1] = [1.0, 2.0, 3.0, 4.0];
        m.update_device(Extent::All, false).unwrap();
        m.host_mut()[1] = [0.0; 4];
        m.update_host(Extent::All, false).unwrap();
        assert_eq!(&[[0.0; 4], [1.0, 2.0, 3.0, 4.0]], m.host());

        let mut pairs = Mirrored::<(u16, char)>::new();
        pairs
            .alloc(1, &device, Placement::Default, Placement::Default)
            .unwrap();
        assert_eq!(1, pairs.len());
    }

    #[test]
    fn overflowing_shape_fails_without_panicking() {
        let (runtime, device) = discrete();
        let mut m = Mirrored::<u8>::new();
        let huge = (usize::MAX, 2);
        assert_eq!(
            Err(MemError::AllocationError { bytes: usize::MAX }),
            m.alloc(huge, &device, Placement::Default, Placement::Default)
        );
        m.alloc(4, &device, Placement::Default, Placement::Default)
            .unwrap();
        assert_eq!(Err(MemError::ResizeFailure), m.resize(huge));
        assert_eq!(0, runtime.stats().live_host());
    }

    #[test]
    fn freed_objects_can_be_resized() {
        let device = crate::quick_init().unwrap();
        let mut shared = Mirrored::<i32>::new();
        shared
            .alloc(4, &device, Placement::Default, Placement::Default)
            .unwrap();
        shared.free().unwrap();
        shared.resize(6).unwrap();
        assert!(shared.is_zero_copy());
        assert_eq!(6, shared.device().len());
        assert_eq!(
            shared.host_buffer().as_ptr() as *mut i32,
            shared.device().as_device_ptr().as_raw_mut()
        );

        let (_rt, discrete) = discrete();
        let mut separate = Mirrored::<f64, f32>::new();
        separate
            .alloc(4, &discrete, Placement::Default, Placement::Default)
            .unwrap();
        separate.free().unwrap();
        separate.resize(6).unwrap();
        assert_eq!(6, separate.device().len());
        assert_eq!(6, separate.cast_buffer().unwrap().len());

        assert_eq!(Err(MemError::ResizeFailure), Mirrored::<u8>::new().resize(2));
    }

    #[test]
    fn free_is_repeatable() {
        let (runtime, device) = discrete();
        let mut m = Mirrored::<f32, f64>::new();
        m.alloc(8, &device, Placement::Default, Placement::Default)
            .unwrap();
        m.free().unwrap();
        m.free().unwrap();
        drop(m);
        let stats = runtime.stats();
        assert_eq!(2, stats.host_frees);
        assert_eq!(1, stats.device_frees);
        assert_eq!(0, stats.invalid_frees);
    }
}
