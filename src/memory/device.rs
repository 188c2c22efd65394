use crate::backend::{Context, MemPtr};
use crate::error::{MemError, MemResult};
use crate::memory::{DeviceCopy, DevicePointer, HostBuffer, Memory, Placement, Scope, Shape};
use std::fmt;
use std::mem;
use std::sync::Arc;
use tracing::{debug, error};

/// Device-side buffer which owns its allocation.
///
/// Device memory cannot be read by the CPU; use [`copy`](fn.copy.html) to move data in and out.
/// The contents of a new buffer are unspecified.
pub struct DeviceBuffer<T: DeviceCopy> {
    buf: DevicePointer<T>,
    shape: Shape,
    placement: Placement,
    context: Option<Arc<dyn Context>>,
}

unsafe impl<T: DeviceCopy + Send> Send for DeviceBuffer<T> {}
unsafe impl<T: DeviceCopy + Sync> Sync for DeviceBuffer<T> {}

impl<T: DeviceCopy> DeviceBuffer<T> {
    /// An empty buffer with no storage and no context.
    pub fn new() -> Self {
        DeviceBuffer {
            buf: DevicePointer::null(),
            shape: Shape::EMPTY,
            placement: Placement::Default,
            context: None,
        }
    }

    /// Allocate a buffer of `shape` on the device of `scope`.
    ///
    /// The placement is recorded and handed to nothing else; device memory placement is left to
    /// the backend. `Placement::View` is rejected with `InvalidPlacement`.
    pub fn alloc<'a, S, C>(shape: S, scope: C, placement: Placement) -> MemResult<Self>
    where
        S: Into<Shape>,
        C: Into<Scope<'a>>,
    {
        if placement.is_view() {
            return Err(MemError::InvalidPlacement);
        }
        let scope: Scope<'a> = scope.into();
        let context = scope.context()?.clone();
        let mut buffer = DeviceBuffer {
            buf: DevicePointer::null(),
            shape: Shape::EMPTY,
            placement,
            context: Some(context),
        };
        buffer.allocate(shape.into())?;
        Ok(buffer)
    }

    fn allocate(&mut self, shape: Shape) -> MemResult<()> {
        let bytes = shape.bytes_of::<T>()?;
        let context = self.context.as_ref().ok_or(MemError::NoActiveDevice)?;
        if bytes > 0 {
            self.buf = unsafe { context.alloc_device(bytes)?.cast() };
            debug!(bytes, device = context.device_index(), "allocated device buffer");
        }
        self.shape = shape;
        Ok(())
    }

    /// Change the shape of the buffer. The contents are not preserved.
    ///
    /// Resizing to the current shape does nothing. On failure the buffer is left empty.
    pub fn resize<S: Into<Shape>>(&mut self, shape: S) -> MemResult<()> {
        let shape = shape.into();
        if shape == self.shape {
            return Ok(());
        }
        self.free()?;
        self.allocate(shape)
    }

    /// Release the storage, leaving an empty buffer.
    pub fn free(&mut self) -> MemResult<()> {
        let bytes = self.shape.len() * mem::size_of::<T>();
        let ptr = mem::replace(&mut self.buf, DevicePointer::null());
        self.shape = Shape::EMPTY;
        if bytes == 0 || ptr.is_null() {
            return Ok(());
        }
        match self.context {
            Some(ref context) => unsafe { context.free_device(ptr.cast(), bytes) },
            None => Ok(()),
        }
    }

    /// Returns the device pointer of the first element.
    pub fn as_device_ptr(&self) -> DevicePointer<T> {
        self.buf
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    /// Returns true if the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical shape of the buffer.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Placement the buffer was allocated with.
    pub fn kind(&self) -> Placement {
        self.placement
    }
}

impl<T: DeviceCopy> Default for DeviceBuffer<T> {
    fn default() -> Self {
        DeviceBuffer::new()
    }
}

impl<T: DeviceCopy> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.buf)
            .field("shape", &self.shape)
            .field("placement", &self.placement)
            .finish()
    }
}

impl<T: DeviceCopy> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            error!(error = %e, "failed to free device buffer");
        }
    }
}

/// Non-owning alias of memory that belongs to another container.
///
/// A view never frees anything. The container it was created from must outlive it and must not
/// be resized while the view is in use; this is why the constructors are unsafe.
pub struct DeviceView<T: DeviceCopy> {
    buf: DevicePointer<T>,
    shape: Shape,
    context: Option<Arc<dyn Context>>,
}

unsafe impl<T: DeviceCopy + Send> Send for DeviceView<T> {}
unsafe impl<T: DeviceCopy + Sync> Sync for DeviceView<T> {}

impl<T: DeviceCopy> DeviceView<T> {
    /// View a host buffer from the device.
    ///
    /// Succeeds when the device shares memory with the host or the buffer was allocated with
    /// `Placement::Mapped`; fails with `InvalidPlacement` otherwise.
    ///
    /// # Safety
    ///
    /// `host` must outlive the view and keep its current storage while the view is used.
    pub unsafe fn of_host(host: &HostBuffer<T>) -> MemResult<Self> {
        DeviceView::alias_host(host)
    }

    /// View the storage of a host buffer whose elements have the same layout as `T`.
    pub(crate) unsafe fn alias_host<H: DeviceCopy>(host: &HostBuffer<H>) -> MemResult<Self> {
        debug_assert_eq!(mem::size_of::<H>(), mem::size_of::<T>());
        let context = Memory::context(host).cloned();
        let buf = match context {
            Some(ref context) if !host.is_empty() => context
                .map_host(host.as_ptr() as *mut u8, host.kind())?
                .cast(),
            _ => DevicePointer::null(),
        };
        Ok(DeviceView {
            buf,
            shape: host.shape(),
            context,
        })
    }

    /// View a device buffer.
    ///
    /// # Safety
    ///
    /// `device` must outlive the view and keep its current storage while the view is used.
    pub unsafe fn of_device(device: &DeviceBuffer<T>) -> Self {
        DeviceView {
            buf: device.buf,
            shape: device.shape,
            context: device.context.clone(),
        }
    }

    /// Create a view from raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` must address at least `shape.len()` elements in `context` for the lifetime of the
    /// view.
    pub unsafe fn from_raw_parts(
        ptr: DevicePointer<T>,
        shape: Shape,
        context: Arc<dyn Context>,
    ) -> Self {
        DeviceView {
            buf: ptr,
            shape,
            context: Some(context),
        }
    }

    /// Returns the device pointer of the first element.
    pub fn as_device_ptr(&self) -> DevicePointer<T> {
        self.buf
    }

    /// Logical shape of the view.
    pub fn shape(&self) -> Shape {
        self.shape
    }
}

impl<T: DeviceCopy> fmt::Debug for DeviceView<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceView")
            .field("ptr", &self.buf)
            .field("shape", &self.shape)
            .finish()
    }
}

/// Device-side storage that either owns its allocation or views someone else's.
///
/// This is the device half of a [`Mirrored`](../mirror/struct.Mirrored.html) object.
#[derive(Debug)]
pub enum DeviceMemory<T: DeviceCopy> {
    /// Owned device allocation, freed exactly once.
    Owned(DeviceBuffer<T>),
    /// Alias of another container's storage, never freed.
    View(DeviceView<T>),
}

impl<T: DeviceCopy> DeviceMemory<T> {
    /// Allocate owned device storage.
    pub fn alloc<'a, S, C>(shape: S, scope: C, placement: Placement) -> MemResult<Self>
    where
        S: Into<Shape>,
        C: Into<Scope<'a>>,
    {
        DeviceBuffer::alloc(shape, scope, placement).map(DeviceMemory::Owned)
    }

    /// Turn this storage into a view of `host`, releasing any owned allocation first.
    ///
    /// # Safety
    ///
    /// See [`DeviceView::of_host`](struct.DeviceView.html#method.of_host).
    pub unsafe fn view_host(&mut self, host: &HostBuffer<T>) -> MemResult<()> {
        self.alias_host(host)
    }

    pub(crate) unsafe fn alias_host<H: DeviceCopy>(
        &mut self,
        host: &HostBuffer<H>,
    ) -> MemResult<()> {
        let view = DeviceView::alias_host(host)?;
        self.free()?;
        *self = DeviceMemory::View(view);
        Ok(())
    }

    /// Resize owned storage. Views cannot be resized on their own and fail with
    /// `InvalidPlacement`; re-create them from the resized owner instead.
    pub fn resize<S: Into<Shape>>(&mut self, shape: S) -> MemResult<()> {
        match self {
            DeviceMemory::Owned(buffer) => buffer.resize(shape),
            DeviceMemory::View(_) => Err(MemError::InvalidPlacement),
        }
    }

    /// Release owned storage; for a view only detach from the aliased memory.
    pub fn free(&mut self) -> MemResult<()> {
        match self {
            DeviceMemory::Owned(buffer) => buffer.free(),
            DeviceMemory::View(view) => {
                view.buf = DevicePointer::null();
                view.shape = Shape::EMPTY;
                Ok(())
            }
        }
    }

    /// Returns true if this storage aliases another container.
    pub fn is_view(&self) -> bool {
        matches!(self, DeviceMemory::View(_))
    }

    /// Returns the device pointer of the first element.
    pub fn as_device_ptr(&self) -> DevicePointer<T> {
        match self {
            DeviceMemory::Owned(buffer) => buffer.buf,
            DeviceMemory::View(view) => view.buf,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        Memory::shape(self).len()
    }

    /// Returns true if the storage holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Placement kind; `Placement::View` for views.
    pub fn kind(&self) -> Placement {
        Memory::kind(self)
    }

    /// Logical shape.
    pub fn shape(&self) -> Shape {
        Memory::shape(self)
    }
}

impl<T: DeviceCopy> Default for DeviceMemory<T> {
    fn default() -> Self {
        DeviceMemory::Owned(DeviceBuffer::new())
    }
}

impl<T: DeviceCopy> crate::private::Sealed for DeviceBuffer<T> {}
impl<T: DeviceCopy> crate::private::Sealed for DeviceView<T> {}
impl<T: DeviceCopy> crate::private::Sealed for DeviceMemory<T> {}

impl<T: DeviceCopy> Memory<T> for DeviceBuffer<T> {
    fn shape(&self) -> Shape {
        self.shape
    }

    fn kind(&self) -> Placement {
        self.placement
    }

    fn mem_ptr(&self) -> MemPtr {
        MemPtr::Device(self.buf.cast())
    }

    fn context(&self) -> Option<&Arc<dyn Context>> {
        self.context.as_ref()
    }
}

impl<T: DeviceCopy> Memory<T> for DeviceView<T> {
    fn shape(&self) -> Shape {
        self.shape
    }

    fn kind(&self) -> Placement {
        Placement::View
    }

    fn mem_ptr(&self) -> MemPtr {
        MemPtr::Device(self.buf.cast())
    }

    fn context(&self) -> Option<&Arc<dyn Context>> {
        self.context.as_ref()
    }
}

impl<T: DeviceCopy> Memory<T> for DeviceMemory<T> {
    fn shape(&self) -> Shape {
        match self {
            DeviceMemory::Owned(buffer) => buffer.shape,
            DeviceMemory::View(view) => view.shape,
        }
    }

    fn kind(&self) -> Placement {
        match self {
            DeviceMemory::Owned(buffer) => buffer.placement,
            DeviceMemory::View(_) => Placement::View,
        }
    }

    fn mem_ptr(&self) -> MemPtr {
        MemPtr::Device(self.as_device_ptr().cast())
    }

    fn context(&self) -> Option<&Arc<dyn Context>> {
        match self {
            DeviceMemory::Owned(buffer) => buffer.context.as_ref(),
            DeviceMemory::View(view) => view.context.as_ref(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::emulated::EmulatedRuntime;
    use crate::device::Device;

    fn device(index: usize) -> (EmulatedRuntime, Device) {
        let runtime = EmulatedRuntime::default();
        let mut device = Device::enumerate(runtime.clone()).unwrap();
        device.select(index).unwrap();
        (runtime, device)
    }

    #[test]
    fn view_never_frees() {
        let (runtime, device) = device(0);
        let host = HostBuffer::<u32>::alloc(16, &device, Placement::Default).unwrap();
        let mut memory = DeviceMemory::default();
        unsafe { memory.view_host(&host).unwrap() };
        assert_eq!(Placement::View, memory.kind());
        assert_eq!(16, memory.len());
        assert_eq!(host.as_ptr() as *mut u32, memory.as_device_ptr().as_raw_mut());

        memory.free().unwrap();
        drop(memory);
        assert_eq!(0, runtime.stats().host_frees);
        drop(host);
        assert_eq!(1, runtime.stats().host_frees);
        assert_eq!(0, runtime.stats().invalid_frees);
    }

    #[test]
    fn discrete_device_refuses_pageable_views() {
        let (_rt, device) = device(1);
        let host = HostBuffer::<u32>::alloc(4, &device, Placement::Pinned).unwrap();
        assert_eq!(
            MemError::InvalidPlacement,
            unsafe { DeviceView::of_host(&host) }.unwrap_err()
        );
        let mapped = HostBuffer::<u32>::alloc(4, &device, Placement::Mapped).unwrap();
        assert!(unsafe { DeviceView::of_host(&mapped) }.is_ok());
    }

    #[test]
    fn view_replaces_owned_storage() {
        let (runtime, device) = device(0);
        let host = HostBuffer::<u8>::alloc(8, &device, Placement::Default).unwrap();
        let mut memory = DeviceMemory::alloc(8, &device, Placement::Default).unwrap();
        assert_eq!(1, runtime.stats().device_allocs);
        unsafe { memory.view_host(&host).unwrap() };
        assert_eq!(1, runtime.stats().device_frees);
        assert!(memory.is_view());
        assert_eq!(MemError::InvalidPlacement, memory.resize(4).unwrap_err());
    }

    #[test]
    fn device_resize_and_budget() {
        let runtime = EmulatedRuntime::new(
            crate::backend::emulated::EmulatorConfig::empty().with_device(
                crate::backend::emulated::EmulatorConfig::device("small", 1024, false),
            ),
        );
        let mut device = Device::enumerate(runtime.clone()).unwrap();
        device.select(0).unwrap();

        let mut buffer = DeviceBuffer::<f32>::alloc(128, &device, Placement::Default).unwrap();
        buffer.resize(128).unwrap();
        assert_eq!(1, runtime.stats().device_allocs);
        assert_eq!(
            MemError::AllocationError { bytes: 2048 },
            buffer.resize(512).unwrap_err()
        );
        assert!(buffer.is_empty());
        buffer.resize((16, 16)).unwrap();
        assert_eq!(Shape::Matrix { rows: 16, cols: 16 }, buffer.shape());
        assert_eq!(
            MemError::InvalidPlacement,
            DeviceBuffer::<f32>::alloc(1, &device, Placement::View).unwrap_err()
        );
    }

    #[derive(Clone, Copy)]
    struct Opaque(u32);
    unsafe impl DeviceCopy for Opaque {}

    #[test]
    fn debug_does_not_require_debug_elements() {
        let (_rt, device) = device(1);
        let buffer = DeviceBuffer::<Opaque>::alloc(2, &device, Placement::Default).unwrap();
        assert!(format!("{:?}", buffer).starts_with("DeviceBuffer"));
        let view = unsafe { DeviceView::of_device(&buffer) };
        assert!(format!("{:?}", view).contains("DevicePointer"));
        assert_eq!(0, Opaque(0).0);
    }
}
