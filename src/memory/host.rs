use crate::backend::{Context, MemPtr};
use crate::error::{MemError, MemResult};
use crate::memory::{DeviceCopy, Memory, Placement, Scope, Shape};
use std::fmt;
use std::mem;
use std::ops;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;
use tracing::{debug, error};

/// Host-side buffer allocated through a backend context.
///
/// Depending on its [`Placement`](enum.Placement.html) the memory is pageable, page-locked or
/// mapped into the device address space. New allocations are zero-filled. The buffer
/// dereferences to a slice of its elements, row-major for matrix shapes.
///
/// # Examples:
///
/// ```
/// # use unimem::*;
/// use unimem::memory::*;
///
/// let device = quick_init().unwrap();
/// let mut buffer = HostBuffer::<f32>::alloc(4, &device, Placement::Pinned).unwrap();
/// buffer.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
/// assert_eq!(4, buffer.len());
/// assert_eq!(Placement::Pinned, buffer.kind());
/// ```
pub struct HostBuffer<T: DeviceCopy> {
    buf: NonNull<T>,
    shape: Shape,
    placement: Placement,
    context: Option<Arc<dyn Context>>,
}

unsafe impl<T: DeviceCopy + Send> Send for HostBuffer<T> {}
unsafe impl<T: DeviceCopy + Sync> Sync for HostBuffer<T> {}

impl<T: DeviceCopy> HostBuffer<T> {
    /// An empty buffer with no storage and no context.
    pub fn new() -> Self {
        HostBuffer {
            buf: NonNull::dangling(),
            shape: Shape::EMPTY,
            placement: Placement::Default,
            context: None,
        }
    }

    /// Allocate a zero-filled buffer of `shape` in `scope`.
    ///
    /// # Errors:
    ///
    /// `InvalidPlacement` for `Placement::View`, `AllocationError` if the backend cannot satisfy
    /// the request, `NoActiveDevice` if the scope is a device handle with no selected device.
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
        let mut buffer = HostBuffer {
            buf: NonNull::dangling(),
            shape: Shape::EMPTY,
            placement,
            context: Some(context),
        };
        buffer.allocate(shape.into())?;
        Ok(buffer)
    }

    /// Copy a slice into a new buffer allocated in `scope`.
    pub fn from_slice<'a, C>(slice: &[T], scope: C, placement: Placement) -> MemResult<Self>
    where
        T: Copy,
        C: Into<Scope<'a>>,
    {
        let mut buffer = HostBuffer::alloc(slice.len(), scope, placement)?;
        buffer.copy_from_slice(slice);
        Ok(buffer)
    }

    fn allocate(&mut self, shape: Shape) -> MemResult<()> {
        let bytes = shape.bytes_of::<T>()?;
        let context = self.context.as_ref().ok_or(MemError::NoActiveDevice)?;
        if bytes > 0 {
            unsafe {
                let ptr = context.alloc_host(bytes, self.placement)?;
                ptr::write_bytes(ptr, 0, bytes);
                self.buf = NonNull::new_unchecked(ptr as *mut T);
            }
            debug!(bytes, placement = ?self.placement, "allocated host buffer");
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

    /// Release the storage, leaving an empty buffer that can be resized again.
    ///
    /// Calling `free` twice is harmless: the second call has nothing to release.
    pub fn free(&mut self) -> MemResult<()> {
        let bytes = self.byte_len();
        let ptr = mem::replace(&mut self.buf, NonNull::dangling());
        self.shape = Shape::EMPTY;
        if bytes == 0 {
            return Ok(());
        }
        match self.context {
            Some(ref context) => unsafe {
                context.free_host(ptr.as_ptr() as *mut u8, bytes, self.placement)
            },
            None => Ok(()),
        }
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

    /// Fill the buffer with zero bytes.
    pub fn zero(&mut self) {
        let bytes = self.byte_len();
        unsafe { ptr::write_bytes(self.buf.as_ptr() as *mut u8, 0, bytes) }
    }

    /// Extracts a slice containing the entire buffer.
    pub fn as_slice(&self) -> &[T] {
        self
    }

    /// Extracts a mutable slice of the entire buffer.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }

    /// Raw pointer to the first element.
    pub fn as_ptr(&self) -> *const T {
        self.buf.as_ptr()
    }

    /// Mutable raw pointer to the first element.
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.buf.as_ptr()
    }

    fn byte_len(&self) -> usize {
        self.shape.len() * mem::size_of::<T>()
    }
}

impl<T: DeviceCopy> Default for HostBuffer<T> {
    fn default() -> Self {
        HostBuffer::new()
    }
}

impl<T: DeviceCopy> crate::private::Sealed for HostBuffer<T> {}

impl<T: DeviceCopy> Memory<T> for HostBuffer<T> {
    fn shape(&self) -> Shape {
        self.shape
    }

    fn kind(&self) -> Placement {
        self.placement
    }

    fn mem_ptr(&self) -> MemPtr {
        MemPtr::Host(self.buf.as_ptr() as *mut u8)
    }

    fn context(&self) -> Option<&Arc<dyn Context>> {
        self.context.as_ref()
    }
}

impl<T: DeviceCopy> ops::Deref for HostBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.buf.as_ptr(), self.shape.len()) }
    }
}

impl<T: DeviceCopy> ops::DerefMut for HostBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.buf.as_ptr(), self.shape.len()) }
    }
}

impl<T: DeviceCopy> AsRef<[T]> for HostBuffer<T> {
    fn as_ref(&self) -> &[T] {
        self
    }
}

impl<T: DeviceCopy> AsMut<[T]> for HostBuffer<T> {
    fn as_mut(&mut self) -> &mut [T] {
        self
    }
}

impl<T: DeviceCopy> fmt::Debug for HostBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.buf)
            .field("shape", &self.shape)
            .field("placement", &self.placement)
            .finish()
    }
}

impl<T: DeviceCopy> Drop for HostBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            error!(error = %e, "failed to free host buffer");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::emulated::EmulatedRuntime;
    use crate::device::Device;

    fn device() -> (EmulatedRuntime, Device) {
        let runtime = EmulatedRuntime::default();
        let mut device = Device::enumerate(runtime.clone()).unwrap();
        device.select(1).unwrap();
        (runtime, device)
    }

    #[test]
    fn alloc_is_zero_filled() {
        let (_rt, device) = device();
        let buffer = HostBuffer::<u32>::alloc((3, 5), &device, Placement::Default).unwrap();
        assert_eq!(15, buffer.len());
        assert_eq!(Shape::Matrix { rows: 3, cols: 5 }, buffer.shape());
        assert!(buffer.iter().all(|&x| x == 0));
    }

    #[test]
    fn view_placement_is_rejected() {
        let (_rt, device) = device();
        assert_eq!(
            MemError::InvalidPlacement,
            HostBuffer::<u8>::alloc(4, &device, Placement::View).unwrap_err()
        );
    }

    #[test]
    fn unselected_device_has_no_context() {
        let device = Device::enumerate(EmulatedRuntime::default()).unwrap();
        assert_eq!(
            MemError::NoActiveDevice,
            HostBuffer::<u8>::alloc(4, &device, Placement::Default).unwrap_err()
        );
    }

    #[test]
    fn resize_to_same_shape_keeps_allocation() {
        let (runtime, device) = device();
        let mut buffer = HostBuffer::<f64>::alloc(8, &device, Placement::Pinned).unwrap();
        buffer[3] = 2.5;
        buffer.resize(8).unwrap();
        buffer.resize(8).unwrap();
        assert_eq!(2.5, buffer[3]);
        assert_eq!(1, runtime.stats().host_allocs);

        buffer.resize((2, 2)).unwrap();
        assert_eq!(4, buffer.len());
        assert_eq!(Placement::Pinned, buffer.kind());
        assert_eq!(2, runtime.stats().host_allocs);
        assert_eq!(1, runtime.stats().host_frees);
    }

    #[test]
    fn free_then_drop_releases_once() {
        let (runtime, device) = device();
        let mut buffer = HostBuffer::<u8>::alloc(32, &device, Placement::Default).unwrap();
        buffer.free().unwrap();
        buffer.free().unwrap();
        assert!(buffer.is_empty());
        drop(buffer);
        let stats = runtime.stats();
        assert_eq!(1, stats.host_frees);
        assert_eq!(0, stats.invalid_frees);
    }

    #[test]
    fn empty_allocation_touches_no_backend() {
        let (runtime, device) = device();
        let buffer = HostBuffer::<u16>::alloc(0, &device, Placement::Default).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(0, runtime.stats().host_allocs);
    }
}
