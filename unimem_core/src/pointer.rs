use crate::DeviceCopy;
use core::fmt;
use core::ptr;

/// A pointer to device memory.
///
/// DevicePointer cannot be dereferenced by the CPU, as it is a pointer to a memory allocation in
/// the device address space. For devices that share memory with the host (and for the emulated
/// backend) the address happens to be a host address, but callers must not rely on that.
#[repr(transparent)]
#[derive(Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct DevicePointer<T: DeviceCopy>(*mut T);
unsafe impl<T: DeviceCopy> DeviceCopy for DevicePointer<T> {}

impl<T: DeviceCopy> Clone for DevicePointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: DeviceCopy> Copy for DevicePointer<T> {}

impl<T: DeviceCopy> DevicePointer<T> {
    /// Returns a null device pointer.
    ///
    /// # Examples:
    ///
    /// ```
    /// use unimem::memory::*;
    /// let ptr : DevicePointer<u64> = DevicePointer::null();
    /// assert!(ptr.is_null());
    /// ```
    pub fn null() -> Self {
        DevicePointer(ptr::null_mut())
    }

    /// Wrap the given raw pointer in a DevicePointer. The given pointer is assumed to be a valid
    /// device pointer or null.
    ///
    /// # Safety
    ///
    /// The given pointer must have been produced by a backend device allocation or host mapping,
    /// or be null.
    pub unsafe fn wrap(ptr: *mut T) -> Self {
        DevicePointer(ptr)
    }

    /// Wrap a raw device address, as handed out by driver APIs that use integer addresses.
    ///
    /// # Safety
    ///
    /// See [`wrap`](#method.wrap).
    pub unsafe fn from_address(address: u64) -> Self {
        DevicePointer(address as usize as *mut T)
    }

    /// Returns the contained pointer as a raw pointer. The returned pointer is not valid on the CPU
    /// and must not be dereferenced.
    pub fn as_raw(self) -> *const T {
        self.0
    }

    /// Returns the contained pointer as a mutable raw pointer. The returned pointer is not valid on
    /// the CPU and must not be dereferenced.
    pub fn as_raw_mut(self) -> *mut T {
        self.0
    }

    /// Returns the device address as an integer.
    pub fn address(self) -> u64 {
        self.0 as usize as u64
    }

    /// Returns true if the pointer is null.
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Calculates the offset from a device pointer using wrapping arithmetic.
    ///
    /// `count` is in units of T; eg. a `count` of 3 represents a pointer offset of
    /// `3 * size_of::<T>()` bytes. The result is only meaningful if it stays inside the
    /// allocation the pointer came from.
    pub fn wrapping_add(self, count: usize) -> Self {
        DevicePointer(self.0.wrapping_add(count))
    }

    /// Reinterpret this pointer as a pointer to another element type.
    pub fn cast<U: DeviceCopy>(self) -> DevicePointer<U> {
        DevicePointer(self.0 as *mut U)
    }
}

impl<T: DeviceCopy> fmt::Debug for DevicePointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("DevicePointer").field(&self.0).finish()
    }
}

impl<T: DeviceCopy> fmt::Pointer for DevicePointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}
