//! unimem-core is the minimal subset of unimem that describes element types.
//!
//! It holds the marker trait for values that may live in device memory, the element conversion
//! trait used when the host and device disagree on an element type, and the device pointer
//! wrapper. It is not intended to be used in a standalone way - see unimem for full documentation.

#![no_std]
#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_import_braces,
    unused_results,
    unused_qualifications
)]
#![allow(unknown_lints)]

mod cast;
mod pointer;

pub use crate::cast::*;
pub use crate::pointer::*;

use core::marker::PhantomData;
use core::num::Wrapping;

/// Marker trait for types which can safely be copied to or from an accelerator device.
///
/// A type can be safely copied if its value can be duplicated simply by copying bits and if it does
/// not contain a reference to memory which is not accessible to the device. Every transfer in
/// unimem is a byte copy, so any element stored in a host or device container must implement
/// this trait.
///
/// ## How can I implement DeviceCopy?
///
/// The simplest way is to use `derive`:
///
/// ```
/// use unimem::DeviceCopy;
///
/// #[derive(Clone, Copy, DeviceCopy)]
/// struct Particle {
///     x: f32,
///     charge: f32,
/// }
/// ```
///
/// The derive macro checks that all fields of the struct or union implement `DeviceCopy`; enums
/// are rejected.
/// This fails to compile, because `Vec` cannot be copied to the device:
///
/// ```compile_fail
/// use unimem::DeviceCopy;
///
/// #[derive(Clone, DeviceCopy)]
/// struct Neighbors(Vec<u32>);
/// ```
///
/// You can also implement `DeviceCopy` unsafely:
///
/// ```
/// use unimem::memory::DeviceCopy;
///
/// #[derive(Clone, Copy)]
/// struct Tag(u64);
///
/// unsafe impl DeviceCopy for Tag { }
/// ```
///
/// ## Safety
///
/// Implementors must be plain data: no references, no pointers to host-only memory, no `Drop`.
/// Host containers are zero-filled when allocated, so the all-zero bit pattern must also be a
/// valid value of the type. This rules out `NonZero*` integers, references and most enums.
pub unsafe trait DeviceCopy {
    // Empty
}

macro_rules! impl_device_copy {
    ($($t:ty)*) => {
        $(
            unsafe impl DeviceCopy for $t {}
        )*
    }
}

impl_device_copy!(
    usize u8 u16 u32 u64 u128
    isize i8 i16 i32 i64 i128
    f32 f64
    bool char
);
unsafe impl<T: ?Sized + DeviceCopy> DeviceCopy for PhantomData<T> {}
unsafe impl<T: DeviceCopy> DeviceCopy for Wrapping<T> {}
unsafe impl<T: DeviceCopy, const N: usize> DeviceCopy for [T; N] {}
unsafe impl DeviceCopy for () {}
unsafe impl<A: DeviceCopy, B: DeviceCopy> DeviceCopy for (A, B) {}
unsafe impl<A: DeviceCopy, B: DeviceCopy, C: DeviceCopy> DeviceCopy for (A, B, C) {}
unsafe impl<A: DeviceCopy, B: DeviceCopy, C: DeviceCopy, D: DeviceCopy> DeviceCopy
    for (A, B, C, D)
{
}
