//! This module is a dummy module. It contains doctests that should fail to compile. It's used for
//! testing the DeviceCopy custom-derive macro and should not contain any actual code.
//!
//! ```compile_fail
//! use unimem::DeviceCopy;
//!
//! #[derive(Clone, DeviceCopy)]
//! struct ShouldFailTuple(Vec<u64>);
//! ```
//!
//! ```compile_fail
//! use unimem::DeviceCopy;
//!
//! #[derive(Clone, DeviceCopy)]
//! struct ShouldFailStruct{v: Vec<u64>}
//! ```
//!
//! ```compile_fail
//! use unimem::DeviceCopy;
//!
//! #[derive(Clone, Copy, DeviceCopy)]
//! enum ShouldFailEnum {
//!     Unit,
//!     Tuple(u64),
//! }
//! ```
//!
//! ```compile_fail
//! use unimem::DeviceCopy;
//!
//! #[derive(Copy, Clone, DeviceCopy)]
//! union ShouldFailUnion {
//!     u: *const u64,
//!     o: *const i64,
//! }
//! ```
//!
//! ```compile_fail
//! use unimem::mirror::Mirrored;
//!
//! // No conversion between these element types.
//! let _ = Mirrored::<f32, bool>::new();
//! ```
