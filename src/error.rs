//! Types for error handling
//!
//! # Error handling in unimem
//!
//! Allocation, resize, device selection and transfer failures are all returned to the immediate
//! caller as a [`MemError`](enum.MemError.html). Nothing is retried and nothing aborts the
//! process: a transfer that the backend rejects becomes a recoverable `TransferError`.
//!
//! Numerical codes that other layers share with this crate are described by
//! [`StatusCode`](enum.StatusCode.html), and [`status_string`](fn.status_string.html) renders
//! any such code for diagnostics.

use std::fmt;
use std::result::Result;

/// Error enum which represents all the potential errors returned by unimem.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MemError {
    /// The requested placement and size could not be satisfied.
    #[error("failed to allocate {bytes} bytes")]
    AllocationError {
        /// Size of the failed request in bytes.
        bytes: usize,
    },
    /// Resizing one of the containers of a composite object failed. The object must be treated
    /// as unusable until it is allocated again.
    #[error("resize of a sub-container failed")]
    ResizeFailure,
    /// The runtime reports no visible devices.
    #[error("no accelerator device found")]
    NoDeviceFound,
    /// The requested device index is out of range.
    #[error("invalid device index {index} ({count} devices available)")]
    InvalidDeviceIndex {
        /// The index that was requested.
        index: usize,
        /// The number of devices the runtime reported.
        count: usize,
    },
    /// The backend failed to perform a copy.
    #[error("memory transfer failed")]
    TransferError,
    /// The placement kind cannot be used for this allocation.
    #[error("invalid placement for this allocation")]
    InvalidPlacement,
    /// Source and destination shapes are incompatible with the requested extent.
    #[error("shape mismatch between source and destination")]
    ShapeMismatch,
    /// An operation needed an active device, but none was selected.
    #[error("no device has been selected")]
    NoActiveDevice,
    /// Any other error reported by the backend, carrying the backend's raw code.
    #[error("backend error (code {code})")]
    Backend {
        /// Raw backend error code.
        code: i32,
    },
}

impl MemError {
    /// Map this error onto the shared status code space.
    pub fn status(self) -> StatusCode {
        match self {
            MemError::AllocationError { .. } | MemError::ResizeFailure => StatusCode::MemoryError,
            _ => StatusCode::GenericError,
        }
    }
}

/// Result type for most unimem functions.
pub type MemResult<T> = Result<T, MemError>;

/// Special result type for `drop` functions which includes the un-dropped value with the error.
pub type DropResult<T> = Result<(), (MemError, T)>;

/// Status codes shared between unimem and the layers built on top of it.
///
/// `CompileError`, `FileNotFound` and `FunctionNotFound` are never produced by this crate; they
/// belong to the kernel loading layer that shares the code space.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StatusCode {
    /// The operation succeeded.
    Success = 0,
    /// Unspecified failure.
    GenericError = 1,
    /// A file could not be found.
    FileNotFound = 2,
    /// A kernel function could not be found.
    FunctionNotFound = 3,
    /// Kernel compilation failed.
    CompileError = 4,
    /// A memory allocation or resize failed.
    MemoryError = 5,
}

impl StatusCode {
    /// Convert a raw code, returning `None` for codes outside the shared space.
    pub fn from_raw(code: i32) -> Option<StatusCode> {
        match code {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::GenericError),
            2 => Some(StatusCode::FileNotFound),
            3 => Some(StatusCode::FunctionNotFound),
            4 => Some(StatusCode::CompileError),
            5 => Some(StatusCode::MemoryError),
            _ => None,
        }
    }

    /// The diagnostic name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Success => "UCL_SUCCESS",
            StatusCode::GenericError => "UCL_ERROR",
            StatusCode::FileNotFound => "UCL_FILE_NOT_FOUND",
            StatusCode::FunctionNotFound => "UCL_FUNCTION_NOT_FOUND",
            StatusCode::CompileError => "UCL_COMPILE_ERROR",
            StatusCode::MemoryError => "UCL_MEMORY_ERROR",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> From<&MemResult<T>> for StatusCode {
    fn from(result: &MemResult<T>) -> StatusCode {
        match result {
            Ok(_) => StatusCode::Success,
            Err(e) => e.status(),
        }
    }
}

/// Converts a raw status code to its human-readable name.
///
/// # Examples:
///
/// ```
/// use unimem::error::status_string;
///
/// assert_eq!("UCL_MEMORY_ERROR", status_string(5));
/// assert_eq!("Unknown", status_string(42));
/// ```
pub fn status_string(code: i32) -> &'static str {
    StatusCode::from_raw(code).map_or("Unknown", StatusCode::as_str)
}

#[cfg(feature = "cuda")]
pub(crate) trait ToResult {
    fn to_result(self) -> MemResult<()>;
}

#[cfg(feature = "cuda")]
impl ToResult for cuda_driver_sys::cudaError_enum {
    fn to_result(self) -> MemResult<()> {
        use cuda_driver_sys::cudaError_enum as raw;
        match self {
            raw::CUDA_SUCCESS => Ok(()),
            raw::CUDA_ERROR_OUT_OF_MEMORY => Err(MemError::AllocationError { bytes: 0 }),
            raw::CUDA_ERROR_INVALID_DEVICE => {
                Err(MemError::InvalidDeviceIndex { index: 0, count: 0 })
            }
            raw::CUDA_ERROR_NO_DEVICE => Err(MemError::NoDeviceFound),
            other => Err(MemError::Backend { code: other as i32 }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_strings_cover_the_code_space() {
        assert_eq!("UCL_SUCCESS", status_string(0));
        assert_eq!("UCL_ERROR", status_string(1));
        assert_eq!("UCL_FILE_NOT_FOUND", status_string(2));
        assert_eq!("UCL_FUNCTION_NOT_FOUND", status_string(3));
        assert_eq!("UCL_COMPILE_ERROR", status_string(4));
        assert_eq!("UCL_MEMORY_ERROR", status_string(5));
        assert_eq!("Unknown", status_string(-1));
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(
            StatusCode::MemoryError,
            MemError::AllocationError { bytes: 8 }.status()
        );
        assert_eq!(StatusCode::MemoryError, MemError::ResizeFailure.status());
        assert_eq!(StatusCode::GenericError, MemError::TransferError.status());

        let ok: MemResult<()> = Ok(());
        assert_eq!(StatusCode::Success, StatusCode::from(&ok));
        assert_eq!("UCL_SUCCESS", StatusCode::from(&ok).to_string());
    }
}
