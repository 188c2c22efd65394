//! CUDA driver API backend.
//!
//! Every device gets its own `CUcontext`. Calls that need a current context push it for the
//! duration of the call and pop it again, so nothing here depends on which context the calling
//! thread had current before. Copies go through `cuMemcpy`, relying on unified virtual
//! addressing to tell host from device pointers.
//!
//! Host memory placements map onto the driver as follows:
//!
//! - `Default` and `NotPinned`: ordinary pageable Rust allocations;
//! - `Pinned`: `cuMemHostAlloc` with `CU_MEMHOSTALLOC_PORTABLE`;
//! - `Mapped`: `cuMemHostAlloc` with `CU_MEMHOSTALLOC_PORTABLE | CU_MEMHOSTALLOC_DEVICEMAP`.

use crate::backend::{Context, DeviceProperties, MemPtr, QueueId, Runtime};
use crate::error::{MemError, MemResult, ToResult};
use crate::memory::{DevicePointer, Placement};
use crate::stream::QueueFlags;
use cuda_driver_sys as cuda;
use cuda_driver_sys::CUdevice_attribute as Attr;
use cuda_driver_sys::{CUcontext, CUdevice, CUdeviceptr, CUstream};
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, error};

const MEMHOSTALLOC_PORTABLE: u32 = 0x01;
const MEMHOSTALLOC_DEVICEMAP: u32 = 0x02;
const STREAM_NON_BLOCKING: u32 = 0x01;
const HOST_ALIGNMENT: usize = 256;

fn attribute(device: CUdevice, attr: Attr) -> MemResult<i32> {
    let mut value: c_int = 0;
    unsafe { cuda::cuDeviceGetAttribute(&mut value, attr, device) }.to_result()?;
    Ok(value)
}

// Cores per multiprocessor, by compute capability.
fn cores_per_multiprocessor(major: u32, minor: u32) -> u32 {
    match (major, minor) {
        (1, _) => 8,
        (2, 0) => 32,
        (2, _) => 48,
        (3, _) => 192,
        (5, _) => 128,
        (6, 0) => 64,
        (6, _) => 128,
        (7, _) => 64,
        (8, 0) => 64,
        (8, _) => 128,
        _ => 128,
    }
}

/// Runtime of the CUDA driver API.
#[derive(Debug)]
pub struct CudaRuntime {
    _private: (),
}

impl CudaRuntime {
    /// Initialize the driver.
    pub fn new() -> MemResult<Self> {
        unsafe { cuda::cuInit(0) }.to_result()?;
        Ok(CudaRuntime { _private: () })
    }

    fn properties(ordinal: c_int) -> MemResult<DeviceProperties> {
        let mut device: CUdevice = 0;
        unsafe { cuda::cuDeviceGet(&mut device, ordinal) }.to_result()?;

        let mut name = [0 as c_char; 256];
        unsafe { cuda::cuDeviceGetName(name.as_mut_ptr(), name.len() as c_int, device) }
            .to_result()?;
        let name = unsafe { CStr::from_ptr(name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let mut total_memory: usize = 0;
        unsafe { cuda::cuDeviceTotalMem_v2(&mut total_memory, device) }.to_result()?;

        let get = |attr| attribute(device, attr);
        let major = get(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)? as u32;
        let minor = get(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)? as u32;
        let multiprocessors = get(Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)? as u32;
        let integrated = get(Attr::CU_DEVICE_ATTRIBUTE_INTEGRATED)? != 0;
        let can_map = get(Attr::CU_DEVICE_ATTRIBUTE_CAN_MAP_HOST_MEMORY)? != 0;

        Ok(DeviceProperties {
            name,
            total_memory: total_memory as u64,
            compute_capability: (major, minor),
            multiprocessors,
            cores: multiprocessors * cores_per_multiprocessor(major, minor),
            clock_rate_khz: get(Attr::CU_DEVICE_ATTRIBUTE_CLOCK_RATE)? as u32,
            max_threads_per_block: get(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)? as u32,
            shared_memory: integrated && can_map,
            concurrent_copy: get(Attr::CU_DEVICE_ATTRIBUTE_GPU_OVERLAP)? != 0,
        })
    }
}

impl Runtime for CudaRuntime {
    fn platform_name(&self) -> String {
        "NVIDIA Corporation NVIDIA CUDA Driver".to_string()
    }

    fn devices(&self) -> MemResult<Vec<DeviceProperties>> {
        let mut count: c_int = 0;
        unsafe { cuda::cuDeviceGetCount(&mut count) }.to_result()?;
        (0..count).map(CudaRuntime::properties).collect()
    }

    fn open(&self, index: usize) -> MemResult<Arc<dyn Context>> {
        let mut count: c_int = 0;
        unsafe { cuda::cuDeviceGetCount(&mut count) }.to_result()?;
        if index >= count as usize {
            return Err(MemError::InvalidDeviceIndex {
                index,
                count: count as usize,
            });
        }
        let mut device: CUdevice = 0;
        unsafe { cuda::cuDeviceGet(&mut device, index as c_int) }.to_result()?;

        let mut raw: CUcontext = ptr::null_mut();
        // CU_CTX_MAP_HOST, so mapped host allocations get device addresses.
        unsafe { cuda::cuCtxCreate_v2(&mut raw, 0x08, device) }.to_result()?;
        let mut previous: CUcontext = ptr::null_mut();
        unsafe { cuda::cuCtxPopCurrent_v2(&mut previous) }.to_result()?;
        debug!(index, "created CUDA context");

        Ok(Arc::new(CudaContext {
            index,
            raw,
            streams: Mutex::new(HashMap::new()),
            next_stream: Mutex::new(1),
        }))
    }
}

/// A CUDA context on one device.
#[derive(Debug)]
pub struct CudaContext {
    index: usize,
    raw: CUcontext,
    streams: Mutex<HashMap<QueueId, usize>>,
    next_stream: Mutex<u64>,
}

// The driver API is thread-safe; contexts may be made current on any thread.
unsafe impl Send for CudaContext {}
unsafe impl Sync for CudaContext {}

impl CudaContext {
    fn with_current<T, F: FnOnce() -> MemResult<T>>(&self, f: F) -> MemResult<T> {
        unsafe { cuda::cuCtxPushCurrent_v2(self.raw) }.to_result()?;
        let result = f();
        let mut popped: CUcontext = ptr::null_mut();
        unsafe { cuda::cuCtxPopCurrent_v2(&mut popped) }.to_result()?;
        result
    }

    fn stream(&self, queue: QueueId) -> MemResult<CUstream> {
        if queue == QueueId::DEFAULT {
            return Ok(ptr::null_mut());
        }
        self.streams
            .lock()
            .get(&queue)
            .map(|&s| s as CUstream)
            .ok_or(MemError::Backend { code: -3 })
    }

    fn address(p: MemPtr) -> CUdeviceptr {
        match p {
            MemPtr::Host(p) => p as usize as CUdeviceptr,
            MemPtr::Device(p) => p.address() as CUdeviceptr,
        }
    }

    fn host_layout(bytes: usize) -> MemResult<Layout> {
        Layout::from_size_align(bytes, HOST_ALIGNMENT)
            .map_err(|_| MemError::AllocationError { bytes })
    }
}

impl Context for CudaContext {
    fn device_index(&self) -> usize {
        self.index
    }

    unsafe fn alloc_host(&self, bytes: usize, placement: Placement) -> MemResult<*mut u8> {
        let flags = match placement {
            Placement::Pinned => MEMHOSTALLOC_PORTABLE,
            Placement::Mapped => MEMHOSTALLOC_PORTABLE | MEMHOSTALLOC_DEVICEMAP,
            Placement::View => return Err(MemError::InvalidPlacement),
            Placement::Default | Placement::NotPinned => {
                let ptr = alloc::alloc(Self::host_layout(bytes)?);
                return if ptr.is_null() {
                    Err(MemError::AllocationError { bytes })
                } else {
                    Ok(ptr)
                };
            }
        };
        self.with_current(|| {
            let mut ptr: *mut c_void = ptr::null_mut();
            cuda::cuMemHostAlloc(&mut ptr, bytes, flags)
                .to_result()
                .map_err(|_| MemError::AllocationError { bytes })?;
            Ok(ptr as *mut u8)
        })
    }

    unsafe fn free_host(&self, ptr: *mut u8, bytes: usize, placement: Placement) -> MemResult<()> {
        if placement.is_page_locked() {
            self.with_current(|| cuda::cuMemFreeHost(ptr as *mut c_void).to_result())
        } else {
            alloc::dealloc(ptr, Self::host_layout(bytes)?);
            Ok(())
        }
    }

    unsafe fn alloc_device(&self, bytes: usize) -> MemResult<DevicePointer<u8>> {
        self.with_current(|| {
            let mut ptr: CUdeviceptr = 0;
            cuda::cuMemAlloc_v2(&mut ptr, bytes)
                .to_result()
                .map_err(|_| MemError::AllocationError { bytes })?;
            Ok(DevicePointer::from_address(ptr as u64))
        })
    }

    unsafe fn free_device(&self, ptr: DevicePointer<u8>, _bytes: usize) -> MemResult<()> {
        self.with_current(|| cuda::cuMemFree_v2(ptr.address() as CUdeviceptr).to_result())
    }

    fn can_map_host(&self, placement: Placement) -> bool {
        placement.is_page_locked()
    }

    unsafe fn map_host(&self, ptr: *mut u8, placement: Placement) -> MemResult<DevicePointer<u8>> {
        if !self.can_map_host(placement) {
            return Err(MemError::InvalidPlacement);
        }
        self.with_current(|| {
            let mut dptr: CUdeviceptr = 0;
            cuda::cuMemHostGetDevicePointer_v2(&mut dptr, ptr as *mut c_void, 0)
                .to_result()
                .map_err(|_| MemError::InvalidPlacement)?;
            Ok(DevicePointer::from_address(dptr as u64))
        })
    }

    fn create_queue(&self, flags: QueueFlags) -> MemResult<QueueId> {
        let raw_flags = if flags.contains(QueueFlags::NON_BLOCKING) {
            STREAM_NON_BLOCKING
        } else {
            0
        };
        let stream = self.with_current(|| {
            let mut stream: CUstream = ptr::null_mut();
            unsafe { cuda::cuStreamCreate(&mut stream, raw_flags) }.to_result()?;
            Ok(stream)
        })?;
        let id = {
            let mut next = self.next_stream.lock();
            let id = QueueId(*next);
            *next += 1;
            id
        };
        let _ = self.streams.lock().insert(id, stream as usize);
        Ok(id)
    }

    fn destroy_queue(&self, queue: QueueId) -> MemResult<()> {
        if queue == QueueId::DEFAULT {
            return Err(MemError::Backend { code: -2 });
        }
        let stream = self.stream(queue)?;
        self.with_current(|| unsafe { cuda::cuStreamDestroy_v2(stream) }.to_result())?;
        let _ = self.streams.lock().remove(&queue);
        Ok(())
    }

    fn synchronize(&self, queue: QueueId) -> MemResult<()> {
        let stream = self.stream(queue)?;
        self.with_current(|| unsafe { cuda::cuStreamSynchronize(stream) }.to_result())
    }

    unsafe fn copy(
        &self,
        dst: MemPtr,
        src: MemPtr,
        bytes: usize,
        queue: Option<QueueId>,
    ) -> MemResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let (d, s) = (Self::address(dst), Self::address(src));
        match queue {
            None => self.with_current(|| cuda::cuMemcpy(d, s, bytes).to_result()),
            Some(q) => {
                let stream = self.stream(q)?;
                self.with_current(|| cuda::cuMemcpyAsync(d, s, bytes, stream).to_result())
            }
        }
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        let streams: Vec<usize> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            let result = self.with_current(|| unsafe {
                cuda::cuStreamDestroy_v2(stream as CUstream).to_result()
            });
            if let Err(e) = result {
                error!(error = %e, "failed to destroy CUDA stream");
            }
        }
        if let Err(e) = unsafe { cuda::cuCtxDestroy_v2(self.raw) }.to_result() {
            error!(device = self.index, error = %e, "failed to destroy CUDA context");
        }
    }
}
