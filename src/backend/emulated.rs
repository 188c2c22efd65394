//! A host-resident model of an accelerator.
//!
//! The emulated backend keeps "device" memory in ordinary host allocations and executes every
//! transfer on the calling thread. It honours the parts of the device model that the rest of the
//! crate relies on: per-device memory budgets, shared-memory capability, queue bookkeeping and
//! allocation accounting. Asynchronous copies complete eagerly but are still counted as pending
//! work on their queue until that queue is synchronized.
//!
//! Devices are described by an [`EmulatorConfig`](struct.EmulatorConfig.html), which can be
//! loaded from TOML:
//!
//! ```
//! use unimem::backend::emulated::EmulatorConfig;
//!
//! let config = EmulatorConfig::from_toml_str(r#"
//!     platform_name = "Test Platform"
//!
//!     [[devices]]
//!     name = "Integrated"
//!     total_memory = 1048576
//!     compute_capability = [7, 2]
//!     multiprocessors = 4
//!     cores = 256
//!     clock_rate_khz = 1100000
//!     max_threads_per_block = 1024
//!     shared_memory = true
//! "#).unwrap();
//! assert_eq!(1, config.devices.len());
//! assert!(config.devices[0].shared_memory);
//! ```

use crate::backend::{Context, DeviceProperties, MemPtr, QueueId, Runtime};
use crate::error::{MemError, MemResult};
use crate::memory::{DevicePointer, Placement};
use crate::stream::QueueFlags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Alignment of every emulated allocation, matching typical device allocation granularity.
const ALIGNMENT: usize = 256;

/// Description of the devices an [`EmulatedRuntime`](struct.EmulatedRuntime.html) exposes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Reported platform name.
    #[serde(default = "default_platform_name")]
    pub platform_name: String,
    /// One entry per emulated device. `total_memory` doubles as the device allocation budget.
    #[serde(default)]
    pub devices: Vec<DeviceProperties>,
}

fn default_platform_name() -> String {
    "unimem emulated accelerator".to_string()
}

impl EmulatorConfig {
    /// A configuration with no devices at all.
    pub fn empty() -> Self {
        EmulatorConfig {
            platform_name: default_platform_name(),
            devices: vec![],
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Add a device, builder style.
    pub fn with_device(mut self, properties: DeviceProperties) -> Self {
        self.devices.push(properties);
        self
    }

    /// An emulated device with the given name, memory budget and shared-memory capability.
    pub fn device(name: &str, total_memory: u64, shared_memory: bool) -> DeviceProperties {
        DeviceProperties {
            name: name.to_string(),
            total_memory,
            compute_capability: (7, 0),
            multiprocessors: 8,
            cores: 512,
            clock_rate_khz: 1_500_000,
            max_threads_per_block: 1024,
            shared_memory,
            concurrent_copy: true,
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig::empty()
            .with_device(EmulatorConfig::device("Emulated Shared", 1 << 30, true))
            .with_device(EmulatorConfig::device("Emulated Discrete", 1 << 30, false))
    }
}

/// Allocation and transfer counters, summed over every context of a runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatorStats {
    /// Successful host allocations.
    pub host_allocs: usize,
    /// Host frees.
    pub host_frees: usize,
    /// Successful device allocations.
    pub device_allocs: usize,
    /// Device frees.
    pub device_frees: usize,
    /// Frees of pointers that were not live; always zero unless something double-freed.
    pub invalid_frees: usize,
    /// Device bytes currently allocated across all contexts.
    pub device_bytes_in_use: u64,
    /// Copies issued to a queue rather than performed blocking.
    pub queued_copies: usize,
    /// Blocking copies.
    pub blocking_copies: usize,
}

impl EmulatorStats {
    /// Host allocations not yet freed.
    pub fn live_host(&self) -> usize {
        self.host_allocs - self.host_frees
    }

    /// Device allocations not yet freed.
    pub fn live_device(&self) -> usize {
        self.device_allocs - self.device_frees
    }
}

#[derive(Debug, Default)]
struct Ledger {
    stats: EmulatorStats,
    live: HashMap<usize, usize>,
}

impl Ledger {
    fn record_alloc(&mut self, ptr: *mut u8, bytes: usize) {
        let _ = self.live.insert(ptr as usize, bytes);
    }

    fn record_free(&mut self, ptr: *mut u8, bytes: usize) -> MemResult<()> {
        // A size mismatch leaves the entry live so the block can still be released correctly.
        match self.live.get(&(ptr as usize)) {
            Some(&size) if size == bytes => {
                let _ = self.live.remove(&(ptr as usize));
                Ok(())
            }
            _ => {
                self.stats.invalid_frees += 1;
                Err(MemError::Backend { code: -1 })
            }
        }
    }
}

/// Runtime of the emulated backend.
#[derive(Debug, Clone)]
pub struct EmulatedRuntime {
    config: EmulatorConfig,
    ledger: Arc<Mutex<Ledger>>,
}

impl EmulatedRuntime {
    /// Create a runtime exposing the devices described by `config`.
    pub fn new(config: EmulatorConfig) -> Self {
        EmulatedRuntime {
            config,
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    /// Snapshot of the allocation counters.
    pub fn stats(&self) -> EmulatorStats {
        self.ledger.lock().stats
    }
}

impl Default for EmulatedRuntime {
    fn default() -> Self {
        EmulatedRuntime::new(EmulatorConfig::default())
    }
}

impl Runtime for EmulatedRuntime {
    fn platform_name(&self) -> String {
        self.config.platform_name.clone()
    }

    fn devices(&self) -> MemResult<Vec<DeviceProperties>> {
        Ok(self.config.devices.clone())
    }

    fn open(&self, index: usize) -> MemResult<Arc<dyn Context>> {
        let properties = self
            .config
            .devices
            .get(index)
            .cloned()
            .ok_or(MemError::InvalidDeviceIndex {
                index,
                count: self.config.devices.len(),
            })?;
        debug!(index, name = %properties.name, "opening emulated context");
        Ok(Arc::new(EmulatedContext {
            index,
            properties,
            ledger: self.ledger.clone(),
            state: Mutex::new(ContextState {
                device_bytes: 0,
                next_queue: 1,
                queues: [(QueueId::DEFAULT, 0)].iter().cloned().collect(),
            }),
        }))
    }
}

#[derive(Debug)]
struct ContextState {
    device_bytes: u64,
    next_queue: u64,
    // Pending work per live queue.
    queues: HashMap<QueueId, usize>,
}

/// A context on one emulated device.
#[derive(Debug)]
pub struct EmulatedContext {
    index: usize,
    properties: DeviceProperties,
    ledger: Arc<Mutex<Ledger>>,
    state: Mutex<ContextState>,
}

impl EmulatedContext {
    fn layout(bytes: usize) -> MemResult<Layout> {
        Layout::from_size_align(bytes, ALIGNMENT).map_err(|_| MemError::AllocationError { bytes })
    }

    unsafe fn raw_alloc(bytes: usize) -> MemResult<*mut u8> {
        let ptr = alloc::alloc_zeroed(Self::layout(bytes)?);
        if ptr.is_null() {
            Err(MemError::AllocationError { bytes })
        } else {
            Ok(ptr)
        }
    }

    fn address(p: MemPtr) -> *mut u8 {
        match p {
            MemPtr::Host(p) => p,
            MemPtr::Device(p) => p.as_raw_mut(),
        }
    }
}

impl Context for EmulatedContext {
    fn device_index(&self) -> usize {
        self.index
    }

    unsafe fn alloc_host(&self, bytes: usize, placement: Placement) -> MemResult<*mut u8> {
        if placement.is_view() {
            return Err(MemError::InvalidPlacement);
        }
        let ptr = Self::raw_alloc(bytes)?;
        let mut ledger = self.ledger.lock();
        ledger.record_alloc(ptr, bytes);
        ledger.stats.host_allocs += 1;
        trace!(bytes, ?placement, "emulated host allocation");
        Ok(ptr)
    }

    unsafe fn free_host(&self, ptr: *mut u8, bytes: usize, _placement: Placement) -> MemResult<()> {
        {
            let mut ledger = self.ledger.lock();
            ledger.record_free(ptr, bytes)?;
            ledger.stats.host_frees += 1;
        }
        alloc::dealloc(ptr, Self::layout(bytes)?);
        Ok(())
    }

    unsafe fn alloc_device(&self, bytes: usize) -> MemResult<DevicePointer<u8>> {
        let mut state = self.state.lock();
        let fits = state
            .device_bytes
            .checked_add(bytes as u64)
            .map_or(false, |total| total <= self.properties.total_memory);
        if !fits {
            debug!(
                bytes,
                in_use = state.device_bytes,
                budget = self.properties.total_memory,
                "emulated device out of memory"
            );
            return Err(MemError::AllocationError { bytes });
        }
        let ptr = Self::raw_alloc(bytes)?;
        state.device_bytes += bytes as u64;
        let mut ledger = self.ledger.lock();
        ledger.record_alloc(ptr, bytes);
        ledger.stats.device_allocs += 1;
        ledger.stats.device_bytes_in_use += bytes as u64;
        Ok(DevicePointer::wrap(ptr))
    }

    unsafe fn free_device(&self, ptr: DevicePointer<u8>, bytes: usize) -> MemResult<()> {
        let raw = ptr.as_raw_mut();
        {
            let mut ledger = self.ledger.lock();
            ledger.record_free(raw, bytes)?;
            ledger.stats.device_frees += 1;
            ledger.stats.device_bytes_in_use -= bytes as u64;
        }
        self.state.lock().device_bytes -= bytes as u64;
        alloc::dealloc(raw, Self::layout(bytes)?);
        Ok(())
    }

    fn can_map_host(&self, placement: Placement) -> bool {
        self.properties.shared_memory || placement == Placement::Mapped
    }

    unsafe fn map_host(&self, ptr: *mut u8, placement: Placement) -> MemResult<DevicePointer<u8>> {
        if self.can_map_host(placement) {
            Ok(DevicePointer::wrap(ptr))
        } else {
            Err(MemError::InvalidPlacement)
        }
    }

    fn create_queue(&self, _flags: QueueFlags) -> MemResult<QueueId> {
        let mut state = self.state.lock();
        let id = QueueId(state.next_queue);
        state.next_queue += 1;
        let _ = state.queues.insert(id, 0);
        Ok(id)
    }

    fn destroy_queue(&self, queue: QueueId) -> MemResult<()> {
        if queue == QueueId::DEFAULT {
            return Err(MemError::Backend { code: -2 });
        }
        match self.state.lock().queues.remove(&queue) {
            Some(_) => Ok(()),
            None => Err(MemError::Backend { code: -3 }),
        }
    }

    fn synchronize(&self, queue: QueueId) -> MemResult<()> {
        match self.state.lock().queues.get_mut(&queue) {
            Some(pending) => {
                *pending = 0;
                Ok(())
            }
            None => Err(MemError::Backend { code: -3 }),
        }
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
        if d.is_null() || s.is_null() {
            return Err(MemError::TransferError);
        }
        match queue {
            Some(q) => {
                match self.state.lock().queues.get_mut(&q) {
                    Some(pending) => *pending += 1,
                    None => return Err(MemError::TransferError),
                }
                self.ledger.lock().stats.queued_copies += 1;
            }
            None => self.ledger.lock().stats.blocking_copies += 1,
        }
        // Zero-copy views make source and destination the same memory.
        if d != s {
            ptr::copy_nonoverlapping(s as *const u8, d, bytes);
        }
        Ok(())
    }
}
