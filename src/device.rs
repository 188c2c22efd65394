//! Functions and types for enumerating devices and managing the active one.
//!
//! A [`Device`](struct.Device.html) is the handle every allocation and transfer goes through.
//! It caches the properties of all devices the runtime reports, holds the context of the
//! selected device and owns that device's command queues. Queue 0 is the default queue of the
//! context; it exists whenever a device is selected and is never popped.

use crate::backend::{Context, DeviceProperties, Runtime};
use crate::error::{MemError, MemResult};
use crate::stream::{CommandQueue, QueueFlags};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle to the accelerator devices of one runtime.
///
/// # Examples:
///
/// ```
/// use unimem::backend::emulated::EmulatedRuntime;
/// use unimem::Device;
///
/// let mut device = Device::enumerate(EmulatedRuntime::default()).unwrap();
/// device.check_available().unwrap();
/// assert_eq!(0, device.queue_count());
///
/// device.select(0).unwrap();
/// assert_eq!(1, device.queue_count());
/// assert!(device.supports_shared_memory());
/// ```
#[derive(Debug)]
pub struct Device {
    runtime: Arc<dyn Runtime>,
    properties: Vec<DeviceProperties>,
    active: Option<usize>,
    context: Option<Arc<dyn Context>>,
    queues: Vec<CommandQueue>,
}

impl Device {
    /// Query the runtime for every visible device.
    ///
    /// Finding zero devices is not an error here: the handle is constructed, a warning is
    /// logged and [`check_available`](#method.check_available) reports the condition.
    pub fn enumerate<R: Runtime + 'static>(runtime: R) -> MemResult<Device> {
        Device::with_runtime(Arc::new(runtime))
    }

    /// Like [`enumerate`](#method.enumerate), for a runtime that is already shared.
    pub fn with_runtime(runtime: Arc<dyn Runtime>) -> MemResult<Device> {
        let properties = runtime.devices()?;
        if properties.is_empty() {
            warn!(platform = %runtime.platform_name(), "no accelerator devices found");
        } else {
            debug!(count = properties.len(), "enumerated devices");
        }
        Ok(Device {
            runtime,
            properties,
            active: None,
            context: None,
            queues: Vec::new(),
        })
    }

    /// Returns `NoDeviceFound` if the runtime reported no devices.
    pub fn check_available(&self) -> MemResult<()> {
        if self.properties.is_empty() {
            Err(MemError::NoDeviceFound)
        } else {
            Ok(())
        }
    }

    /// Make the device at `index` the active one.
    ///
    /// Selecting the already active device does nothing. Otherwise the additional queues of the
    /// previous device are destroyed, a context is opened on the new device and its default
    /// queue is installed. Memory allocated on the previous device stays valid.
    ///
    /// # Errors:
    ///
    /// `InvalidDeviceIndex` if `index >= num_devices()`. The handle is unchanged in that case.
    pub fn select(&mut self, index: usize) -> MemResult<()> {
        if self.active == Some(index) {
            return Ok(());
        }
        if index >= self.properties.len() {
            return Err(MemError::InvalidDeviceIndex {
                index,
                count: self.properties.len(),
            });
        }
        while self.queues.len() > 1 {
            self.pop_queue()?;
        }
        let context = self.runtime.open(index)?;
        self.queues.clear();
        self.queues.push(CommandQueue::default_for(context.clone()));
        self.context = Some(context);
        self.active = Some(index);
        debug!(index, name = %self.properties[index].name, "selected device");
        Ok(())
    }

    /// Create an additional command queue on the active device.
    pub fn push_queue(&mut self) -> MemResult<()> {
        self.push_queue_with(QueueFlags::DEFAULT)
    }

    /// Create an additional command queue with the given flags.
    pub fn push_queue_with(&mut self, flags: QueueFlags) -> MemResult<()> {
        let context = self.context()?.clone();
        let queue = CommandQueue::new(context, flags)?;
        debug!(queue = queue.id().0, "pushed command queue");
        self.queues.push(queue);
        Ok(())
    }

    /// Destroy the most recently pushed queue. Does nothing if only the default queue is left.
    pub fn pop_queue(&mut self) -> MemResult<()> {
        if self.queues.len() < 2 {
            return Ok(());
        }
        if let Some(queue) = self.queues.pop() {
            let id = queue.id();
            if let Err((e, queue)) = CommandQueue::drop(queue) {
                self.queues.push(queue);
                return Err(e);
            }
            debug!(queue = id.0, "popped command queue");
        }
        Ok(())
    }

    /// The queue at position `index`; 0 is the default queue.
    pub fn queue(&self, index: usize) -> Option<&CommandQueue> {
        self.queues.get(index)
    }

    /// The default queue of the active device.
    pub fn default_queue(&self) -> MemResult<&CommandQueue> {
        self.queues.first().ok_or(MemError::NoActiveDevice)
    }

    /// Block until every queue of the active device has finished its work.
    pub fn sync(&self) -> MemResult<()> {
        for queue in &self.queues {
            queue.synchronize()?;
        }
        Ok(())
    }

    /// Block until the queue at position `index` has finished its work.
    pub fn sync_queue(&self, index: usize) -> MemResult<()> {
        self.queue(index)
            .ok_or(MemError::NoActiveDevice)?
            .synchronize()
    }

    pub(crate) fn context(&self) -> MemResult<&Arc<dyn Context>> {
        self.context.as_ref().ok_or(MemError::NoActiveDevice)
    }

    fn active_properties(&self) -> Option<&DeviceProperties> {
        self.active.and_then(|i| self.properties.get(i))
    }

    /// Number of devices the runtime reported.
    pub fn num_devices(&self) -> usize {
        self.properties.len()
    }

    /// Index of the active device, if one is selected.
    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    /// Name of the platform the runtime belongs to.
    pub fn platform_name(&self) -> String {
        self.runtime.platform_name()
    }

    /// Cached properties of the device at `index`.
    pub fn properties(&self, index: usize) -> Option<&DeviceProperties> {
        self.properties.get(index)
    }

    /// Number of command queues on the active device, including the default queue. 0 while no
    /// device is selected.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Returns true if the active device can address host memory directly, so that device
    /// containers may be views of host containers.
    pub fn supports_shared_memory(&self) -> bool {
        self.active_properties().map_or(false, |p| p.shared_memory)
    }

    /// Returns true if the active device supports double precision arithmetic.
    pub fn supports_double_precision(&self) -> bool {
        self.active_properties()
            .map_or(false, DeviceProperties::double_precision)
    }

    /// Number of cores of the active device.
    pub fn core_count(&self) -> u32 {
        self.active_properties().map_or(0, |p| p.cores)
    }

    /// Global memory of the active device in bytes.
    pub fn total_memory(&self) -> u64 {
        self.active_properties().map_or(0, |p| p.total_memory)
    }

    /// Compute capability of the active device as (major, minor).
    pub fn compute_capability(&self) -> Option<(u32, u32)> {
        self.active_properties().map(|p| p.compute_capability)
    }

    /// Name of the active device.
    pub fn name(&self) -> Option<&str> {
        self.active_properties().map(|p| p.name.as_str())
    }

    /// Clock rate of the active device in GHz.
    pub fn clock_rate(&self) -> Option<f64> {
        self.active_properties().map(DeviceProperties::clock_rate_ghz)
    }

    /// Maximum number of threads per block of the active device.
    pub fn max_group_size(&self) -> Option<u32> {
        self.active_properties().map(|p| p.max_threads_per_block)
    }

    /// Write a human-readable description of every device.
    pub fn write_summary<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        if self.properties.is_empty() {
            return writeln!(out, "There is no device supporting {}", self.platform_name());
        }
        for (i, p) in self.properties.iter().enumerate() {
            let kind = if p.shared_memory {
                "Integrated"
            } else {
                "Discrete"
            };
            writeln!(out, "\nDevice {}: \"{}\"", i, p.name)?;
            writeln!(out, "  Type of device:                                 {}", kind)?;
            writeln!(
                out,
                "  Compute capability:                             {:.1}",
                p.compute_capability_f64()
            )?;
            writeln!(
                out,
                "  Double precision support:                       {}",
                yes_no(p.double_precision())
            )?;
            writeln!(
                out,
                "  Total amount of global memory:                  {:.2} GB",
                p.gigabytes()
            )?;
            writeln!(
                out,
                "  Number of compute units/multiprocessors:        {}",
                p.multiprocessors
            )?;
            writeln!(
                out,
                "  Number of cores:                                {}",
                p.cores
            )?;
            writeln!(
                out,
                "  Maximum number of threads per block:            {}",
                p.max_threads_per_block
            )?;
            writeln!(
                out,
                "  Clock rate:                                     {:.2} GHz",
                p.clock_rate_ghz()
            )?;
            writeln!(
                out,
                "  Shared host memory:                             {}",
                yes_no(p.shared_memory)
            )?;
            writeln!(
                out,
                "  Concurrent copy and execution:                  {}",
                yes_no(p.concurrent_copy)
            )?;
        }
        Ok(())
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "Yes"
    } else {
        "No"
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Non-default queues go first; the default queue is dropped with the vector.
        while self.queues.len() > 1 {
            if let Some(queue) = self.queues.pop() {
                drop(queue);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::emulated::{EmulatedRuntime, EmulatorConfig};

    #[test]
    fn zero_devices_is_reported_not_fatal() {
        let mut device = Device::enumerate(EmulatedRuntime::new(EmulatorConfig::empty())).unwrap();
        assert_eq!(0, device.num_devices());
        assert_eq!(Err(MemError::NoDeviceFound), device.check_available());
        assert_eq!(
            Err(MemError::InvalidDeviceIndex { index: 0, count: 0 }),
            device.select(0)
        );
        assert_eq!(None, device.active_index());

        let mut summary = Vec::new();
        device.write_summary(&mut summary).unwrap();
        let summary = String::from_utf8(summary).unwrap();
        assert!(summary.starts_with("There is no device supporting"));
    }

    #[test]
    fn select_installs_default_queue() {
        let mut device = crate::quick_init().unwrap();
        assert_eq!(Some(0), device.active_index());
        assert_eq!(1, device.queue_count());
        assert!(device.default_queue().unwrap().is_default());

        device.select(1).unwrap();
        assert_eq!(1, device.queue_count());
        assert!(!device.supports_shared_memory());
        assert_eq!(Some("Emulated Discrete"), device.name());
    }

    #[test]
    fn select_same_index_keeps_queues() {
        let mut device = crate::quick_init().unwrap();
        device.push_queue().unwrap();
        device.push_queue().unwrap();
        let id = device.queue(2).unwrap().id();
        device.select(0).unwrap();
        device.select(0).unwrap();
        assert_eq!(3, device.queue_count());
        assert_eq!(id, device.queue(2).unwrap().id());
    }

    #[test]
    fn switching_devices_releases_queues() {
        let mut device = crate::quick_init().unwrap();
        device.push_queue_with(QueueFlags::NON_BLOCKING).unwrap();
        let old = device.context().unwrap().clone();
        let id = device.queue(1).unwrap().id();
        device.select(1).unwrap();
        assert_eq!(1, device.queue_count());
        assert!(old.synchronize(id).is_err());
    }

    #[test]
    fn push_then_pop_restores_queue_count() {
        let mut device = crate::quick_init().unwrap();
        device.pop_queue().unwrap();
        assert_eq!(1, device.queue_count());
        device.push_queue().unwrap();
        assert_eq!(2, device.queue_count());
        device.sync_queue(1).unwrap();
        device.pop_queue().unwrap();
        assert_eq!(1, device.queue_count());
        device.pop_queue().unwrap();
        assert_eq!(1, device.queue_count());
        device.sync().unwrap();
    }

    #[test]
    fn unselected_handle_has_no_queues() {
        let mut device = Device::enumerate(EmulatedRuntime::default()).unwrap();
        assert_eq!(0, device.queue_count());
        assert_eq!(Err(MemError::NoActiveDevice), device.push_queue());
        assert!(device.default_queue().is_err());
        assert!(!device.supports_double_precision());
        assert_eq!(0, device.core_count());
    }

    #[test]
    fn capability_predicates_read_cached_properties() {
        let device = crate::quick_init().unwrap();
        assert!(device.supports_shared_memory());
        assert!(device.supports_double_precision());
        assert_eq!(512, device.core_count());
        assert_eq!(1 << 30, device.total_memory());
        assert_eq!(Some((7, 0)), device.compute_capability());
        assert_eq!(Some(1024), device.max_group_size());
        assert_eq!(2, device.num_devices());
        assert!(!device.properties(1).unwrap().shared_memory);
    }

    #[test]
    fn summary_lists_every_device() {
        let device = crate::quick_init().unwrap();
        let mut summary = Vec::new();
        device.write_summary(&mut summary).unwrap();
        let summary = String::from_utf8(summary).unwrap();
        assert!(summary.contains("Device 0: \"Emulated Shared\""));
        assert!(summary.contains("Device 1: \"Emulated Discrete\""));
        assert!(summary.contains("Integrated"));
    }
}
