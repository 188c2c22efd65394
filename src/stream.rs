//! Command queues (streams of work) for the device to perform.
//!
//! Most device work is performed asynchronously. Memory copies can be scheduled by the host and
//! performed when the device is ready. Scheduling this work is done using a command queue.
//!
//! Each task in a queue is performed in the order it was scheduled, and tasks within a queue
//! cannot overlap. Tasks scheduled in different queues may interleave or execute concurrently;
//! the only way to order work across queues is for the host to synchronize one of them.
//! Finally, the host can wait for all work scheduled in a queue to be completed.
//!
//! Queues are owned by a [`Device`](../device/struct.Device.html). Every context has a default
//! queue which always exists; additional queues are created with
//! [`Device::push_queue`](../device/struct.Device.html#method.push_queue).

use crate::backend::{Context, QueueId};
use crate::error::{DropResult, MemResult};
use std::fmt;
use std::sync::Arc;
use tracing::error;

bitflags! {
    /// Bit flags for configuring a command queue.
    pub struct QueueFlags: u32 {
        /// No flags set.
        const DEFAULT = 0x00;

        /// This queue does not synchronize with the default queue.
        ///
        /// Work on other queues may not be executed concurrently with work on the default queue
        /// unless this flag is set. Backends without an implicitly synchronizing default queue
        /// ignore it.
        const NON_BLOCKING = 0x01;
    }
}

/// A queue of work for the device to perform.
///
/// See the module-level documentation for more information.
pub struct CommandQueue {
    id: QueueId,
    context: Arc<dyn Context>,
    live: bool,
}

impl CommandQueue {
    /// Wrap the default queue of `context`. Dropping it does not destroy anything.
    pub(crate) fn default_for(context: Arc<dyn Context>) -> CommandQueue {
        CommandQueue {
            id: QueueId::DEFAULT,
            context,
            live: true,
        }
    }

    /// Create a new queue in `context`.
    pub(crate) fn new(context: Arc<dyn Context>, flags: QueueFlags) -> MemResult<CommandQueue> {
        let id = context.create_queue(flags)?;
        Ok(CommandQueue {
            id,
            context,
            live: true,
        })
    }

    /// The backend identifier of this queue.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Returns true if this is the default queue of its context.
    pub fn is_default(&self) -> bool {
        self.id == QueueId::DEFAULT
    }

    pub(crate) fn context(&self) -> &Arc<dyn Context> {
        &self.context
    }

    /// Wait until a queue's tasks are completed.
    ///
    /// Waits until the device has completed all operations scheduled for this queue.
    ///
    /// # Examples:
    ///
    /// ```
    /// # use unimem::*;
    /// let mut device = quick_init().unwrap();
    /// device.push_queue().unwrap();
    ///
    /// // ... queue up some work on the queue
    ///
    /// // Wait for the work to be completed.
    /// device.queue(1).unwrap().synchronize().unwrap();
    /// ```
    pub fn synchronize(&self) -> MemResult<()> {
        self.context().synchronize(self.id)
    }

    /// Destroy a `CommandQueue`, returning an error.
    ///
    /// Destroying a queue can return errors from previous asynchronous work. This function
    /// destroys the given queue and returns the error and the un-destroyed queue on failure.
    /// Dropping the default queue always succeeds and destroys nothing.
    pub fn drop(mut queue: CommandQueue) -> DropResult<CommandQueue> {
        if queue.is_default() || !queue.live {
            return Ok(());
        }
        match queue.context.destroy_queue(queue.id) {
            Ok(()) => {
                queue.live = false;
                Ok(())
            }
            Err(e) => Err((e, queue)),
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("device", &self.context.device_index())
            .finish()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if self.is_default() || !self.live {
            return;
        }
        self.live = false;
        if let Err(e) = self.context.destroy_queue(self.id) {
            error!(queue = self.id.0, error = %e, "failed to destroy command queue");
        }
    }
}
