use crate::backend::{Context, MemPtr, QueueId};
use crate::error::{MemError, MemResult};
use crate::memory::{Cast, DeviceCopy, HostBuffer, Memory, Shape};
use crate::stream::CommandQueue;
use std::mem;
use std::sync::Arc;
use tracing::trace;

/// Which part of the containers a transfer covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extent {
    /// Every element. Source and destination must hold the same number of elements.
    All,
    /// The first `n` elements of both containers.
    Cols(usize),
    /// The top-left `rows` x `cols` block of two row-major containers whose row pitches are
    /// their own column counts.
    Block {
        /// Number of rows to copy.
        rows: usize,
        /// Number of columns to copy from each row.
        cols: usize,
    },
}

impl Default for Extent {
    fn default() -> Self {
        Extent::All
    }
}

impl From<usize> for Extent {
    fn from(cols: usize) -> Extent {
        Extent::Cols(cols)
    }
}

impl From<(usize, usize)> for Extent {
    fn from((rows, cols): (usize, usize)) -> Extent {
        Extent::Block { rows, cols }
    }
}

/// How a transfer is executed.
#[derive(Clone, Copy, Debug)]
pub enum Transfer<'a> {
    /// Return only once the transfer has completed.
    Blocking,
    /// Issue on the default queue of the memory's context and return immediately.
    Async,
    /// Issue on the given queue and return immediately.
    On(&'a CommandQueue),
}

impl<'a> Transfer<'a> {
    /// Returns true unless the transfer is blocking.
    pub fn is_async(&self) -> bool {
        match self {
            Transfer::Blocking => false,
            _ => true,
        }
    }

    fn queue(&self) -> Option<QueueId> {
        match self {
            Transfer::Blocking => None,
            Transfer::Async => Some(QueueId::DEFAULT),
            Transfer::On(queue) => Some(queue.id()),
        }
    }

    /// Block until the work this transfer was issued to has completed.
    pub(crate) fn wait(&self, context: &Arc<dyn Context>) -> MemResult<()> {
        match self {
            Transfer::Blocking => Ok(()),
            Transfer::Async => context.synchronize(QueueId::DEFAULT),
            Transfer::On(queue) => queue.synchronize(),
        }
    }
}

impl Default for Transfer<'_> {
    fn default() -> Self {
        Transfer::Blocking
    }
}

impl From<bool> for Transfer<'static> {
    fn from(asynchronous: bool) -> Self {
        if asynchronous {
            Transfer::Async
        } else {
            Transfer::Blocking
        }
    }
}

impl<'a> From<&'a CommandQueue> for Transfer<'a> {
    fn from(queue: &'a CommandQueue) -> Self {
        Transfer::On(queue)
    }
}

/// Element range of one transfer, resolved against both shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    rows: usize,
    cols: usize,
    dst_pitch: usize,
    src_pitch: usize,
}

impl Span {
    fn resolve(extent: Extent, dst: Shape, src: Shape) -> MemResult<Span> {
        match extent {
            Extent::All if dst.len() == src.len() => Ok(Span::linear(src.len())),
            Extent::Cols(n) if n <= dst.len() && n <= src.len() => Ok(Span::linear(n)),
            Extent::Block { rows, cols }
                if rows <= dst.rows()
                    && rows <= src.rows()
                    && cols <= dst.cols()
                    && cols <= src.cols() =>
            {
                Ok(Span {
                    rows,
                    cols,
                    dst_pitch: dst.cols(),
                    src_pitch: src.cols(),
                })
            }
            _ => Err(MemError::ShapeMismatch),
        }
    }

    fn linear(n: usize) -> Span {
        Span {
            rows: 1,
            cols: n,
            dst_pitch: n,
            src_pitch: n,
        }
    }

    fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Visit the (destination, source) element index of every element in the span.
    fn for_each_index<F: FnMut(usize, usize)>(&self, mut f: F) {
        for row in 0..self.rows {
            for col in 0..self.cols {
                f(row * self.dst_pitch + col, row * self.src_pitch + col);
            }
        }
    }
}

/// Check that `extent` fits both shapes without transferring anything.
pub(crate) fn check_extent(extent: Extent, dst: Shape, src: Shape) -> MemResult<()> {
    Span::resolve(extent, dst, src).map(|_| ())
}

/// Pick the context that executes a transfer: the queue's if one was given, otherwise the
/// device side's, otherwise whichever container has one.
fn executing_context<'c>(
    transfer: &Transfer<'c>,
    dst: (MemPtr, Option<&'c Arc<dyn Context>>),
    src: (MemPtr, Option<&'c Arc<dyn Context>>),
) -> Option<&'c Arc<dyn Context>> {
    if let Transfer::On(queue) = transfer {
        return Some(queue.context());
    }
    match (dst, src) {
        ((MemPtr::Device(_), Some(ctx)), _) | (_, (MemPtr::Device(_), Some(ctx))) => Some(ctx),
        ((_, ctx), (_, other)) => ctx.or(other),
    }
}

/// Byte-level transfer shared by the typed copies and by the same-type mirror strategy.
pub(crate) fn copy_raw<'a, 'q>(
    dst: (MemPtr, Shape, Option<&'a Arc<dyn Context>>),
    src: (MemPtr, Shape, Option<&'a Arc<dyn Context>>),
    element_size: usize,
    extent: Extent,
    transfer: Transfer<'q>,
) -> MemResult<()>
where
    'q: 'a,
{
    let span = Span::resolve(extent, dst.1, src.1)?;
    if span.is_empty() || element_size == 0 {
        return Ok(());
    }
    let context = executing_context(&transfer, (dst.0, dst.2), (src.0, src.2))
        .ok_or(MemError::NoActiveDevice)?;
    trace!(
        rows = span.rows,
        cols = span.cols,
        element_size,
        asynchronous = transfer.is_async(),
        "issuing transfer"
    );
    let result = unsafe {
        context.copy_2d(
            dst.0,
            span.dst_pitch * element_size,
            src.0,
            span.src_pitch * element_size,
            span.cols * element_size,
            span.rows,
            transfer.queue(),
        )
    };
    result.map_err(|e| {
        trace!(error = %e, "transfer rejected by backend");
        MemError::TransferError
    })
}

/// Copy elements between two containers of the same element type.
///
/// Any direction works: host to device, device to host, device to device or host to host.
/// Blocking transfers have completed when this returns. Asynchronous transfers are only
/// guaranteed complete after the queue they were issued to is synchronized; until then the
/// destination must not be read and the source must not be modified.
///
/// # Errors:
///
/// `ShapeMismatch` if `extent` does not fit both containers, `TransferError` if the backend
/// rejects the transfer.
///
/// # Examples:
///
/// ```
/// # use unimem::*;
/// use unimem::memory::*;
///
/// let device = quick_init().unwrap();
/// let host = HostBuffer::from_slice(&[1u32, 2, 3], &device, Placement::Pinned).unwrap();
/// let mut gpu = DeviceBuffer::<u32>::alloc(3, &device, Placement::Default).unwrap();
/// let mut back = HostBuffer::<u32>::alloc(3, &device, Placement::Default).unwrap();
///
/// copy(&mut gpu, &host, Extent::All, Transfer::Blocking).unwrap();
/// copy(&mut back, &gpu, Extent::Cols(2), false).unwrap();
/// assert_eq!(&[1, 2, 0], back.as_slice());
/// ```
pub fn copy<'q, T, D, S, X>(dst: &mut D, src: &S, extent: Extent, transfer: X) -> MemResult<()>
where
    T: DeviceCopy,
    D: Memory<T> + ?Sized,
    S: Memory<T> + ?Sized,
    X: Into<Transfer<'q>>,
{
    let transfer: Transfer<'q> = transfer.into();
    let dst_ptr = dst.mem_ptr();
    copy_raw(
        (dst_ptr, dst.shape(), dst.context()),
        (src.mem_ptr(), src.shape(), src.context()),
        mem::size_of::<T>(),
        extent,
        transfer,
    )
}

/// Convert host elements into the device element type, then transfer them to `dst`.
///
/// `staging` is a host buffer of the device element type; the conversion writes into it, fully
/// and synchronously, before the transfer is issued. The transfer itself may be asynchronous, in
/// which case `staging` must not be touched until its queue is synchronized.
pub fn cast_to_device<'q, H, D, M, X>(
    dst: &mut M,
    src: &HostBuffer<H>,
    staging: &mut HostBuffer<D>,
    extent: Extent,
    transfer: X,
) -> MemResult<()>
where
    H: DeviceCopy + Copy + Cast<D>,
    D: DeviceCopy + Copy,
    M: Memory<D> + ?Sized,
    X: Into<Transfer<'q>>,
{
    let transfer: Transfer<'q> = transfer.into();
    let span = Span::resolve(extent, staging.shape(), src.shape())?;
    {
        let from = src.as_slice();
        let to = staging.as_mut_slice();
        span.for_each_index(|d, s| to[d] = Cast::<D>::cast(from[s]));
    }
    copy(dst, &*staging, extent, transfer)
}

/// Transfer device elements into `staging`, wait for them, then convert into `dst`.
///
/// The conversion needs the transferred data, so an asynchronous transfer is waited on before
/// this returns; only the device-side part of the work can overlap with other queues.
pub fn cast_to_host<'q, H, D, M, X>(
    dst: &mut HostBuffer<H>,
    src: &M,
    staging: &mut HostBuffer<D>,
    extent: Extent,
    transfer: X,
) -> MemResult<()>
where
    H: DeviceCopy + Copy,
    D: DeviceCopy + Copy + Cast<H>,
    M: Memory<D> + ?Sized,
    X: Into<Transfer<'q>>,
{
    let transfer: Transfer<'q> = transfer.into();
    let span = Span::resolve(extent, dst.shape(), staging.shape())?;
    copy(staging, src, extent, transfer)?;
    if transfer.is_async() {
        if let Some(context) = Memory::context(&*staging).or_else(|| src.context()) {
            transfer.wait(context)?;
        }
    }
    let from = staging.as_slice();
    let to = dst.as_mut_slice();
    span.for_each_index(|d, s| to[d] = Cast::<H>::cast(from[s]));
    Ok(())
}
