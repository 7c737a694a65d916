//! Device-resident linear buffers
//!
//! A [`MemoryBuffer`] always allocates a power-of-two number of elements,
//! at least as many as requested. The allocated length never changes after
//! acquisition.

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::{debug, trace, warn};
use ocl::flags::{self, MapFlags, MemFlags};
use ocl::{Buffer as OclBuffer, MemMap, OclPrm};

use super::context::ComputeContext;
use crate::error::{ComputeError, Result};

/// Device-side access permitted to kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

/// How host memory relates to the device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostPointer {
    /// Device-only memory
    #[default]
    None,
    /// The buffer keeps an owned host copy and the runtime may cache it
    Use,
    /// The runtime allocates host-visible memory
    Alloc,
    /// Caller data is copied once at creation
    Copy,
}

/// Whether transfers return before the device has finished with them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// Allocation and transfer settings shared by buffers and images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferOptions {
    pub access: AccessMode,
    pub host_pointer: HostPointer,
    pub blocking: BlockingMode,
}

impl BufferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn with_host_pointer(mut self, host_pointer: HostPointer) -> Self {
        self.host_pointer = host_pointer;
        self
    }

    pub fn with_blocking(mut self, blocking: BlockingMode) -> Self {
        self.blocking = blocking;
        self
    }

    /// True when transfers wait for completion at enqueue time
    pub fn is_blocking(&self) -> bool {
        self.blocking == BlockingMode::Blocking
    }

    /// Memory flags for the allocation
    ///
    /// `Use` and `Copy` are added by the buffer builder when a host slice is
    /// supplied, so only `Alloc` appears here.
    pub fn mem_flags(&self) -> MemFlags {
        let access = match self.access {
            AccessMode::ReadOnly => flags::MEM_READ_ONLY,
            AccessMode::WriteOnly => flags::MEM_WRITE_ONLY,
            AccessMode::ReadWrite => flags::MEM_READ_WRITE,
        };
        match self.host_pointer {
            HostPointer::Alloc => access | flags::MEM_ALLOC_HOST_PTR,
            _ => access,
        }
    }
}

/// Smallest power of two greater than or equal to `n`
///
/// Zero maps to one, matching `usize::next_power_of_two`.
pub fn next_power_of_two(n: usize) -> usize {
    n.next_power_of_two()
}

/// Type-erased host storage behind a `HostPointer::Use` allocation
///
/// Anything retaining the device memory object must hold a clone.
pub(crate) type HostBacking = Arc<dyn Any + Send + Sync>;

/// Linear device allocation bound to a kernel argument index
pub struct MemoryBuffer<T: OclPrm = f32> {
    buffer: OclBuffer<T>,
    // Backs `HostPointer::Use`; shared with kernels that retain `buffer`.
    host_backing: Option<Arc<Box<[T]>>>,
    context: ComputeContext,
    index: u32,
    requested_len: usize,
    actual_len: usize,
    options: BufferOptions,
}

impl<T: OclPrm> MemoryBuffer<T> {
    /// Allocates `next_power_of_two(requested_len)` elements
    pub fn acquire(
        context: &ComputeContext,
        index: u32,
        requested_len: usize,
        options: &BufferOptions,
    ) -> Result<Self> {
        Self::acquire_inner(context, index, requested_len, options, None)
    }

    /// Allocates and initialises the buffer from host data
    ///
    /// `host` may be shorter than the padded length; the remainder is filled
    /// with `T::default()`.
    pub fn acquire_with_host(
        context: &ComputeContext,
        index: u32,
        requested_len: usize,
        options: &BufferOptions,
        host: &[T],
    ) -> Result<Self> {
        Self::acquire_inner(context, index, requested_len, options, Some(host))
    }

    fn acquire_inner(
        context: &ComputeContext,
        index: u32,
        requested_len: usize,
        options: &BufferOptions,
        host: Option<&[T]>,
    ) -> Result<Self> {
        if requested_len == 0 {
            return Err(ComputeError::Allocation(format!(
                "Buffer {} requested zero elements",
                index
            )));
        }
        let actual_len = next_power_of_two(requested_len);
        if let Some(host) = host
            && host.len() > actual_len
        {
            return Err(ComputeError::Allocation(format!(
                "Buffer {}: host data has {} elements, allocation holds {}",
                index,
                host.len(),
                actual_len
            )));
        }

        let padded: Option<Arc<Box<[T]>>> = host.map(|data| {
            let mut padded = vec![T::default(); actual_len];
            padded[..data.len()].copy_from_slice(data);
            Arc::new(padded.into_boxed_slice())
        });

        let mut builder = OclBuffer::<T>::builder()
            .queue(context.queue().clone())
            .flags(options.mem_flags())
            .len(actual_len);

        match (options.host_pointer, padded.as_deref()) {
            (HostPointer::Use, Some(data)) => {
                // SAFETY: `data` lives in `host_backing`. Every holder of the
                // memory object also holds a clone of that `Arc`.
                builder = unsafe { builder.use_host_slice(data) };
            }
            (_, Some(data)) => builder = builder.copy_host_slice(data),
            (_, None) => builder = builder.fill_val(T::default()),
        }
        let buffer = builder.build().map_err(|e| {
            ComputeError::Allocation(format!(
                "Failed to allocate buffer {} ({} elements): {}",
                index, actual_len, e
            ))
        })?;
        let host_backing = match options.host_pointer {
            HostPointer::Use => padded,
            _ => None,
        };

        debug!(
            "Buffer {} acquired: requested {}, allocated {} ({} bytes)",
            index,
            requested_len,
            actual_len,
            actual_len * std::mem::size_of::<T>()
        );

        Ok(Self {
            buffer,
            host_backing,
            context: context.clone(),
            index,
            requested_len,
            actual_len,
            options: *options,
        })
    }

    /// Kernel argument index this buffer binds to
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Element count the caller asked for
    pub fn requested_len(&self) -> usize {
        self.requested_len
    }

    /// Allocated element count, always a power of two
    pub fn actual_len(&self) -> usize {
        self.actual_len
    }

    /// Allocated size in bytes
    pub fn actual_size(&self) -> usize {
        self.actual_len * std::mem::size_of::<T>()
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    /// True when the runtime may cache an owned host copy
    pub fn has_host_backing(&self) -> bool {
        self.host_backing.is_some()
    }

    /// Get the underlying OpenCL buffer
    ///
    /// With `HostPointer::Use` the returned buffer must not outlive `self`;
    /// kernels keep the storage alive through [`Self::host_backing`].
    pub fn ocl_buffer(&self) -> &OclBuffer<T> {
        &self.buffer
    }

    pub(crate) fn host_backing(&self) -> Option<HostBacking> {
        self.host_backing
            .as_ref()
            .map(|backing| Arc::clone(backing) as HostBacking)
    }

    fn check_len(&self, len: usize, host_len: usize, op: &str) -> Result<()> {
        if len > self.actual_len {
            return Err(ComputeError::Transfer(format!(
                "Buffer {} {}: {} elements exceed allocation of {}",
                self.index, op, len, self.actual_len
            )));
        }
        if len > host_len {
            return Err(ComputeError::Transfer(format!(
                "Buffer {} {}: host slice holds {} elements, {} requested",
                self.index, op, host_len, len
            )));
        }
        Ok(())
    }

    /// Copies the first `len` elements from the device into `dst`
    pub fn read(&self, len: usize, dst: &mut [T]) -> Result<()> {
        self.check_len(len, dst.len(), "read")?;
        trace!("read buffer {} ({} elements)", self.index, len);
        let blocking = self.options.is_blocking();
        // SAFETY: for non-blocking reads the queue is drained below before the
        // borrow of `dst` ends.
        unsafe {
            self.buffer
                .read(&mut dst[..len])
                .len(len)
                .block(blocking)
                .enq()
        }
        .map_err(|e| {
            ComputeError::Transfer(format!("Failed to read buffer {}: {}", self.index, e))
        })?;
        if !blocking {
            self.drain("read")?;
        }
        Ok(())
    }

    /// Copies the first `len` elements of `src` to the device
    pub fn write(&mut self, len: usize, src: &[T]) -> Result<()> {
        self.check_len(len, src.len(), "write")?;
        trace!("write buffer {} ({} elements)", self.index, len);
        let blocking = self.options.is_blocking();
        // SAFETY: for non-blocking writes the queue is drained below before the
        // borrow of `src` ends.
        unsafe {
            self.buffer
                .write(&src[..len])
                .len(len)
                .block(blocking)
                .enq()
        }
        .map_err(|e| {
            ComputeError::Transfer(format!("Failed to write buffer {}: {}", self.index, e))
        })?;
        if !blocking {
            self.drain("write")?;
        }
        Ok(())
    }

    /// Device-to-device copy from `src`, defaulting to this buffer's full length
    pub fn copy_from(&mut self, src: &MemoryBuffer<T>, len: Option<usize>) -> Result<()> {
        let len = len.unwrap_or(self.actual_len);
        if len > self.actual_len || len > src.actual_len {
            return Err(ComputeError::Transfer(format!(
                "Copy of {} elements from buffer {} ({}) to buffer {} ({}) out of range",
                len, src.index, src.actual_len, self.index, self.actual_len
            )));
        }
        trace!("copy buffer {} -> {} ({} elements)", src.index, self.index, len);
        src.buffer
            .copy(&self.buffer, Some(0), Some(len))
            .enq()
            .map_err(|e| {
                ComputeError::Transfer(format!(
                    "Failed to copy buffer {} into {}: {}",
                    src.index, self.index, e
                ))
            })?;
        if self.options.is_blocking() {
            self.drain("copy")?;
        }
        Ok(())
    }

    /// Maps `len` elements starting at `offset` into host memory
    ///
    /// The range stays mapped until [`MappedRange::unmap`] is called or the
    /// guard is dropped. Kernels touching the same region must not run in
    /// the meantime.
    pub fn map(&mut self, offset: usize, len: usize) -> Result<MappedRange<'_, T>> {
        if len == 0 || offset.checked_add(len).is_none_or(|end| end > self.actual_len) {
            return Err(ComputeError::Transfer(format!(
                "Map of [{}, {}) out of range for buffer {} ({} elements)",
                offset,
                offset.saturating_add(len),
                self.index,
                self.actual_len
            )));
        }
        trace!("map buffer {} [{}, {})", self.index, offset, offset + len);
        // SAFETY: the mapping is tied to `&mut self`, so no other transfer on
        // this buffer can run while it is alive.
        let map = unsafe {
            self.buffer
                .map()
                .flags(MapFlags::READ | MapFlags::WRITE)
                .offset(offset)
                .len(len)
                .enq()
        }
        .map_err(|e| {
            ComputeError::Transfer(format!("Failed to map buffer {}: {}", self.index, e))
        })?;
        Ok(MappedRange {
            map: Some(map),
            buffer: self,
            offset,
        })
    }

    fn drain(&self, op: &str) -> Result<()> {
        self.context.finish().map_err(|e| {
            ComputeError::Transfer(format!("Buffer {} {} did not complete: {}", self.index, op, e))
        })
    }
}

impl<T: OclPrm> std::fmt::Debug for MemoryBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("index", &self.index)
            .field("requested_len", &self.requested_len)
            .field("actual_len", &self.actual_len)
            .field("options", &self.options)
            .finish()
    }
}

/// Host view of a mapped buffer range
pub struct MappedRange<'a, T: OclPrm> {
    map: Option<MemMap<T>>,
    buffer: &'a MemoryBuffer<T>,
    offset: usize,
}

impl<T: OclPrm> MappedRange<'_, T> {
    /// First mapped element index
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Releases the mapping and waits until the device sees host writes
    pub fn unmap(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut map) = self.map.take() {
            map.unmap().enq().map_err(|e| {
                ComputeError::Transfer(format!(
                    "Failed to unmap buffer {}: {}",
                    self.buffer.index, e
                ))
            })?;
            self.buffer.drain("unmap")?;
        }
        Ok(())
    }
}

impl<T: OclPrm> Deref for MappedRange<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.map.as_deref().unwrap_or(&[])
    }
}

impl<T: OclPrm> DerefMut for MappedRange<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }
}

impl<T: OclPrm> Drop for MappedRange<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}
