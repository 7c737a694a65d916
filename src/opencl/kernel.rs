//! Executable kernels with per-index argument binding
//!
//! Buffers, images and scalar parameters share one argument index space.
//! Arguments are validated against the declared argument count when they
//! are bound, so mismatches surface before launch.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;

use log::{debug, trace};
use ocl::core::{
    self, ArgVal, Event as CoreEvent, Kernel as CoreKernel, KernelInfo, KernelInfoResult, Mem,
};
use ocl::{OclPrm, SpatialDims};

use super::buffer::{HostBacking, MemoryBuffer};
use super::context::ComputeContext;
use super::image::ImageSurface;
use crate::error::{ComputeError, Result};

/// Local work-group shape hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkGroup {
    /// Flat item count along the first dimension
    Items(usize),
    /// Two-dimensional shape
    Shape { width: usize, height: usize },
}

impl WorkGroup {
    fn lens(self) -> [usize; 3] {
        match self {
            WorkGroup::Items(n) => [n, 1, 1],
            WorkGroup::Shape { width, height } => [width, height, 1],
        }
    }
}

/// What occupies a bound argument slot
#[derive(Clone)]
enum BoundArg {
    // The memory object and any host storage it aliases outlive the binding.
    Memory { mem: Mem, host: Option<HostBacking> },
    Parameter { size: usize },
    Local { size: usize },
}

impl fmt::Debug for BoundArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundArg::Memory { mem, host } => {
                write!(f, "{:?}", mem)?;
                if host.is_some() {
                    write!(f, " (host-backed)")?;
                }
                Ok(())
            }
            BoundArg::Parameter { size } => write!(f, "parameter ({} bytes)", size),
            BoundArg::Local { size } => write!(f, "local ({} bytes)", size),
        }
    }
}

/// A kernel entry point resolved from the context's program
///
/// Only [`Kernel::acquire`] creates a kernel, so every `Kernel` refers to a
/// resolved entry point in an acquired context.
pub struct Kernel {
    kernel: CoreKernel,
    context: ComputeContext,
    name: String,
    num_args: u32,
    work_dimension: u32,
    work_group: Option<WorkGroup>,
    args: BTreeMap<u32, BoundArg>,
}

impl Kernel {
    /// Resolves `name` in the context's compiled program
    pub fn acquire(context: &ComputeContext, name: &str) -> Result<Self> {
        let kernel = core::create_kernel(context.program().as_core(), name).map_err(|e| {
            ComputeError::Acquisition(format!("Failed to resolve kernel '{}': {}", name, e))
        })?;
        let num_args = match core::get_kernel_info(&kernel, KernelInfo::NumArgs) {
            Ok(KernelInfoResult::NumArgs(n)) => n,
            Ok(other) => {
                return Err(ComputeError::Acquisition(format!(
                    "Unexpected argument count for kernel '{}': {:?}",
                    name, other
                )));
            }
            Err(e) => {
                return Err(ComputeError::Acquisition(format!(
                    "Failed to query kernel '{}': {}",
                    name, e
                )));
            }
        };

        debug!("Kernel '{}' acquired with {} arguments", name, num_args);

        Ok(Self {
            kernel,
            context: context.clone(),
            name: name.to_string(),
            num_args,
            work_dimension: 1,
            work_group: None,
            args: BTreeMap::new(),
        })
    }

    /// Entry point name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments the kernel declares
    pub fn num_args(&self) -> u32 {
        self.num_args
    }

    pub fn work_dimension(&self) -> u32 {
        self.work_dimension
    }

    pub fn work_group(&self) -> Option<WorkGroup> {
        self.work_group
    }

    /// Declares the index-space rank
    pub fn set_work_dimension(&mut self, dimension: u32) -> Result<()> {
        if !(1..=3).contains(&dimension) {
            return Err(ComputeError::Configuration(format!(
                "Work dimension must be 1, 2 or 3, got {}",
                dimension
            )));
        }
        self.work_dimension = dimension;
        Ok(())
    }

    /// Hints a flat local work-group size
    pub fn set_work_group_items(&mut self, items: usize) -> Result<()> {
        if items == 0 {
            return Err(ComputeError::Configuration(
                "Work-group item count must be positive".into(),
            ));
        }
        self.work_group = Some(WorkGroup::Items(items));
        Ok(())
    }

    /// Hints a two-dimensional local work-group shape
    pub fn set_work_group_size(&mut self, width: usize, height: usize) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(ComputeError::Configuration(format!(
                "Work-group shape {}x{} must be positive",
                width, height
            )));
        }
        self.work_group = Some(WorkGroup::Shape { width, height });
        Ok(())
    }

    /// Lets the runtime choose the local work-group size
    pub fn clear_work_group(&mut self) {
        self.work_group = None;
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.num_args {
            return Err(ComputeError::Binding(format!(
                "Kernel '{}' has {} arguments, index {} is out of range",
                self.name, self.num_args, index
            )));
        }
        Ok(())
    }

    fn set_arg(&mut self, index: u32, value: ArgVal, bound: BoundArg) -> Result<()> {
        self.check_index(index)?;
        core::set_kernel_arg(&self.kernel, index, value).map_err(|e| {
            ComputeError::Binding(format!(
                "Kernel '{}' rejected argument {}: {}",
                self.name, index, e
            ))
        })?;
        trace!("kernel '{}' arg {} <- {:?}", self.name, index, bound);
        self.args.insert(index, bound);
        Ok(())
    }

    /// Attaches `buffer` at its own argument index
    pub fn bind_buffer<T: OclPrm>(&mut self, buffer: &MemoryBuffer<T>) -> Result<()> {
        let mem = buffer.ocl_buffer().as_core();
        let bound = BoundArg::Memory {
            mem: mem.clone(),
            host: buffer.host_backing(),
        };
        self.set_arg(buffer.index(), ArgVal::mem(mem), bound)
    }

    /// Attaches `image` at its own argument index
    pub fn bind_image(&mut self, image: &ImageSurface) -> Result<()> {
        let mem = image.as_mem();
        let bound = BoundArg::Memory {
            mem: mem.clone(),
            host: None,
        };
        self.set_arg(image.index(), ArgVal::mem(mem), bound)
    }

    /// Attaches an opaque argument of `size` bytes
    ///
    /// With `value` the bytes are copied into the argument. Without it,
    /// `size` bytes of uninitialised local memory are reserved instead.
    pub fn bind_parameter(&mut self, index: u32, size: usize, value: Option<&[u8]>) -> Result<()> {
        if size == 0 {
            return Err(ComputeError::Binding(format!(
                "Kernel '{}' argument {} has zero size",
                self.name, index
            )));
        }
        match value {
            Some(bytes) => {
                if bytes.len() != size {
                    return Err(ComputeError::Binding(format!(
                        "Kernel '{}' argument {}: {} bytes supplied, {} declared",
                        self.name,
                        index,
                        bytes.len(),
                        size
                    )));
                }
                // SAFETY: `bytes` holds exactly `size` bytes and the runtime
                // copies them before `set_kernel_arg` returns.
                let value =
                    unsafe { ArgVal::from_raw(size, bytes.as_ptr() as *const c_void, false) };
                self.set_arg(index, value, BoundArg::Parameter { size })
            }
            None => self.set_arg(index, ArgVal::local::<u8>(&size), BoundArg::Local { size }),
        }
    }

    /// Attaches a typed scalar argument
    pub fn bind_scalar<T: OclPrm>(&mut self, index: u32, value: &T) -> Result<()> {
        let size = std::mem::size_of::<T>();
        self.set_arg(index, ArgVal::scalar(value), BoundArg::Parameter { size })
    }

    /// True when an argument has been attached at `index`
    pub fn is_bound(&self, index: u32) -> bool {
        self.args.contains_key(&index)
    }

    /// Declared argument indices that have nothing attached
    pub fn unbound_indices(&self) -> Vec<u32> {
        (0..self.num_args).filter(|i| !self.is_bound(*i)).collect()
    }

    /// Indices currently holding a buffer or image
    pub fn memory_indices(&self) -> Vec<u32> {
        self.args
            .iter()
            .filter(|(_, arg)| matches!(arg, BoundArg::Memory { .. }))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Indices currently holding a scalar or local-memory argument
    pub fn parameter_indices(&self) -> Vec<u32> {
        self.args
            .iter()
            .filter(|(_, arg)| !matches!(arg, BoundArg::Memory { .. }))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Launches the kernel and blocks until it completes
    pub fn execute(
        &self,
        global: impl Into<SpatialDims>,
        offset: Option<SpatialDims>,
        local: Option<SpatialDims>,
    ) -> Result<()> {
        self.enqueue(global, offset, local)?;
        self.context.finish().map_err(|e| {
            ComputeError::Execution(format!("Kernel '{}' did not complete: {}", self.name, e))
        })
    }

    /// Submits the kernel and returns without waiting
    ///
    /// Completion must be observed through the context's `finish` or
    /// `barrier`.
    pub fn enqueue(
        &self,
        global: impl Into<SpatialDims>,
        offset: Option<SpatialDims>,
        local: Option<SpatialDims>,
    ) -> Result<()> {
        let unbound = self.unbound_indices();
        if !unbound.is_empty() {
            return Err(ComputeError::Execution(format!(
                "Kernel '{}' has unbound arguments {:?}",
                self.name, unbound
            )));
        }

        let global = self.lens(&global.into(), "global size")?;
        if global.contains(&0) {
            return Err(ComputeError::Execution(format!(
                "Kernel '{}' global size {:?} has an empty dimension",
                self.name, global
            )));
        }
        let offset = offset.map(|o| self.lens(&o, "global offset")).transpose()?;
        let local = match local {
            Some(l) => Some(self.lens(&l, "local size")?),
            None => self.work_group.map(WorkGroup::lens),
        };

        trace!(
            "enqueue kernel '{}' global {:?} offset {:?} local {:?}",
            self.name, global, offset, local
        );
        // SAFETY: every declared argument slot is bound and the memory objects
        // are retained in `self.args`.
        unsafe {
            core::enqueue_kernel(
                self.context.core_queue(),
                &self.kernel,
                self.work_dimension,
                offset,
                &global,
                local,
                None::<&CoreEvent>,
                None::<&mut CoreEvent>,
            )
        }
        .map_err(|e| {
            ComputeError::Execution(format!("Failed to launch kernel '{}': {}", self.name, e))
        })
    }

    fn lens(&self, dims: &SpatialDims, what: &str) -> Result<[usize; 3]> {
        let (rank, lens) = match *dims {
            SpatialDims::One(x) => (1, [x, 1, 1]),
            SpatialDims::Two(x, y) => (2, [x, y, 1]),
            SpatialDims::Three(x, y, z) => (3, [x, y, z]),
            SpatialDims::Unspecified => {
                return Err(ComputeError::Execution(format!(
                    "Kernel '{}' {} is unspecified",
                    self.name, what
                )));
            }
        };
        if rank != self.work_dimension {
            return Err(ComputeError::Execution(format!(
                "Kernel '{}' {} has rank {}, work dimension is {}",
                self.name, what, rank, self.work_dimension
            )));
        }
        Ok(lens)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("num_args", &self.num_args)
            .field("work_dimension", &self.work_dimension)
            .field("work_group", &self.work_group)
            .field("bound", &self.args.keys().collect::<Vec<_>>())
            .finish()
    }
}
