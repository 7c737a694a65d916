//! OpenCL host layer
//!
//! [`ComputeContext`] is the root of the resource hierarchy. Buffers,
//! images and kernels are built against an acquired context and keep it
//! alive.

pub mod buffer;
pub mod context;
pub mod image;
pub mod kernel;

pub use buffer::{
    AccessMode, BlockingMode, BufferOptions, HostPointer, MappedRange, MemoryBuffer,
    next_power_of_two,
};
pub use context::{ComputeContext, DeviceSummary, ProgramSource};
pub use image::{ImageSurface, MappedImage, PixelFormat, Region, TextureRef};
pub use kernel::{Kernel, WorkGroup};
