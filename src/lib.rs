//! Ballista: OpenCL compute offload with a trajectory simulator
//!
//! Ballista configures an OpenCL device, compiles a program, manages
//! device-resident buffers and images, and drives kernels through an
//! explicit bind/execute/read protocol.
//!
//! # Architecture
//!
//! - **opencl**: context, buffers, images and kernels
//! - **trajectory**: projectile-motion simulator built on the host layer
//! - **config**: context and run configuration
//! - **error**: error classification shared by every operation
//!
//! # Example
//!
//! ```no_run
//! use ballista::prelude::*;
//!
//! let mut simulator = TrajectorySimulator::new(&ProgramSource::builtin(), 10.0, 1.0)?;
//! simulator.acquire(KERNEL_ANGLE)?;
//! simulator.compute(0.0, 50.0, 45.0)?;
//! simulator.log()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod opencl;
pub mod trajectory;

pub use config::{ContextConfig, DeviceKind, QueueConfig, SharedContext, SimulationConfig};
pub use error::{ComputeError, ErrorKind, Result};
pub use opencl::{
    BufferOptions, ComputeContext, ImageSurface, Kernel, MemoryBuffer, ProgramSource,
};
pub use trajectory::{TrajectoryChannel, TrajectoryResults, TrajectorySimulator};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::config::{ContextConfig, DeviceKind, SimulationConfig};
    pub use crate::error::ComputeError;
    pub use crate::opencl::{
        AccessMode, BlockingMode, BufferOptions, ComputeContext, HostPointer, ImageSurface,
        Kernel, MemoryBuffer, PixelFormat, ProgramSource, Region,
    };
    pub use crate::trajectory::{
        KERNEL_ANGLE, KERNEL_HEIGHT, SimulatorState, TrajectoryChannel, TrajectorySimulator,
    };
}
