//! Error types for compute operations
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! follow the failure classes of the host protocol: acquiring the device
//! environment, allocating resources, binding kernel arguments, launching
//! kernels and moving data between host and device.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Coarse classification of a [`ComputeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device, context, queue or program could not be established
    Acquisition,
    /// A buffer, image or host array could not be allocated
    Allocation,
    /// A kernel argument was rejected
    Binding,
    /// A kernel launch or queue operation was rejected
    Execution,
    /// A host/device transfer did not complete
    Transfer,
    /// An invalid setting was supplied
    Configuration,
}

/// Errors raised by the compute layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// The context could not be acquired. No dependent may be built from it.
    #[error("Acquisition failure: {0}")]
    Acquisition(String),

    /// A single resource failed to allocate. Sibling resources are unaffected.
    #[error("Allocation failure: {0}")]
    Allocation(String),

    /// A kernel argument could not be attached
    #[error("Binding failure: {0}")]
    Binding(String),

    /// Some of a batch of buffer bindings failed; the rest were attached
    #[error("Binding failure at argument indices {failed:?}")]
    PartialBinding {
        /// Argument indices whose bind was rejected
        failed: Vec<u32>,
    },

    /// The device rejected a kernel launch or a queue operation
    #[error("Execution failure: {0}")]
    Execution(String),

    /// A read, write, copy or map did not complete
    #[error("Transfer failure: {0}")]
    Transfer(String),

    /// An argument or configuration value is out of range
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ComputeError {
    /// Returns the failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComputeError::Acquisition(_) => ErrorKind::Acquisition,
            ComputeError::Allocation(_) => ErrorKind::Allocation,
            ComputeError::Binding(_) | ComputeError::PartialBinding { .. } => ErrorKind::Binding,
            ComputeError::Execution(_) => ErrorKind::Execution,
            ComputeError::Transfer(_) => ErrorKind::Transfer,
            ComputeError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// True when the owning context is permanently unusable
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Acquisition
    }

    /// True when the caller may correct the cause and retry the same object
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Binding
                | ErrorKind::Execution
                | ErrorKind::Transfer
                | ErrorKind::Configuration
        )
    }
}
