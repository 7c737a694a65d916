//! Context and simulation configuration
//!
//! Settings that must be fixed before a context is acquired live in
//! [`ContextConfig`]. A whole run (kernel source, time range, initial
//! conditions and context settings) can be described by a
//! [`SimulationConfig`] loaded from JSON.
//!
//! Environment variables override file values:
//! - `BALLISTA_DEVICE`: `cpu`, `gpu`, `accelerator`, `all` or `default`
//! - `BALLISTA_PLATFORM`: platform index
//! - `BALLISTA_BUILD_OPTIONS`: extra OpenCL compiler options

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ocl::flags::{CommandQueueProperties, DeviceType};
use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, Result};

/// Environment variable selecting the preferred device class
pub const ENV_DEVICE: &str = "BALLISTA_DEVICE";
/// Environment variable selecting the platform index
pub const ENV_PLATFORM: &str = "BALLISTA_PLATFORM";
/// Environment variable appending compiler options
pub const ENV_BUILD_OPTIONS: &str = "BALLISTA_BUILD_OPTIONS";

/// Device class to request when enumerating devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// CPU-class device
    Cpu,
    /// GPU
    Gpu,
    /// Dedicated accelerator
    Accelerator,
    /// Whatever the platform reports as its default device
    #[default]
    Default,
    /// Any device
    All,
}

impl DeviceKind {
    /// Converts to the OpenCL device type bitfield
    pub fn to_ocl(self) -> DeviceType {
        match self {
            DeviceKind::Cpu => DeviceType::CPU,
            DeviceKind::Gpu => DeviceType::GPU,
            DeviceKind::Accelerator => DeviceType::ACCELERATOR,
            DeviceKind::Default => DeviceType::DEFAULT,
            DeviceKind::All => DeviceType::ALL,
        }
    }

    /// Classifies a device type reported by the runtime
    pub fn from_ocl(device_type: DeviceType) -> Self {
        if device_type.contains(DeviceType::CPU) {
            DeviceKind::Cpu
        } else if device_type.contains(DeviceType::GPU) {
            DeviceKind::Gpu
        } else if device_type.contains(DeviceType::ACCELERATOR) {
            DeviceKind::Accelerator
        } else {
            DeviceKind::Default
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Accelerator => "accelerator",
            DeviceKind::Default => "default",
            DeviceKind::All => "all",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for DeviceKind {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" => Ok(DeviceKind::Gpu),
            "accelerator" | "acc" => Ok(DeviceKind::Accelerator),
            "default" => Ok(DeviceKind::Default),
            "all" | "any" => Ok(DeviceKind::All),
            other => Err(ComputeError::Configuration(format!(
                "Unknown device kind '{}'",
                other
            ))),
        }
    }
}

/// Command-queue properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Allow the queue to execute commands out of submission order
    pub out_of_order: bool,
    /// Record profiling timestamps on events
    pub profiling: bool,
}

impl QueueConfig {
    /// Converts to the OpenCL property bitfield, `None` when no flag is set
    pub fn to_ocl(self) -> Option<CommandQueueProperties> {
        let mut props = CommandQueueProperties::empty();
        if self.out_of_order {
            props |= CommandQueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE;
        }
        if self.profiling {
            props |= CommandQueueProperties::PROFILING_ENABLE;
        }
        if props.is_empty() { None } else { Some(props) }
    }
}

/// Platform-specific property for sharing objects with a display context
///
/// The handles are owned by the windowing layer and must stay valid for
/// the lifetime of the context built from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedContext {
    /// macOS CGL share group
    CglShareGroup(*mut c_void),
    /// Current GL context handle (GLX/WGL/EGL platforms)
    GlContext(*mut c_void),
}

/// Settings applied when acquiring a [`ComputeContext`](crate::ComputeContext)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Preferred device class
    pub device_type: DeviceKind,
    /// Take any device when none of the preferred class exists
    pub fallback_to_any_device: bool,
    /// Restrict enumeration to one platform
    pub platform_index: Option<usize>,
    /// Number of device entries to enumerate per platform
    pub device_entries: u32,
    /// Command-queue properties
    pub queue: QueueConfig,
    /// Options passed to the OpenCL compiler
    pub build_options: String,
    /// Display-sharing property, never serialised
    #[serde(skip)]
    pub shared_context: Option<SharedContext>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceKind::Default,
            fallback_to_any_device: true,
            platform_index: None,
            device_entries: 1,
            queue: QueueConfig::default(),
            build_options: String::new(),
            shared_context: None,
        }
    }
}

impl ContextConfig {
    /// Creates the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preferring a CPU-class device, the portable choice for
    /// kernels written against CPU runtimes
    pub fn cpu_preferred() -> Self {
        Self::default().with_device_type(DeviceKind::Cpu)
    }

    pub fn with_device_type(mut self, device_type: DeviceKind) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback_to_any_device = fallback;
        self
    }

    pub fn with_platform_index(mut self, index: usize) -> Self {
        self.platform_index = Some(index);
        self
    }

    pub fn with_device_entries(mut self, entries: u32) -> Self {
        self.device_entries = entries;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_build_options(mut self, options: impl Into<String>) -> Self {
        self.build_options = options.into();
        self
    }

    pub fn with_shared_context(mut self, shared: SharedContext) -> Self {
        self.shared_context = Some(shared);
        self
    }

    /// Checks values that would otherwise fail deep inside acquisition
    pub fn validate(&self) -> Result<()> {
        if self.device_entries == 0 {
            return Err(ComputeError::Configuration(
                "device_entries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Applies `BALLISTA_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `BALLISTA_*` overrides from an arbitrary lookup
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup(ENV_DEVICE) {
            self.device_type = device.parse()?;
        }
        if let Some(platform) = lookup(ENV_PLATFORM) {
            let index = platform.trim().parse::<usize>().map_err(|e| {
                ComputeError::Configuration(format!(
                    "{} must be a platform index: {}",
                    ENV_PLATFORM, e
                ))
            })?;
            self.platform_index = Some(index);
        }
        if let Some(options) = lookup(ENV_BUILD_OPTIONS) {
            if self.build_options.is_empty() {
                self.build_options = options;
            } else {
                self.build_options = format!("{} {}", self.build_options, options);
            }
        }
        Ok(self)
    }
}

/// A complete simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// OpenCL source file; the bundled kernels are used when absent
    pub kernel_source: Option<PathBuf>,
    /// Entry point to acquire
    pub kernel_name: String,
    /// Maximum simulated time
    pub time_max: f32,
    /// Fixed time step
    pub time_delta: f32,
    /// Time of the first sample
    pub initial_time: f32,
    /// Launch speed
    pub initial_speed: f32,
    /// Launch angle in degrees or launch height, depending on the kernel
    pub initial_param: f32,
    /// Context settings
    pub context: ContextConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            kernel_source: None,
            kernel_name: crate::trajectory::KERNEL_ANGLE.to_string(),
            time_max: 10.0,
            time_delta: 1.0,
            initial_time: 0.0,
            initial_speed: 50.0,
            initial_param: 45.0,
            context: ContextConfig::cpu_preferred(),
        }
    }
}

impl SimulationConfig {
    /// Parses a configuration from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ComputeError::Configuration(format!("Invalid simulation config: {}", e)))
    }

    /// Loads a configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ComputeError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Serialises the configuration as pretty-printed JSON
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ComputeError::Configuration(format!("Failed to encode config: {}", e)))
    }
}
