//! OpenCL compute context
//!
//! Owns the platform, device, context, command queue and compiled program.
//! Buffers, images and kernels hold a clone of the context, so the
//! underlying OpenCL objects stay alive until the last dependent is gone.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use ocl::core::{ContextPropertyValue, DeviceInfo, DeviceInfoResult, Event as CoreEvent};
use ocl::{Context as OclContext, Device as OclDevice, Platform, Program, Queue};

use crate::config::{ContextConfig, DeviceKind, SharedContext};
use crate::error::{ComputeError, Result};

/// Where the OpenCL C source of a program comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSource {
    /// Source text held in memory
    Inline(String),
    /// Source file read at acquisition time
    File(PathBuf),
}

impl ProgramSource {
    /// The trajectory kernels bundled with the crate
    pub fn builtin() -> Self {
        ProgramSource::Inline(crate::trajectory::KERNEL_SOURCE.to_string())
    }

    /// Reads the source text
    pub fn load(&self) -> Result<String> {
        let text = match self {
            ProgramSource::Inline(text) => text.clone(),
            ProgramSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
                ComputeError::Acquisition(format!(
                    "Failed to read program source {}: {}",
                    path.display(),
                    e
                ))
            })?,
        };
        if text.trim().is_empty() {
            return Err(ComputeError::Acquisition(format!(
                "Program source {} is empty",
                self
            )));
        }
        Ok(text)
    }
}

impl fmt::Display for ProgramSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramSource::Inline(text) => write!(f, "<inline, {} bytes>", text.len()),
            ProgramSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<PathBuf> for ProgramSource {
    fn from(path: PathBuf) -> Self {
        ProgramSource::File(path)
    }
}

/// One device visible to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub platform: String,
    pub name: String,
    pub kind: DeviceKind,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] on {}", self.name, self.kind, self.platform)
    }
}

// Field order is drop order: program and queue go before the context.
struct ContextState {
    program: Program,
    queue: Queue,
    context: OclContext,
    device: OclDevice,
    platform: Platform,
    device_kind: DeviceKind,
}

/// Acquired OpenCL environment: device, context, queue and program
///
/// There is no "unacquired" state: [`ComputeContext::acquire`] either
/// returns a usable context or an [`ComputeError::Acquisition`], so no
/// dependent can ever be built on a failed context.
#[derive(Clone)]
pub struct ComputeContext {
    inner: Arc<ContextState>,
}

impl ComputeContext {
    /// Selects a device, creates the context and queue, and builds the program
    pub fn acquire(config: &ContextConfig, source: &ProgramSource) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ComputeError::Acquisition(e.to_string()))?;
        let text = source.load()?;

        let (platform, device) = select_device(config)?;
        let device_kind = query_device_kind(&device);

        let mut builder = OclContext::builder();
        builder.platform(platform).devices(device);
        if let Some(shared) = config.shared_context {
            builder.property(shared_property(shared));
        }
        let context = builder.build().map_err(|e| {
            ComputeError::Acquisition(format!("Failed to create context: {}", e))
        })?;

        let queue = Queue::new(&context, device, config.queue.to_ocl()).map_err(|e| {
            ComputeError::Acquisition(format!("Failed to create command queue: {}", e))
        })?;

        let program = Program::builder()
            .src(text)
            .devices(device)
            .cmplr_opt(config.build_options.clone())
            .build(&context)
            .map_err(|e| {
                ComputeError::Acquisition(format!("Failed to build program {}: {}", source, e))
            })?;

        info!(
            "Acquired OpenCL context on {} ({}), program {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            device_kind,
            source
        );

        Ok(Self {
            inner: Arc::new(ContextState {
                program,
                queue,
                context,
                device,
                platform,
                device_kind,
            }),
        })
    }

    /// True when at least one platform exposes at least one device
    pub fn is_available() -> bool {
        let Ok(platforms) = platforms() else {
            return false;
        };
        for platform in platforms {
            if let Ok(devices) = OclDevice::list_all(platform)
                && !devices.is_empty()
            {
                return true;
            }
        }
        false
    }

    /// Lists every device of every platform
    pub fn list_devices() -> Result<Vec<DeviceSummary>> {
        let mut summaries = Vec::new();
        for platform in platforms()? {
            let platform_name = platform.name().unwrap_or_else(|_| "Unknown".to_string());
            let devices = OclDevice::list_all(platform).map_err(|e| {
                ComputeError::Acquisition(format!(
                    "Failed to list devices of {}: {}",
                    platform_name, e
                ))
            })?;
            for device in devices {
                summaries.push(DeviceSummary {
                    platform: platform_name.clone(),
                    name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
                    kind: query_device_kind(&device),
                });
            }
        }
        Ok(summaries)
    }

    /// Blocks until every command enqueued so far has completed
    pub fn finish(&self) -> Result<()> {
        trace!("finish");
        self.inner
            .queue
            .finish()
            .map_err(|e| ComputeError::Execution(format!("Failed to finish queue: {}", e)))
    }

    /// Submits enqueued commands to the device without waiting
    pub fn flush(&self) -> Result<()> {
        trace!("flush");
        self.inner
            .queue
            .flush()
            .map_err(|e| ComputeError::Execution(format!("Failed to flush queue: {}", e)))
    }

    /// Orders later commands after every earlier one without blocking the host
    pub fn barrier(&self) -> Result<()> {
        trace!("barrier");
        ocl::core::enqueue_barrier_with_wait_list(
            self.inner.queue.as_core(),
            None::<&CoreEvent>,
            None::<&mut CoreEvent>,
            None,
        )
        .map_err(|e| ComputeError::Execution(format!("Failed to enqueue barrier: {}", e)))
    }

    /// Get the device name
    pub fn device_name(&self) -> String {
        self.inner
            .device
            .name()
            .unwrap_or_else(|_| "Unknown".to_string())
    }

    /// Get the device vendor
    pub fn device_vendor(&self) -> String {
        self.inner
            .device
            .vendor()
            .unwrap_or_else(|_| "Unknown".to_string())
    }

    /// Class of the selected device
    pub fn device_kind(&self) -> DeviceKind {
        self.inner.device_kind
    }

    /// Get the OpenCL platform
    pub fn platform(&self) -> Platform {
        self.inner.platform
    }

    /// Get the OpenCL device
    pub fn ocl_device(&self) -> OclDevice {
        self.inner.device
    }

    /// Get the OpenCL context
    pub fn ocl_context(&self) -> &OclContext {
        &self.inner.context
    }

    /// Get the OpenCL command queue
    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// Get the compiled program
    pub fn program(&self) -> &Program {
        &self.inner.program
    }

    pub(crate) fn core_queue(&self) -> &ocl::core::CommandQueue {
        self.inner.queue.as_core()
    }
}

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("device", &self.device_name())
            .field("kind", &self.inner.device_kind)
            .finish()
    }
}

fn shared_property(shared: SharedContext) -> ContextPropertyValue {
    match shared {
        SharedContext::CglShareGroup(handle) => ContextPropertyValue::CglSharegroupKhr(handle),
        SharedContext::GlContext(handle) => ContextPropertyValue::GlContextKhr(handle),
    }
}

fn query_device_kind(device: &OclDevice) -> DeviceKind {
    match device.info(DeviceInfo::Type) {
        Ok(DeviceInfoResult::Type(device_type)) => DeviceKind::from_ocl(device_type),
        _ => DeviceKind::Default,
    }
}

/// Every installed platform
///
/// A loader without a vendor driver reports `CL_PLATFORM_NOT_FOUND_KHR`;
/// that surfaces as an `Acquisition` error.
fn platforms() -> Result<Vec<Platform>> {
    let ids = ocl::core::get_platform_ids().map_err(|e| {
        ComputeError::Acquisition(format!("Failed to query OpenCL platforms: {}", e))
    })?;
    Ok(ids.into_iter().map(Platform::new).collect())
}

fn candidate_platforms(platform_index: Option<usize>) -> Result<Vec<Platform>> {
    let platforms = platforms()?;
    if platforms.is_empty() {
        return Err(ComputeError::Acquisition("No OpenCL platforms found".into()));
    }
    match platform_index {
        None => Ok(platforms),
        Some(index) => platforms.get(index).map(|p| vec![*p]).ok_or_else(|| {
            ComputeError::Acquisition(format!(
                "Platform index {} out of range (available: {})",
                index,
                platforms.len()
            ))
        }),
    }
}

/// Picks the first device of the preferred class, falling back to any
/// device when the configuration allows it
fn select_device(config: &ContextConfig) -> Result<(Platform, OclDevice)> {
    let platforms = candidate_platforms(config.platform_index)?;
    let wanted = config.device_type.to_ocl();

    for platform in &platforms {
        match OclDevice::list(platform, Some(wanted)) {
            Ok(devices) => {
                let entries: Vec<OclDevice> = devices
                    .into_iter()
                    .take(config.device_entries as usize)
                    .collect();
                debug!(
                    "Platform {:?}: {} {} device(s) enumerated",
                    platform.name().unwrap_or_default(),
                    entries.len(),
                    config.device_type
                );
                if let Some(device) = entries.first() {
                    return Ok((*platform, *device));
                }
            }
            Err(e) => debug!(
                "Platform {:?} has no {} device: {}",
                platform.name().unwrap_or_default(),
                config.device_type,
                e
            ),
        }
    }

    if config.fallback_to_any_device && config.device_type != DeviceKind::All {
        for platform in &platforms {
            if let Ok(devices) = OclDevice::list_all(platform)
                && let Some(device) = devices.first()
            {
                warn!(
                    "No {} device available, falling back to {}",
                    config.device_type,
                    device.name().unwrap_or_else(|_| "Unknown".to_string())
                );
                return Ok((*platform, *device));
            }
        }
    }

    Err(ComputeError::Acquisition(format!(
        "No {} OpenCL device found",
        config.device_type
    )))
}
