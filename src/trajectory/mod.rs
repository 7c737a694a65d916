//! Trajectory simulation driven by one kernel and five buffers
//!
//! The simulator acquires a context, sizes five output buffers to the
//! sample count (padded to a power of two) and, on each run, binds four
//! scalar parameters after the buffers, executes the kernel over the padded
//! domain and reads the results back.
//!
//! ```text
//! Created -> KernelAcquired -> { ParametersBound -> Executed -> ResultsRead }*
//! ```

mod results;

pub use results::{CHANNEL_COUNT, TrajectoryChannel, TrajectoryResults};

use std::io::{self, Write};

use log::{debug, info, warn};

use crate::config::{ContextConfig, SimulationConfig};
use crate::error::{ComputeError, Result};
use crate::opencl::{BufferOptions, ComputeContext, Kernel, MemoryBuffer, ProgramSource};

/// Bundled OpenCL source with both trajectory kernels
pub const KERNEL_SOURCE: &str = include_str!("../../kernels/trajectory.cl");

/// Launch from the origin at an angle given in degrees
pub const KERNEL_ANGLE: &str = "trajectory_angle";
/// Horizontal launch from a height
pub const KERNEL_HEIGHT: &str = "trajectory_height";

/// Output buffers, bound to arguments `0..BUFFER_COUNT`
pub const BUFFER_COUNT: usize = CHANNEL_COUNT;
/// Scalar parameters, bound right after the buffers
pub const PARAM_COUNT: usize = 4;
/// Argument index of the first scalar parameter
pub const PARAM_BASE_INDEX: u32 = BUFFER_COUNT as u32;

const PARAM_INITIAL_TIME: usize = 0;
const PARAM_TIME_DELTA: usize = 1;
const PARAM_INITIAL_SPEED: usize = 2;
const PARAM_ANGLE_OR_HEIGHT: usize = 3;

/// Protocol stage reached by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    Created,
    KernelAcquired,
    ParametersBound,
    Executed,
    ResultsRead,
}

/// `floor(time_max / time_delta)`, rejecting inputs that give no samples
pub fn sample_count(time_max: f32, time_delta: f32) -> Result<usize> {
    if !time_max.is_finite() || !time_delta.is_finite() || time_max <= 0.0 || time_delta <= 0.0 {
        return Err(ComputeError::Configuration(format!(
            "Time range must be positive and finite (max {}, delta {})",
            time_max, time_delta
        )));
    }
    let count = (time_max / time_delta).floor();
    if count < 1.0 || count > u32::MAX as f32 {
        return Err(ComputeError::Configuration(format!(
            "Time range max {} with delta {} gives {} samples",
            time_max, time_delta, count
        )));
    }
    Ok(count as usize)
}

/// Samples projectile motion on an OpenCL device
pub struct TrajectorySimulator {
    // Declaration order is drop order: host arrays, buffers, kernel, context.
    results: TrajectoryResults,
    buffers: Vec<MemoryBuffer<f32>>,
    kernel: Option<Kernel>,
    context: ComputeContext,
    time_max: f32,
    params: [f32; PARAM_COUNT],
    global_work_size: usize,
    state: SimulatorState,
    bind_status: [bool; BUFFER_COUNT],
}

impl TrajectorySimulator {
    /// Builds a simulator on a CPU-class device when one exists
    pub fn new(source: &ProgramSource, time_max: f32, time_delta: f32) -> Result<Self> {
        Self::with_config(source, time_max, time_delta, &ContextConfig::cpu_preferred())
    }

    /// Builds a simulator from a full run description
    ///
    /// The kernel named in the configuration is not acquired yet.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        let source = match &config.kernel_source {
            Some(path) => ProgramSource::File(path.clone()),
            None => ProgramSource::builtin(),
        };
        Self::with_config(&source, config.time_max, config.time_delta, &config.context)
    }

    /// Builds a simulator with explicit context settings
    pub fn with_config(
        source: &ProgramSource,
        time_max: f32,
        time_delta: f32,
        context_config: &ContextConfig,
    ) -> Result<Self> {
        let count = sample_count(time_max, time_delta)?;
        let context = ComputeContext::acquire(context_config, source)?;

        let options = BufferOptions::default();
        let buffers = (0..BUFFER_COUNT as u32)
            .map(|index| MemoryBuffer::acquire(&context, index, count, &options))
            .collect::<Result<Vec<_>>>()?;
        let results = TrajectoryResults::new(count, time_delta)?;
        let global_work_size = buffers[0].actual_len();

        info!(
            "Trajectory simulator ready: {} samples, work size {} on {}",
            count,
            global_work_size,
            context.device_name()
        );

        let mut params = [0.0; PARAM_COUNT];
        params[PARAM_TIME_DELTA] = time_delta;

        Ok(Self {
            results,
            buffers,
            kernel: None,
            context,
            time_max,
            params,
            global_work_size,
            state: SimulatorState::Created,
            bind_status: [false; BUFFER_COUNT],
        })
    }

    /// Resolves `name` and binds the five buffers to arguments 0-4
    ///
    /// Every buffer bind is attempted even after one fails; the failed
    /// indices come back in [`ComputeError::PartialBinding`] and the kernel
    /// stays acquired.
    pub fn acquire(&mut self, name: &str) -> Result<()> {
        let mut kernel = Kernel::acquire(&self.context, name)?;
        kernel.set_work_dimension(1)?;

        let mut failed = Vec::new();
        for (slot, buffer) in self.bind_status.iter_mut().zip(&self.buffers) {
            match kernel.bind_buffer(buffer) {
                Ok(()) => *slot = true,
                Err(e) => {
                    warn!("{}", e);
                    *slot = false;
                    failed.push(buffer.index());
                }
            }
        }

        self.kernel = Some(kernel);
        self.state = SimulatorState::KernelAcquired;

        if failed.is_empty() {
            debug!("Kernel '{}' bound to {} buffers", name, BUFFER_COUNT);
            Ok(())
        } else {
            Err(ComputeError::PartialBinding { failed })
        }
    }

    /// Runs one simulation and reads the five arrays back
    ///
    /// On any failure the result arrays keep their previous contents.
    pub fn compute(&mut self, initial_time: f32, initial_speed: f32, param: f32) -> Result<()> {
        let Some(kernel) = self.kernel.as_mut() else {
            return Err(ComputeError::Binding("No kernel acquired".into()));
        };
        self.state = SimulatorState::KernelAcquired;

        self.params[PARAM_INITIAL_TIME] = initial_time;
        self.params[PARAM_INITIAL_SPEED] = initial_speed;
        self.params[PARAM_ANGLE_OR_HEIGHT] = param;

        for (offset, value) in self.params.iter().enumerate() {
            kernel.bind_scalar(PARAM_BASE_INDEX + offset as u32, value)?;
        }
        self.state = SimulatorState::ParametersBound;

        kernel.execute(self.global_work_size, None, None)?;
        self.state = SimulatorState::Executed;
        self.context.flush()?;

        let mut staged = Vec::with_capacity(BUFFER_COUNT);
        for buffer in &self.buffers {
            let mut values = vec![0.0f32; buffer.actual_len()];
            buffer.read(buffer.actual_len(), &mut values)?;
            staged.push(values);
        }
        self.results.commit(&staged)?;
        self.state = SimulatorState::ResultsRead;

        debug!(
            "Computed {} samples (t0 {}, v0 {}, param {})",
            self.results.sample_count(),
            initial_time,
            initial_speed,
            param
        );
        Ok(())
    }

    /// Prints the result dump to stdout
    pub fn log(&self) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_log(&mut out)?;
        out.flush()
    }

    /// Writes the result dump to `out`
    pub fn write_log<W: Write>(&self, out: &mut W) -> io::Result<()> {
        self.results.write_log(out)
    }

    pub fn results(&self) -> &TrajectoryResults {
        &self.results
    }

    pub fn position_x(&self) -> &[f32] {
        self.results.position_x()
    }

    pub fn position_y(&self) -> &[f32] {
        self.results.position_y()
    }

    pub fn velocity_x(&self) -> &[f32] {
        self.results.velocity_x()
    }

    pub fn velocity_y(&self) -> &[f32] {
        self.results.velocity_y()
    }

    pub fn speed(&self) -> &[f32] {
        self.results.speed()
    }

    pub fn channel(&self, channel: TrajectoryChannel) -> &[f32] {
        self.results.channel(channel)
    }

    pub fn state(&self) -> SimulatorState {
        self.state
    }

    pub fn sample_count(&self) -> usize {
        self.results.sample_count()
    }

    /// Padded work size the kernel executes over
    pub fn global_work_size(&self) -> usize {
        self.global_work_size
    }

    pub fn time_max(&self) -> f32 {
        self.time_max
    }

    pub fn time_delta(&self) -> f32 {
        self.params[PARAM_TIME_DELTA]
    }

    /// Initial time, time step, initial speed and angle-or-height
    pub fn parameters(&self) -> [f32; PARAM_COUNT] {
        self.params
    }

    /// Per-buffer outcome of the last [`acquire`](Self::acquire)
    pub fn bind_status(&self) -> [bool; BUFFER_COUNT] {
        self.bind_status
    }

    pub fn kernel(&self) -> Option<&Kernel> {
        self.kernel.as_ref()
    }

    pub fn context(&self) -> &ComputeContext {
        &self.context
    }

    /// Tears down host arrays, buffers, kernel and context in that order
    pub fn release(self) {
        let Self {
            results,
            buffers,
            kernel,
            context,
            ..
        } = self;
        drop(results);
        drop(buffers);
        drop(kernel);
        debug!("Trajectory simulator released on {}", context.device_name());
        drop(context);
    }
}

impl std::fmt::Debug for TrajectorySimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectorySimulator")
            .field("state", &self.state)
            .field("sample_count", &self.results.sample_count())
            .field("global_work_size", &self.global_work_size)
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10.0, 1.0, 10)]
    #[case(10.5, 1.0, 10)]
    #[case(4.0, 0.5, 8)]
    #[case(1.0, 0.25, 4)]
    #[case(100.0, 1.0, 100)]
    #[case(0.75, 0.5, 1)]
    fn test_sample_count(#[case] time_max: f32, #[case] time_delta: f32, #[case] expected: usize) {
        assert_eq!(sample_count(time_max, time_delta).unwrap(), expected);
    }

    #[rstest]
    #[case(0.0, 1.0)]
    #[case(10.0, 0.0)]
    #[case(-1.0, 1.0)]
    #[case(1.0, -0.5)]
    #[case(0.5, 1.0)]
    #[case(f32::NAN, 1.0)]
    #[case(f32::INFINITY, 1.0)]
    #[case(1.0, f32::NAN)]
    fn test_sample_count_rejects(#[case] time_max: f32, #[case] time_delta: f32) {
        let err = sample_count(time_max, time_delta).unwrap_err();
        assert!(matches!(err, ComputeError::Configuration(_)));
    }

    #[test]
    fn test_argument_layout() {
        assert_eq!(BUFFER_COUNT, 5);
        assert_eq!(PARAM_BASE_INDEX, 5);
        assert_eq!(PARAM_BASE_INDEX as usize + PARAM_COUNT, 9);
    }

    #[test]
    fn test_bundled_source_declares_kernels() {
        assert!(KERNEL_SOURCE.contains("__kernel void trajectory_angle"));
        assert!(KERNEL_SOURCE.contains("__kernel void trajectory_height"));
    }

    #[test]
    fn test_compute_before_acquire_fails_locally() {
        if !ComputeContext::is_available() {
            println!("OpenCL not available, skipping test");
            return;
        }

        let mut simulator = TrajectorySimulator::new(&ProgramSource::builtin(), 10.0, 1.0).unwrap();
        assert_eq!(simulator.state(), SimulatorState::Created);

        let err = simulator.compute(0.0, 50.0, 45.0).unwrap_err();
        assert!(matches!(err, ComputeError::Binding(_)));
        assert_eq!(simulator.state(), SimulatorState::Created);
        assert!(simulator.position_x().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_unknown_kernel_keeps_created_state() {
        if !ComputeContext::is_available() {
            println!("OpenCL not available, skipping test");
            return;
        }

        let mut simulator = TrajectorySimulator::new(&ProgramSource::builtin(), 4.0, 1.0).unwrap();
        let err = simulator.acquire("trajectory_missing").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(simulator.state(), SimulatorState::Created);
        assert!(simulator.kernel().is_none());
    }

    #[test]
    fn test_parameters_keep_time_delta() {
        if !ComputeContext::is_available() {
            println!("OpenCL not available, skipping test");
            return;
        }

        let mut simulator = TrajectorySimulator::new(&ProgramSource::builtin(), 2.0, 0.5).unwrap();
        assert_eq!(simulator.parameters(), [0.0, 0.5, 0.0, 0.0]);

        simulator.acquire(KERNEL_HEIGHT).unwrap();
        simulator.compute(1.0, 20.0, 100.0).unwrap();
        assert_eq!(simulator.parameters(), [1.0, 0.5, 20.0, 100.0]);
        assert_eq!(simulator.time_delta(), 0.5);
        assert_eq!(simulator.state(), SimulatorState::ResultsRead);
    }
}
