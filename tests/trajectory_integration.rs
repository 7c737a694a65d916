//! Trajectory simulator integration tests
//!
//! Every test returns early when no OpenCL device is present.

mod common;

use std::io::Write;

use ballista::prelude::*;
use ballista::trajectory::{BUFFER_COUNT, PARAM_BASE_INDEX};
use common::{approx_eq, opencl_available, vec_approx_eq};

const GRAVITY: f32 = 9.80665;

/// `good` matches the trajectory layout; `short` lacks the last parameter;
/// `tiny` takes only three buffers; `local_slots` declares slots 3 and 4 as
/// local memory, which no buffer can bind to.
const LAYOUT_SOURCE: &str = r#"
    __kernel void good(__global float* a, __global float* b, __global float* c,
                       __global float* d, __global float* e,
                       const float t0, const float dt, const float v0, const float p) {
        size_t i = get_global_id(0);
        float t = t0 + (float)i * dt;
        a[i] = t; b[i] = v0; c[i] = p; d[i] = dt; e[i] = t * v0;
    }

    __kernel void short_params(__global float* a, __global float* b, __global float* c,
                               __global float* d, __global float* e,
                               const float t0, const float dt, const float v0) {
        size_t i = get_global_id(0);
        a[i] = -1.0f; b[i] = -1.0f; c[i] = -1.0f; d[i] = -1.0f; e[i] = t0 + dt + v0;
    }

    __kernel void local_slots(__global float* a, __global float* b, __global float* c,
                              __local float* d, __local float* e,
                              const float t0, const float dt, const float v0, const float p) {
        size_t i = get_global_id(0);
        a[i] = t0; b[i] = dt; c[i] = v0 + p;
    }

    __kernel void tiny(__global float* a, __global float* b, __global float* c) {
        size_t i = get_global_id(0);
        a[i] = 0.0f; b[i] = 0.0f; c[i] = 0.0f;
    }
"#;

fn builtin(time_max: f32, time_delta: f32) -> Option<TrajectorySimulator> {
    if !opencl_available() {
        return None;
    }
    Some(TrajectorySimulator::new(&ProgramSource::builtin(), time_max, time_delta).unwrap())
}

fn layout(time_max: f32, time_delta: f32) -> Option<TrajectorySimulator> {
    if !opencl_available() {
        return None;
    }
    let source = ProgramSource::Inline(LAYOUT_SOURCE.to_string());
    Some(TrajectorySimulator::new(&source, time_max, time_delta).unwrap())
}

fn snapshot(simulator: &TrajectorySimulator) -> Vec<Vec<f32>> {
    TrajectoryChannel::ALL
        .iter()
        .map(|c| simulator.channel(*c).to_vec())
        .collect()
}

#[test]
fn test_end_to_end_angle_launch() {
    let Some(mut simulator) = builtin(10.0, 1.0) else {
        return;
    };
    assert_eq!(simulator.sample_count(), 10);
    assert_eq!(simulator.global_work_size(), 16);

    simulator.acquire(KERNEL_ANGLE).unwrap();
    assert_eq!(simulator.state(), SimulatorState::KernelAcquired);
    assert_eq!(simulator.bind_status(), [true; BUFFER_COUNT]);

    simulator.compute(0.0, 50.0, 45.0).unwrap();
    assert_eq!(simulator.state(), SimulatorState::ResultsRead);

    for channel in TrajectoryChannel::ALL {
        let values = simulator.channel(channel);
        assert_eq!(values.len(), 10, "{} length", channel);
        assert!(values.iter().all(|v| v.is_finite()), "{}: {:?}", channel, values);
    }

    let theta = 45.0f32.to_radians();
    let ux = 50.0 * theta.cos();
    let uy = 50.0 * theta.sin();
    for i in 0..10 {
        let t = i as f32;
        let wy = uy - GRAVITY * t;
        assert!(approx_eq(simulator.position_x()[i], ux * t));
        assert!(approx_eq(simulator.position_y()[i], uy * t - 0.5 * GRAVITY * t * t));
        assert!(approx_eq(simulator.velocity_x()[i], ux));
        assert!(approx_eq(simulator.velocity_y()[i], wy));
        assert!(approx_eq(simulator.speed()[i], (ux * ux + wy * wy).sqrt()));
    }

    simulator.release();
}

#[test]
fn test_height_launch() {
    let Some(mut simulator) = builtin(2.0, 0.25) else {
        return;
    };
    assert_eq!(simulator.sample_count(), 8);
    assert_eq!(simulator.global_work_size(), 8);

    simulator.acquire(KERNEL_HEIGHT).unwrap();
    simulator.compute(0.0, 10.0, 100.0).unwrap();

    let expected_y: Vec<f32> = (0..8)
        .map(|i| {
            let t = i as f32 * 0.25;
            100.0 - 0.5 * GRAVITY * t * t
        })
        .collect();
    assert!(vec_approx_eq(simulator.position_y(), &expected_y));
    assert!(simulator.velocity_x().iter().all(|v| approx_eq(*v, 10.0)));
    assert!(approx_eq(simulator.speed()[0], 10.0));
}

#[test]
fn test_results_are_zero_before_compute() {
    let Some(mut simulator) = builtin(10.0, 1.0) else {
        return;
    };
    for values in snapshot(&simulator) {
        assert_eq!(values, vec![0.0; 10]);
    }

    simulator.acquire(KERNEL_ANGLE).unwrap();
    for values in snapshot(&simulator) {
        assert_eq!(values, vec![0.0; 10]);
    }
}

#[test]
fn test_compute_is_deterministic() {
    let Some(mut simulator) = builtin(8.0, 0.5) else {
        return;
    };
    simulator.acquire(KERNEL_ANGLE).unwrap();

    simulator.compute(0.0, 30.0, 60.0).unwrap();
    let first = snapshot(&simulator);
    simulator.compute(0.0, 30.0, 60.0).unwrap();
    let second = snapshot(&simulator);

    assert_eq!(first, second);
}

#[test]
fn test_padding_is_not_exposed() {
    let Some(mut simulator) = layout(3.0, 1.0) else {
        return;
    };
    assert_eq!(simulator.sample_count(), 3);
    assert_eq!(simulator.global_work_size(), 4);

    simulator.acquire("good").unwrap();
    simulator.compute(1.0, 2.0, 7.0).unwrap();

    assert_eq!(simulator.position_x(), &[1.0, 2.0, 3.0]);
    assert_eq!(simulator.position_y(), &[2.0, 2.0, 2.0]);
    assert_eq!(simulator.velocity_x(), &[7.0, 7.0, 7.0]);
    assert_eq!(simulator.velocity_y(), &[1.0, 1.0, 1.0]);
    assert_eq!(simulator.speed(), &[2.0, 4.0, 6.0]);
}

#[test]
fn test_log_has_one_record_per_sample() {
    let Some(mut simulator) = builtin(4.0, 0.5) else {
        return;
    };
    simulator.acquire(KERNEL_ANGLE).unwrap();
    simulator.compute(0.0, 50.0, 45.0).unwrap();

    let mut out = Vec::new();
    simulator.write_log(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines.first(), Some(&">> BEGIN"));
    assert_eq!(lines.last(), Some(&">> END"));
    assert_eq!(lines.len(), 2 + 4 * simulator.sample_count());

    let times: Vec<f32> = lines
        .iter()
        .filter_map(|line| line.strip_prefix(">>      Time: t = "))
        .map(|t| t.parse().unwrap())
        .collect();
    assert_eq!(times.len(), 8);
    for (i, t) in times.iter().enumerate() {
        assert!(approx_eq(*t, i as f32 * 0.5), "line {}: {}", i, t);
    }
}

#[test]
fn test_failed_binding_keeps_zero_results() {
    let Some(mut simulator) = layout(4.0, 1.0) else {
        return;
    };
    simulator.acquire("short_params").unwrap();

    let err = simulator.compute(0.0, 1.0, 2.0).unwrap_err();
    assert!(matches!(err, ComputeError::Binding(_)), "{:?}", err);
    assert!(err.is_recoverable());
    for values in snapshot(&simulator) {
        assert_eq!(values, vec![0.0; 4]);
    }
}

#[test]
fn test_failed_binding_keeps_previous_results() {
    let Some(mut simulator) = layout(4.0, 1.0) else {
        return;
    };
    simulator.acquire("good").unwrap();
    simulator.compute(0.0, 3.0, 5.0).unwrap();
    let before = snapshot(&simulator);

    simulator.acquire("short_params").unwrap();
    assert!(simulator.compute(9.0, 9.0, 9.0).is_err());
    assert_eq!(snapshot(&simulator), before);
    assert_ne!(simulator.state(), SimulatorState::ResultsRead);
}

#[test]
fn test_partial_binding_attempts_every_buffer() {
    let Some(mut simulator) = layout(4.0, 1.0) else {
        return;
    };

    let err = simulator.acquire("tiny").unwrap_err();
    assert_eq!(err, ComputeError::PartialBinding { failed: vec![3, 4] });
    assert_eq!(simulator.bind_status(), [true, true, true, false, false]);
    assert_eq!(simulator.state(), SimulatorState::KernelAcquired);

    let kernel = simulator.kernel().unwrap();
    assert!(kernel.is_bound(0) && kernel.is_bound(2));
    let err = simulator.compute(0.0, 1.0, 1.0).unwrap_err();
    assert!(matches!(err, ComputeError::Binding(_)), "{:?}", err);
    assert_eq!(snapshot(&simulator), vec![vec![0.0; 4]; BUFFER_COUNT]);

    simulator.acquire("good").unwrap();
    simulator.compute(0.0, 1.0, 1.0).unwrap();
    let kernel = simulator.kernel().unwrap();
    assert_eq!(kernel.parameter_indices(), vec![PARAM_BASE_INDEX, 6, 7, 8]);
}

#[test]
fn test_unbound_slots_fail_at_launch() {
    let Some(mut simulator) = layout(4.0, 1.0) else {
        return;
    };
    simulator.acquire("good").unwrap();
    simulator.compute(0.0, 3.0, 5.0).unwrap();
    let before = snapshot(&simulator);

    let err = simulator.acquire("local_slots").unwrap_err();
    assert_eq!(err, ComputeError::PartialBinding { failed: vec![3, 4] });
    assert_eq!(simulator.bind_status(), [true, true, true, false, false]);

    let err = simulator.compute(1.0, 1.0, 1.0).unwrap_err();
    assert!(matches!(err, ComputeError::Execution(_)), "{:?}", err);
    assert!(err.is_recoverable());
    assert_eq!(snapshot(&simulator), before);
    assert_eq!(simulator.state(), SimulatorState::ParametersBound);

    let kernel = simulator.kernel().unwrap();
    assert_eq!(kernel.unbound_indices(), vec![3, 4]);
    assert_eq!(kernel.parameter_indices(), vec![PARAM_BASE_INDEX, 6, 7, 8]);
}

#[test]
fn test_kernel_source_from_file() {
    if !opencl_available() {
        return;
    }
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(ballista::trajectory::KERNEL_SOURCE.as_bytes())
        .unwrap();

    let config = SimulationConfig {
        kernel_source: Some(file.path().to_path_buf()),
        time_max: 2.0,
        time_delta: 1.0,
        ..SimulationConfig::default()
    };
    let mut simulator = TrajectorySimulator::from_config(&config).unwrap();
    simulator.acquire(&config.kernel_name).unwrap();
    simulator
        .compute(config.initial_time, config.initial_speed, config.initial_param)
        .unwrap();
    assert_eq!(simulator.sample_count(), 2);
    assert!(simulator.speed().iter().all(|v| *v > 0.0));
}

#[test]
fn test_invalid_time_range_fails_construction() {
    if !opencl_available() {
        return;
    }
    let err = TrajectorySimulator::new(&ProgramSource::builtin(), 0.5, 1.0).unwrap_err();
    assert!(matches!(err, ComputeError::Configuration(_)));
}
