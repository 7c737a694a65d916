//! Common test utilities for device integration tests

#![allow(dead_code)]

use ballista::{ComputeContext, ContextConfig, ProgramSource};

pub const EPSILON: f32 = 1e-4;

pub fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() <= EPSILON * a.abs().max(b.abs()).max(1.0)
}

pub fn vec_approx_eq(a: &[f32], b: &[f32]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(x, y)| approx_eq(*x, *y))
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// True when a device exists; prints a skip notice otherwise
pub fn opencl_available() -> bool {
    init_logger();
    if ComputeContext::is_available() {
        true
    } else {
        eprintln!("OpenCL device not available, skipping test");
        false
    }
}

/// Acquires a CPU-preferred context for `source`
pub fn setup_context(source: &str) -> Option<ComputeContext> {
    if !opencl_available() {
        return None;
    }
    match ComputeContext::acquire(
        &ContextConfig::cpu_preferred(),
        &ProgramSource::Inline(source.to_string()),
    ) {
        Ok(context) => Some(context),
        Err(e) => {
            eprintln!("Failed to acquire context: {}", e);
            None
        }
    }
}
