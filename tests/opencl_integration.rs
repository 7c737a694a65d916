//! OpenCL host layer integration tests

mod common;

use ballista::config::QueueConfig;
use ballista::opencl::{BlockingMode, HostPointer, Region};
use ballista::prelude::*;
use common::{setup_context, vec_approx_eq};

const SOURCE: &str = r#"
    __kernel void scale(__global float* data, const float factor) {
        size_t i = get_global_id(0);
        data[i] = data[i] * factor;
    }

    __kernel void add_one(__global float* data) {
        size_t i = get_global_id(0);
        data[i] = data[i] + 1.0f;
    }

    __kernel void blend(__global const float* weights,
                        __read_only image2d_t src,
                        __write_only image2d_t dst) {
        int2 p = (int2)(get_global_id(0), get_global_id(1));
        float4 c = read_imagef(src, CLK_NORMALIZED_COORDS_FALSE | CLK_FILTER_NEAREST, p);
        write_imagef(dst, p, c * weights[0]);
    }
"#;

#[test]
fn test_enqueue_chain_with_barrier() {
    let Some(context) = setup_context(SOURCE) else {
        return;
    };

    let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let buffer = MemoryBuffer::acquire_with_host(&context, 0, 16, &BufferOptions::new(), &data)
        .unwrap();

    let mut scale = Kernel::acquire(&context, "scale").unwrap();
    scale.bind_buffer(&buffer).unwrap();
    scale.bind_scalar(1, &2.0f32).unwrap();

    let mut add_one = Kernel::acquire(&context, "add_one").unwrap();
    add_one.bind_buffer(&buffer).unwrap();

    scale.enqueue(16, None, None).unwrap();
    context.barrier().unwrap();
    add_one.enqueue(16, None, None).unwrap();
    context.flush().unwrap();
    context.finish().unwrap();

    let mut out = vec![0.0f32; 16];
    buffer.read(16, &mut out).unwrap();
    let expected: Vec<f32> = data.iter().map(|v| v * 2.0 + 1.0).collect();
    assert!(vec_approx_eq(&out, &expected));
}

#[test]
fn test_out_of_order_queue() {
    if !common::opencl_available() {
        return;
    }
    let config = ContextConfig::cpu_preferred().with_queue(QueueConfig {
        out_of_order: true,
        profiling: true,
    });
    let context = match ComputeContext::acquire(
        &config,
        &ProgramSource::Inline(SOURCE.to_string()),
    ) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("Out-of-order queue unsupported: {}", e);
            return;
        }
    };

    let options = BufferOptions::new();
    let buffer = MemoryBuffer::acquire_with_host(&context, 0, 4, &options, &[1.0f32; 4]).unwrap();
    let mut kernel = Kernel::acquire(&context, "add_one").unwrap();
    kernel.bind_buffer(&buffer).unwrap();
    kernel.execute(4, None, None).unwrap();

    let mut out = vec![0.0f32; 4];
    buffer.read(4, &mut out).unwrap();
    assert_eq!(out, vec![2.0; 4]);
}

#[test]
fn test_dependents_keep_context_alive() {
    let Some(context) = setup_context(SOURCE) else {
        return;
    };

    let options = BufferOptions::new().with_blocking(BlockingMode::NonBlocking);
    let mut buffer = MemoryBuffer::<f32>::acquire(&context, 0, 3, &options).unwrap();
    let mut kernel = Kernel::acquire(&context, "add_one").unwrap();
    drop(context);

    buffer.write(3, &[4.0, 5.0, 6.0]).unwrap();
    kernel.bind_buffer(&buffer).unwrap();
    kernel.execute(buffer.actual_len(), None, None).unwrap();

    let mut out = vec![0.0f32; 4];
    buffer.read(4, &mut out).unwrap();
    assert_eq!(&out[..3], &[5.0, 6.0, 7.0]);
}

#[test]
fn test_sibling_allocation_failure_is_local() {
    let Some(context) = setup_context(SOURCE) else {
        return;
    };

    let options = BufferOptions::new();
    let good = MemoryBuffer::<f32>::acquire(&context, 0, 8, &options).unwrap();
    let err = MemoryBuffer::<f32>::acquire(&context, 1, 0, &options).unwrap_err();
    assert_eq!(err.kind(), ballista::ErrorKind::Allocation);
    assert!(!err.is_fatal());

    let mut out = vec![1.0f32; 8];
    good.read(8, &mut out).unwrap();
    assert_eq!(out, vec![0.0; 8]);
}

#[test]
fn test_buffers_and_images_share_argument_space() {
    let Some(context) = setup_context(SOURCE) else {
        return;
    };

    let options = BufferOptions::new().with_host_pointer(HostPointer::Copy);
    let weights = MemoryBuffer::acquire_with_host(&context, 0, 1, &options, &[0.5f32]).unwrap();
    let pixels = vec![0.8f32; 4 * 4 * 4];
    let src = ImageSurface::allocate(&context, 1, 4, 4, &BufferOptions::new(), Some(&pixels))
        .unwrap();
    let dst = ImageSurface::allocate(&context, 2, 4, 4, &BufferOptions::new(), None).unwrap();

    let mut kernel = Kernel::acquire(&context, "blend").unwrap();
    kernel.set_work_dimension(2).unwrap();
    kernel.bind_buffer(&weights).unwrap();
    kernel.bind_image(&src).unwrap();
    kernel.bind_image(&dst).unwrap();
    assert_eq!(kernel.memory_indices(), vec![0, 1, 2]);
    kernel.execute((4, 4), None, None).unwrap();

    let mut out = vec![0.0f32; pixels.len()];
    dst.read(&Region::full(4, 4), 0, &mut out).unwrap();
    assert!(vec_approx_eq(&out, &vec![0.4f32; pixels.len()]));
}
