//! Adds two float vectors on the GPU.
//!
//! Run with `RUST_LOG=debug cargo run --example vector_add` to watch the
//! pipeline stages.

use clrun::dtype::bytes_of_f32;
use clrun::prelude::*;

const SRC: &str = r#"
__kernel void vector_add(__global const float *a, __global const float *b,
                         __global float *out) {
    size_t i = get_global_id(0);
    out[i] = a[i] + b[i];
}
"#;

fn main() -> clrun::Result<()> {
    env_logger::init();

    let n = 8;
    let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..n).map(|i| (i * 10) as f32).collect();

    let mut session = Session::new()?;
    println!("device: {}", session.device_info());

    session.initialize(
        SRC,
        "vector_add",
        &[n],
        &[
            InputDecl::buffer(&bytes_of_f32(&a), n, DType::F32),
            InputDecl::buffer(&bytes_of_f32(&b), n, DType::F32),
        ],
        &[OutputDecl::buffer(n, DType::F32)],
    )?;
    session.log_info();

    session.execute()?;
    let sum = session.read_result_f32(0)?;

    for i in 0..n {
        println!("{} + {} = {}", a[i], b[i], sum[i]);
    }

    session.cleanup();
    Ok(())
}
