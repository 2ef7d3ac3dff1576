//! SAXPY (`out = a*x + y`) with the scale factor passed as a scalar kernel
//! argument, re-run for several values of `a` without rebuilding anything.

use clrun::dtype::bytes_of_f32;
use clrun::prelude::*;

const SRC: &str = r#"
__kernel void saxpy(__global const float *x, __global const float *y,
                    __global float *out, float a) {
    size_t i = get_global_id(0);
    out[i] = a * x[i] + y[i];
}
"#;

fn main() -> clrun::Result<()> {
    env_logger::init();

    let n = 4;
    let x = [1.0f32, 2.0, 3.0, 4.0];
    let y = [100.0f32, 100.0, 100.0, 100.0];

    let mut session = Session::new()?;
    println!("device: {}", session.device_info());

    session.initialize(
        SRC,
        "saxpy",
        &[n],
        &[
            InputDecl::buffer(&bytes_of_f32(&x), n, DType::F32),
            InputDecl::buffer(&bytes_of_f32(&y), n, DType::F32),
        ],
        &[OutputDecl::buffer(n, DType::F32)],
    )?;

    // The three buffer slots occupy arguments 0..=2; the scalar sits at 3.
    for a in [0.5f32, 2.0, 10.0] {
        session.set_scalar_arg(3, a)?;
        session.execute()?;
        let out = session.read_result_f32(0)?;
        println!("a = {a}: {out:?}");
    }

    session.cleanup();
    Ok(())
}
