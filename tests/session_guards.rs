//! Guard and usage-error behavior: everything here must fail before any
//! backend allocation happens.
//!
//! These tests need a device to open a session but never compile or run a
//! kernel; they are skipped when no OpenCL GPU is available.

use clrun::dtype::bytes_of_f32;
use clrun::{DType, Error, InputDecl, OutputDecl, Session};

const IDENTITY_SRC: &str = r#"
__kernel void identity(__global const float *in, __global float *out) {
    size_t i = get_global_id(0);
    out[i] = in[i];
}
"#;

fn setup() -> Option<Session> {
    let _ = env_logger::builder().is_test(true).try_init();
    match Session::new() {
        Ok(session) => Some(session),
        Err(e) => {
            eprintln!("OpenCL device not available, skipping test: {e}");
            None
        }
    }
}

#[test]
fn execute_before_initialize_is_a_usage_error() {
    let Some(mut session) = setup() else { return };

    let err = session.execute().unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
    assert!(!session.is_initialized());
    // A usage error must not latch the failed state.
    assert!(!session.error_encountered());
}

#[test]
fn read_result_before_initialize_is_a_usage_error() {
    let Some(mut session) = setup() else { return };

    let err = session.read_result(0).unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
    assert!(!session.error_encountered());
}

#[test]
fn update_buffer_before_initialize_is_a_usage_error() {
    let Some(mut session) = setup() else { return };

    let err = session.update_buffer(0, &[0u8; 4]).unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
}

#[test]
fn mismatched_input_declaration_fails_without_backend_calls() {
    let Some(mut session) = setup() else { return };

    // 3 floats of data declared as 4 elements.
    let data = bytes_of_f32(&[1.0, 2.0, 3.0]);
    let err = session
        .initialize(
            IDENTITY_SRC,
            "identity",
            &[4],
            &[InputDecl::buffer(&data, 4, DType::F32)],
            &[OutputDecl::buffer(4, DType::F32)],
        )
        .unwrap_err();

    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
    assert!(!session.is_initialized());
    assert!(!session.error_encountered());
    assert_eq!(session.input_count(), 0);
    assert_eq!(session.output_count(), 0);
}

#[test]
fn zero_element_output_declaration_is_rejected() {
    let Some(mut session) = setup() else { return };

    let data = bytes_of_f32(&[1.0]);
    let err = session
        .initialize(
            IDENTITY_SRC,
            "identity",
            &[1],
            &[InputDecl::buffer(&data, 1, DType::F32)],
            &[OutputDecl::buffer(0, DType::F32)],
        )
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
    assert!(!session.is_initialized());
}

#[test]
fn work_size_dimension_bounds_are_enforced() {
    let Some(mut session) = setup() else { return };

    let data = bytes_of_f32(&[1.0, 2.0]);
    let inputs = [InputDecl::buffer(&data, 2, DType::F32)];
    let outputs = [OutputDecl::buffer(2, DType::F32)];

    for bad in [&[][..], &[2, 2, 2, 2][..], &[0][..], &[2, 0][..]] {
        let err = session
            .initialize(IDENTITY_SRC, "identity", bad, &inputs, &outputs)
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "work size {bad:?}: {err:?}");
        assert!(!session.is_initialized());
    }
}

#[test]
fn empty_source_or_kernel_name_is_rejected() {
    let Some(mut session) = setup() else { return };

    let data = bytes_of_f32(&[1.0]);
    let inputs = [InputDecl::buffer(&data, 1, DType::F32)];
    let outputs = [OutputDecl::buffer(1, DType::F32)];

    let err = session
        .initialize("", "identity", &[1], &inputs, &outputs)
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");

    let err = session
        .initialize(IDENTITY_SRC, "", &[1], &inputs, &outputs)
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
    assert!(!session.error_encountered());
}

#[test]
fn usage_errors_leave_the_session_reinitializable() {
    let Some(mut session) = setup() else { return };

    let data = bytes_of_f32(&[1.0, 2.0, 3.0, 4.0]);
    // First attempt: bad declaration.
    let bad = session.initialize(
        IDENTITY_SRC,
        "identity",
        &[4],
        &[InputDecl::buffer(&data, 3, DType::F32)],
        &[OutputDecl::buffer(4, DType::F32)],
    );
    assert!(bad.is_err());

    // Second attempt with a correct declaration must succeed.
    session
        .initialize(
            IDENTITY_SRC,
            "identity",
            &[4],
            &[InputDecl::buffer(&data, 4, DType::F32)],
            &[OutputDecl::buffer(4, DType::F32)],
        )
        .expect("re-initialization after a usage error");
    assert!(session.is_initialized());
}

#[test]
fn double_initialize_is_rejected() {
    let Some(mut session) = setup() else { return };

    let data = bytes_of_f32(&[1.0, 2.0]);
    let inputs = [InputDecl::buffer(&data, 2, DType::F32)];
    let outputs = [OutputDecl::buffer(2, DType::F32)];

    session
        .initialize(IDENTITY_SRC, "identity", &[2], &inputs, &outputs)
        .expect("first initialization");

    let err = session
        .initialize(IDENTITY_SRC, "identity", &[2], &inputs, &outputs)
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
    assert!(session.is_initialized());
}
