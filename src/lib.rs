//! clrun: host-side OpenCL session orchestration.
//!
//! clrun drives a compute kernel through the full host-side pipeline of an
//! OpenCL-class accelerator: platform and device discovery, context and
//! queue establishment, buffer/image allocation, program compilation,
//! argument binding, dispatch, and result retrieval. Every backend call is
//! synchronous and blocking; every acquired handle is owned by the session
//! and released exactly once.
//!
//! # Architecture
//!
//! - **status**: translation of raw status codes into symbolic names
//! - **error**: the usage / backend / compile error taxonomy
//! - **dtype**: element types and their byte widths
//! - **registry**: descriptor bookkeeping and kernel-argument binding
//! - **session**: the lifecycle state machine tying it all together
//!
//! # Quick start
//!
//! ```no_run
//! use clrun::prelude::*;
//! use clrun::dtype::bytes_of_f32;
//!
//! const SRC: &str = r#"
//! __kernel void double_it(__global const float *in, __global float *out) {
//!     size_t i = get_global_id(0);
//!     out[i] = in[i] * 2.0f;
//! }
//! "#;
//!
//! fn main() -> clrun::Result<()> {
//!     let mut session = Session::new()?;
//!     let input = bytes_of_f32(&[1.0, 2.0, 3.0, 4.0]);
//!     session.initialize(
//!         SRC,
//!         "double_it",
//!         &[4],
//!         &[InputDecl::buffer(&input, 4, DType::F32)],
//!         &[OutputDecl::buffer(4, DType::F32)],
//!     )?;
//!     session.execute()?;
//!     let doubled = session.read_result_f32(0)?;
//!     assert_eq!(doubled, vec![2.0, 4.0, 6.0, 8.0]);
//!     Ok(())
//! }
//! ```

pub mod dtype;
pub mod error;
pub mod registry;
pub mod session;
pub mod status;

pub use dtype::DType;
pub use error::{Error, Result};
pub use registry::{DeclKind, Direction, ImageDims, ImageFormat, InputDecl, OutputDecl, Registry};
pub use session::Session;

/// Prelude with the types most programs need.
pub mod prelude {
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::registry::{
        DeclKind, Direction, ImageDims, ImageFormat, InputDecl, OutputDecl,
    };
    pub use crate::session::Session;
    pub use crate::status::{describe as describe_status, status_name};
}
