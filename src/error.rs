//! Error taxonomy for session and registry operations.
//!
//! Three failure classes exist: usage errors caught before any backend call,
//! backend errors carrying the raw status code of the stage that failed, and
//! compile errors carrying the device compiler's build log verbatim.

use opencl3::error_codes::ClError;
use opencl3::types::cl_int;

use crate::status;

/// Errors that can occur while driving an OpenCL session.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The caller violated an API precondition. The backend was not touched.
    #[error("{0}")]
    Usage(String),

    /// Platform or device enumeration came up empty.
    #[error("no usable OpenCL device: {0}")]
    NoDevice(String),

    /// A backend call returned a non-success status code.
    #[error("{stage} failed: {status}")]
    Backend {
        /// The backend operation that failed.
        stage: &'static str,
        /// Raw status code as reported by the driver.
        code: cl_int,
        /// Symbolic rendering of `code`.
        status: String,
    },

    /// The device compiler rejected the program source. `log` is the build
    /// log exactly as the compiler produced it.
    #[error("program build failed:\n{log}")]
    Compile { log: String },
}

impl Error {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub(crate) fn backend(stage: &'static str, e: ClError) -> Self {
        Error::Backend {
            stage,
            code: e.0,
            status: status::describe(e.0),
        }
    }

    /// True for failures that must latch the session into its failed state.
    /// Usage errors leave the session where it was.
    pub(crate) fn is_latching(&self) -> bool {
        !matches!(self, Error::Usage(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_names_stage_and_status() {
        let err = Error::backend("clCreateBuffer", ClError(-4));
        let msg = err.to_string();
        assert!(msg.contains("clCreateBuffer"), "got: {msg}");
        assert!(msg.contains("CL_MEM_OBJECT_ALLOCATION_FAILURE"), "got: {msg}");
    }

    #[test]
    fn backend_error_keeps_unknown_codes_visible() {
        let err = Error::backend("clFinish", ClError(-9999));
        assert!(err.to_string().contains("unrecognized status code -9999"));
    }

    #[test]
    fn compile_error_preserves_log_verbatim() {
        let log = "1:3: error: use of undeclared identifier 'foo'\n".to_string();
        let err = Error::Compile { log: log.clone() };
        assert!(err.to_string().ends_with(&log));
    }

    #[test]
    fn only_usage_errors_skip_latching() {
        assert!(!Error::usage("bad index").is_latching());
        assert!(Error::backend("clFinish", ClError(-36)).is_latching());
        assert!(Error::Compile { log: String::new() }.is_latching());
        assert!(Error::NoDevice("no platforms".into()).is_latching());
    }
}
