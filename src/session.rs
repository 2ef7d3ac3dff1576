//! The session: a state machine driving one kernel through the backend.
//!
//! A session owns every backend handle it acquires (context, queue, program,
//! kernel, and all registered memory objects) and walks a fixed pipeline:
//! construction establishes platform, device, context, and queue;
//! [`Session::initialize`] registers resources, builds the program, creates
//! the kernel, and binds every argument; after that only execute, read, and
//! update operations apply. A backend failure at any stage latches the
//! session into a failed state that refuses further state-advancing calls.
//!
//! Sessions are single-owner: drive one session from one thread at a time.
//! The command queue serializes device-side work, so no internal locking is
//! done here.

use std::fmt::Write as _;
use std::ptr;

use log::{debug, info, warn};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_GPU};
use opencl3::kernel::Kernel;
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_uint};

use crate::dtype::{f32_from_bytes, DType};
use crate::error::{Error, Result};
use crate::registry::{InputDecl, OutputDecl, Registry};

/// Where a session is in its lifecycle.
///
/// `Failed` is absorbing: once entered, only teardown and queries apply.
#[derive(Clone, PartialEq, Eq, Debug)]
enum SessionState {
    /// Context and queue exist; no program or resources yet.
    Created,
    /// The full pipeline succeeded; execute/read/update are available.
    Initialized,
    /// A backend stage failed. The reason is kept for queries.
    Failed(String),
}

/// A host-side OpenCL session: one device, one queue, one kernel.
pub struct Session {
    state: SessionState,
    program_name: String,
    global_work_size: Vec<usize>,
    // Field order doubles as release order on drop: kernel before program,
    // both before the registry's memory objects, those before queue and
    // context.
    kernel: Option<Kernel>,
    program: Option<Program>,
    registry: Registry,
    queue: CommandQueue,
    context: Context,
    device: Device,
    platform_name: String,
}

// A session may move between threads; concurrent use from several threads is
// excluded by contract, so no Sync.
unsafe impl Send for Session {}

impl Session {
    /// Opens a session on the first GPU device of the first platform that
    /// has one.
    pub fn new() -> Result<Self> {
        Self::with_device_index(0)
    }

    /// Opens a session on the `index`-th GPU device, counted across all
    /// platforms in enumeration order.
    pub fn with_device_index(index: usize) -> Result<Self> {
        let mut gpus = enumerate_gpus()?;
        if index >= gpus.len() {
            return Err(Error::NoDevice(format!(
                "device index {index} out of range (found {} devices)",
                gpus.len()
            )));
        }
        let (platform_name, device_id) = gpus.swap_remove(index);
        let device = Device::new(device_id);
        debug!("selected device {index} on platform '{platform_name}'");

        let context =
            Context::from_device(&device).map_err(|e| Error::backend("clCreateContext", e))?;
        debug!("created context");

        let queue = CommandQueue::create_default(&context, 0)
            .map_err(|e| Error::backend("clCreateCommandQueueWithProperties", e))?;
        debug!("created command queue");

        let session = Session {
            state: SessionState::Created,
            program_name: String::new(),
            global_work_size: Vec::new(),
            kernel: None,
            program: None,
            registry: Registry::new(),
            queue,
            context,
            device,
            platform_name,
        };
        info!("session ready on {}", session.device_info());
        Ok(session)
    }

    /// Registers all inputs and outputs, builds the program from `source`,
    /// creates the kernel named `kernel_name`, and binds every registered
    /// slot to its argument index.
    ///
    /// Declaration errors are reported before any backend call and leave the
    /// session re-initializable. A backend failure latches the failed state;
    /// on a build failure the device compiler's log is returned verbatim in
    /// [`Error::Compile`].
    pub fn initialize(
        &mut self,
        source: &str,
        kernel_name: &str,
        global_work_size: &[usize],
        inputs: &[InputDecl],
        outputs: &[OutputDecl],
    ) -> Result<()> {
        match &self.state {
            SessionState::Created => {}
            SessionState::Initialized => {
                return Err(Error::usage("session is already initialized"));
            }
            SessionState::Failed(reason) => {
                return Err(Error::usage(format!(
                    "session is in a failed state: {reason}"
                )));
            }
        }
        if source.is_empty() {
            return Err(Error::usage("program source must not be empty"));
        }
        if kernel_name.is_empty() {
            return Err(Error::usage("kernel name must not be empty"));
        }
        validate_work_size(global_work_size)?;
        for (position, decl) in inputs.iter().enumerate() {
            decl.validate(position)?;
        }
        for (position, decl) in outputs.iter().enumerate() {
            decl.validate(position)?;
        }

        match self.build_pipeline(source, kernel_name, inputs, outputs) {
            Ok(()) => {
                self.program_name = kernel_name.to_string();
                self.global_work_size = global_work_size.to_vec();
                self.state = SessionState::Initialized;
                info!(
                    "initialized kernel '{kernel_name}': {} input(s), {} output(s), work size {:?}",
                    self.registry.input_count(),
                    self.registry.output_count(),
                    global_work_size
                );
                Ok(())
            }
            Err(e) => {
                warn!("initialization failed: {e}");
                self.state = SessionState::Failed(e.to_string());
                // Partially registered slots are released now rather than
                // lingering until drop.
                self.kernel = None;
                self.program = None;
                self.registry.clear();
                Err(e)
            }
        }
    }

    fn build_pipeline(
        &mut self,
        source: &str,
        kernel_name: &str,
        inputs: &[InputDecl],
        outputs: &[OutputDecl],
    ) -> Result<()> {
        for decl in inputs {
            self.registry.register_input(&self.context, decl)?;
        }
        for decl in outputs {
            self.registry.register_output(&self.context, decl)?;
        }

        let mut program = Program::create_from_sources(&self.context, &[source])
            .map_err(|e| Error::backend("clCreateProgramWithSource", e))?;
        debug!("created program from source");

        if let Err(e) = program.build(&[self.device.id()], "") {
            // The build log is only fetched on failure; it is the compiler's
            // own error text and is passed through untouched.
            let log = program.get_build_log(self.device.id()).unwrap_or_else(|_| {
                format!("build log unavailable ({})", crate::status::describe(e.0))
            });
            return Err(Error::Compile { log });
        }
        debug!("built program");

        let kernel =
            Kernel::create(&program, kernel_name).map_err(|e| Error::backend("clCreateKernel", e))?;
        debug!("created kernel '{kernel_name}'");

        self.registry.bind_all(&kernel)?;

        self.program = Some(program);
        self.kernel = Some(kernel);
        Ok(())
    }

    /// Enqueues the kernel over the declared work size and blocks until the
    /// device reports completion.
    pub fn execute(&mut self) -> Result<()> {
        self.guard("execute")?;
        let Some(kernel) = self.kernel.as_ref() else {
            return Err(Error::usage("execute: kernel has been released"));
        };
        let work_dim = self.global_work_size.len() as cl_uint;
        let enqueued = unsafe {
            self.queue
                .enqueue_nd_range_kernel(
                    kernel.get(),
                    work_dim,
                    ptr::null(),
                    self.global_work_size.as_ptr(),
                    ptr::null(),
                    &[],
                )
                .map(|_| ())
        };
        if let Err(e) = enqueued {
            return Err(self.latch(Error::backend("clEnqueueNDRangeKernel", e)));
        }
        if let Err(e) = self.queue.finish() {
            return Err(self.latch(Error::backend("clFinish", e)));
        }
        debug!("executed '{}' over {:?}", self.program_name, self.global_work_size);
        Ok(())
    }

    /// Blocking device-to-host copy of the `ordinal`-th output.
    pub fn read_result(&mut self, ordinal: usize) -> Result<Vec<u8>> {
        self.guard("read_result")?;
        let result = self.registry.read_output(&self.queue, ordinal);
        match result {
            Ok(data) => Ok(data),
            Err(e) => Err(self.latch(e)),
        }
    }

    /// Reads the `ordinal`-th output as floats. The output must have been
    /// declared with element type `float`.
    pub fn read_result_f32(&mut self, ordinal: usize) -> Result<Vec<f32>> {
        self.guard("read_result_f32")?;
        let dtype = self.registry.output(ordinal)?.dtype();
        if dtype != DType::F32 {
            return Err(Error::usage(format!(
                "output {ordinal} holds {dtype} elements, not float"
            )));
        }
        let bytes = self.read_result(ordinal)?;
        Ok(f32_from_bytes(&bytes))
    }

    /// Runs the kernel and reads one output in a single call.
    pub fn execute_and_read(&mut self, ordinal: usize) -> Result<Vec<u8>> {
        self.execute()?;
        self.read_result(ordinal)
    }

    /// Blocking host-to-device refresh of the `ordinal`-th input. The slot
    /// keeps its argument binding, so the next [`Session::execute`] sees the
    /// new data without any re-binding.
    pub fn update_buffer(&mut self, ordinal: usize, data: &[u8]) -> Result<()> {
        self.guard("update_buffer")?;
        let result = self.registry.write_input(&self.queue, ordinal, data);
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.latch(e)),
        }
    }

    /// Overwrites the kernel argument at `index` with a scalar float.
    ///
    /// Intended for value arguments that follow the registered buffer slots
    /// in the kernel signature.
    pub fn set_scalar_arg(&mut self, index: u32, value: f32) -> Result<()> {
        self.guard("set_scalar_arg")?;
        if (index as usize) < self.registry.len() {
            return Err(Error::usage(format!(
                "argument {index} is bound to a registered slot; scalar arguments start at {}",
                self.registry.len()
            )));
        }
        let Some(kernel) = self.kernel.as_ref() else {
            return Err(Error::usage("set_scalar_arg: kernel has been released"));
        };
        let bound = unsafe { kernel.set_arg(index as cl_uint, &value).map(|_| ()) };
        if let Err(e) = bound {
            return Err(self.latch(Error::backend("clSetKernelArg", e)));
        }
        debug!("set scalar argument {index} = {value}");
        Ok(())
    }

    /// Replaces the work size used by subsequent [`Session::execute`] calls.
    pub fn set_global_work_size(&mut self, global_work_size: &[usize]) -> Result<()> {
        if let SessionState::Failed(reason) = &self.state {
            return Err(Error::usage(format!(
                "session is in a failed state: {reason}"
            )));
        }
        validate_work_size(global_work_size)?;
        self.global_work_size = global_work_size.to_vec();
        Ok(())
    }

    /// Releases the kernel, program, and all registered memory objects, in
    /// that order. Safe to call more than once: each handle is released at
    /// most once and a missing handle is skipped. The queue and context are
    /// released when the session is dropped.
    pub fn cleanup(&mut self) {
        if self.kernel.take().is_some() {
            debug!("released kernel");
        }
        if self.program.take().is_some() {
            debug!("released program");
        }
        let slots = self.registry.len();
        self.registry.clear();
        if slots > 0 {
            debug!("released {slots} memory object(s)");
        }
        self.program_name.clear();
        self.global_work_size.clear();
        if self.state == SessionState::Initialized {
            self.state = SessionState::Created;
        }
    }

    /// True once the whole initialization pipeline has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.state == SessionState::Initialized
    }

    /// True once any backend stage has failed.
    pub fn error_encountered(&self) -> bool {
        matches!(self.state, SessionState::Failed(_))
    }

    /// The failure that latched the session, if any.
    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            SessionState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Device and platform naming for diagnostics.
    pub fn device_info(&self) -> String {
        let name = self.device.name().unwrap_or_else(|_| "Unknown".into());
        let vendor = self.device.vendor().unwrap_or_else(|_| "Unknown".into());
        format!("{name} ({vendor}) [{}]", self.platform_name)
    }

    /// Name of the kernel entry point, empty before initialization.
    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    pub fn global_work_size(&self) -> &[usize] {
        &self.global_work_size
    }

    pub fn input_count(&self) -> usize {
        self.registry.input_count()
    }

    pub fn output_count(&self) -> usize {
        self.registry.output_count()
    }

    /// Multi-line summary of the session: device, state, and slot table.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "device: {}", self.device_info());
        match &self.state {
            SessionState::Created => {
                let _ = writeln!(out, "state: created (not initialized)");
            }
            SessionState::Failed(reason) => {
                let _ = writeln!(out, "state: failed ({reason})");
            }
            SessionState::Initialized => {
                let _ = writeln!(out, "state: initialized");
                let _ = writeln!(out, "kernel: {}", self.program_name);
                let _ = writeln!(out, "global work size: {:?}", self.global_work_size);
                for slot in self.registry.slots() {
                    let _ = writeln!(
                        out,
                        "  arg {}: {} {} x {} ({} bytes){}",
                        slot.index(),
                        slot.direction(),
                        slot.numel(),
                        slot.dtype(),
                        slot.byte_size(),
                        if slot.is_image() { " [image]" } else { "" }
                    );
                }
            }
        }
        out
    }

    /// Logs [`Session::describe`] at info level.
    pub fn log_info(&self) {
        for line in self.describe().lines() {
            info!("{line}");
        }
    }

    /// Entry guard shared by all post-initialization operations.
    fn guard(&self, op: &str) -> Result<()> {
        match &self.state {
            SessionState::Initialized => Ok(()),
            SessionState::Created => {
                Err(Error::usage(format!("{op}: session is not initialized")))
            }
            SessionState::Failed(reason) => Err(Error::usage(format!(
                "{op}: session is in a failed state: {reason}"
            ))),
        }
    }

    /// Records a failure so later state-advancing calls refuse to run.
    /// Usage errors pass through without latching.
    fn latch(&mut self, e: Error) -> Error {
        if e.is_latching() {
            warn!("backend failure: {e}");
            self.state = SessionState::Failed(e.to_string());
        }
        e
    }
}

/// Enumerates GPU devices across all platforms, in platform order.
fn enumerate_gpus() -> Result<Vec<(String, cl_device_id)>> {
    let platforms = get_platforms().map_err(|e| Error::backend("clGetPlatformIDs", e))?;
    if platforms.is_empty() {
        return Err(Error::NoDevice("no OpenCL platforms found".into()));
    }
    let mut gpus = Vec::new();
    for platform in &platforms {
        let platform_name = platform
            .name()
            .unwrap_or_else(|_| "unknown platform".into());
        let device_ids = platform.get_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
        debug!("platform '{platform_name}': {} GPU device(s)", device_ids.len());
        for id in device_ids {
            gpus.push((platform_name.clone(), id));
        }
    }
    if gpus.is_empty() {
        return Err(Error::NoDevice("no GPU devices on any platform".into()));
    }
    Ok(gpus)
}

fn validate_work_size(global_work_size: &[usize]) -> Result<()> {
    let dims = global_work_size.len();
    if dims == 0 || dims > 3 {
        return Err(Error::usage(format!(
            "global work size must have 1 to 3 dimensions, got {dims}"
        )));
    }
    if global_work_size.iter().any(|&extent| extent == 0) {
        return Err(Error::usage(format!(
            "global work size extents must be non-zero, got {global_work_size:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[1])]
    #[case(&[4])]
    #[case(&[2, 2])]
    #[case(&[8, 4, 2])]
    fn work_sizes_within_bounds_pass(#[case] gws: &[usize]) {
        assert!(validate_work_size(gws).is_ok());
    }

    #[rstest]
    #[case(&[])]
    #[case(&[1, 1, 1, 1])]
    #[case(&[0])]
    #[case(&[4, 0])]
    #[case(&[1, 2, 0])]
    fn work_sizes_out_of_bounds_fail(#[case] gws: &[usize]) {
        let err = validate_work_size(gws).unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "got: {err:?}");
    }
}
