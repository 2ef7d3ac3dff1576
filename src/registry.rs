//! Device memory registry: descriptor bookkeeping and argument binding.
//!
//! Every buffer or image a session allocates is recorded here as a [`Slot`].
//! Slots are assigned a global argument index in registration order, inputs
//! first and outputs after them, contiguous from zero. That index is the
//! kernel argument position the slot is bound to, so the convention "all
//! inputs, then all outputs, in declaration order" is enforced at
//! registration time rather than assumed at dispatch time. Indices are never
//! reused; the registry only ever grows or is cleared as a whole.

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use log::debug;
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::kernel::Kernel;
use opencl3::memory::{
    cl_image_desc, cl_image_format, cl_mem_flags, Buffer as ClBuffer, Image, CL_FLOAT,
    CL_MEM_COPY_HOST_PTR, CL_MEM_OBJECT_IMAGE2D, CL_MEM_OBJECT_IMAGE3D, CL_MEM_READ_ONLY,
    CL_MEM_WRITE_ONLY, CL_R, CL_RGBA, CL_UNORM_INT8,
};
use opencl3::types::{cl_uint, CL_BLOCKING};

use crate::dtype::DType;
use crate::error::{Error, Result};

/// Whether a slot feeds the kernel or receives its results.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Channel layout and storage type of an image slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImageFormat {
    /// One float channel per texel.
    RF32,
    /// Four float channels per texel.
    RgbaF32,
    /// Four 8-bit channels per texel, read as normalized floats.
    RgbaUnorm8,
}

impl ImageFormat {
    pub fn channels(&self) -> usize {
        match self {
            ImageFormat::RF32 => 1,
            ImageFormat::RgbaF32 | ImageFormat::RgbaUnorm8 => 4,
        }
    }

    /// Storage type of a single channel.
    pub fn channel_dtype(&self) -> DType {
        match self {
            ImageFormat::RF32 | ImageFormat::RgbaF32 => DType::F32,
            ImageFormat::RgbaUnorm8 => DType::U8,
        }
    }

    /// Bytes per texel.
    pub fn texel_size(&self) -> usize {
        self.channels() * self.channel_dtype().size()
    }

    fn cl_format(&self) -> cl_image_format {
        let (order, data_type) = match self {
            ImageFormat::RF32 => (CL_R, CL_FLOAT),
            ImageFormat::RgbaF32 => (CL_RGBA, CL_FLOAT),
            ImageFormat::RgbaUnorm8 => (CL_RGBA, CL_UNORM_INT8),
        };
        cl_image_format {
            image_channel_order: order,
            image_channel_data_type: data_type,
        }
    }
}

/// Extent of an image slot. `depth == 1` means a 2D image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ImageDims {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl ImageDims {
    pub fn is_3d(&self) -> bool {
        self.depth > 1
    }

    pub fn texel_count(&self) -> usize {
        self.width * self.height * self.depth
    }
}

/// What kind of device object a declaration asks for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeclKind {
    Buffer,
    Image(ImageFormat, ImageDims),
}

/// Declaration of one input resource: host data plus its device-side shape.
#[derive(Clone, Copy, Debug)]
pub struct InputDecl<'a> {
    pub data: &'a [u8],
    pub numel: usize,
    pub dtype: DType,
    pub kind: DeclKind,
}

impl<'a> InputDecl<'a> {
    /// A plain buffer of `numel` elements of `dtype`, initialized from `data`.
    pub fn buffer(data: &'a [u8], numel: usize, dtype: DType) -> Self {
        InputDecl {
            data,
            numel,
            dtype,
            kind: DeclKind::Buffer,
        }
    }

    /// A 2D image of `width * height` texels, initialized from `data`.
    pub fn image2d(data: &'a [u8], format: ImageFormat, width: usize, height: usize) -> Self {
        let dims = ImageDims {
            width,
            height,
            depth: 1,
        };
        InputDecl {
            data,
            numel: dims.texel_count(),
            dtype: format.channel_dtype(),
            kind: DeclKind::Image(format, dims),
        }
    }

    /// A 3D image of `width * height * depth` texels, initialized from `data`.
    pub fn image3d(
        data: &'a [u8],
        format: ImageFormat,
        width: usize,
        height: usize,
        depth: usize,
    ) -> Self {
        let dims = ImageDims {
            width,
            height,
            depth,
        };
        InputDecl {
            data,
            numel: dims.texel_count(),
            dtype: format.channel_dtype(),
            kind: DeclKind::Image(format, dims),
        }
    }

    pub(crate) fn byte_size(&self) -> usize {
        decl_byte_size(self.numel, self.dtype, &self.kind)
    }

    /// Rejects declarations whose element count, data length, and kind
    /// disagree. Runs before any backend call.
    pub(crate) fn validate(&self, position: usize) -> Result<()> {
        validate_decl(Direction::Input, position, self.numel, self.dtype, &self.kind)?;
        let expected = self.byte_size();
        if self.data.len() != expected {
            return Err(Error::usage(format!(
                "input {position}: declared {} element(s) of {} ({expected} bytes) but got {} bytes of data",
                self.numel,
                self.dtype,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Declaration of one output resource. Device memory is left uninitialized.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OutputDecl {
    pub numel: usize,
    pub dtype: DType,
    pub kind: DeclKind,
}

impl OutputDecl {
    /// A plain buffer of `numel` elements of `dtype`.
    pub fn buffer(numel: usize, dtype: DType) -> Self {
        OutputDecl {
            numel,
            dtype,
            kind: DeclKind::Buffer,
        }
    }

    /// A 2D image of `width * height` texels.
    pub fn image2d(format: ImageFormat, width: usize, height: usize) -> Self {
        let dims = ImageDims {
            width,
            height,
            depth: 1,
        };
        OutputDecl {
            numel: dims.texel_count(),
            dtype: format.channel_dtype(),
            kind: DeclKind::Image(format, dims),
        }
    }

    /// A 3D image of `width * height * depth` texels.
    pub fn image3d(format: ImageFormat, width: usize, height: usize, depth: usize) -> Self {
        let dims = ImageDims {
            width,
            height,
            depth,
        };
        OutputDecl {
            numel: dims.texel_count(),
            dtype: format.channel_dtype(),
            kind: DeclKind::Image(format, dims),
        }
    }

    pub(crate) fn byte_size(&self) -> usize {
        decl_byte_size(self.numel, self.dtype, &self.kind)
    }

    pub(crate) fn validate(&self, position: usize) -> Result<()> {
        validate_decl(Direction::Output, position, self.numel, self.dtype, &self.kind)
    }
}

fn decl_byte_size(numel: usize, dtype: DType, kind: &DeclKind) -> usize {
    match kind {
        DeclKind::Buffer => numel * dtype.size(),
        DeclKind::Image(format, dims) => dims.texel_count() * format.texel_size(),
    }
}

fn validate_decl(
    direction: Direction,
    position: usize,
    numel: usize,
    dtype: DType,
    kind: &DeclKind,
) -> Result<()> {
    if numel == 0 {
        return Err(Error::usage(format!(
            "{direction} {position}: element count must be non-zero"
        )));
    }
    if let DeclKind::Image(format, dims) = kind {
        if dims.width == 0 || dims.height == 0 || dims.depth == 0 {
            return Err(Error::usage(format!(
                "{direction} {position}: image dimensions must be non-zero, got {}x{}x{}",
                dims.width, dims.height, dims.depth
            )));
        }
        if numel != dims.texel_count() {
            return Err(Error::usage(format!(
                "{direction} {position}: element count {numel} does not match {}x{}x{} image extent",
                dims.width, dims.height, dims.depth
            )));
        }
        if dtype != format.channel_dtype() {
            return Err(Error::usage(format!(
                "{direction} {position}: element type {dtype} does not match image format channel type {}",
                format.channel_dtype()
            )));
        }
    }
    Ok(())
}

/// The device-side object backing a slot.
#[derive(Debug)]
pub(crate) enum DeviceMem {
    Buffer(ClBuffer<u8>),
    Image(Image, ImageFormat, ImageDims),
}

/// One registered buffer or image: its argument index, shape, and handle.
///
/// The handle is owned; dropping the slot releases the device object.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    direction: Direction,
    numel: usize,
    dtype: DType,
    byte_size: usize,
    mem: DeviceMem,
}

impl Slot {
    /// Global argument index this slot is bound to.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_image(&self) -> bool {
        matches!(self.mem, DeviceMem::Image(..))
    }
}

/// Ordered collection of registered slots.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    input_count: usize,
    output_count: usize,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Allocates an input object, copies the host data to the device, and
    /// appends a slot at the next argument index. Nothing is appended if the
    /// allocation fails.
    pub(crate) fn register_input(&mut self, context: &Context, decl: &InputDecl) -> Result<usize> {
        decl.validate(self.input_count)?;
        // Outputs occupy the high indices; an input arriving after them
        // would break the "inputs first" argument convention.
        if self.output_count > 0 {
            return Err(Error::usage(
                "all inputs must be registered before the first output".to_string(),
            ));
        }
        let byte_size = decl.byte_size();
        let flags = CL_MEM_READ_ONLY | CL_MEM_COPY_HOST_PTR;
        let host_ptr = decl.data.as_ptr() as *mut u8 as *mut c_void;
        let mem = match decl.kind {
            DeclKind::Buffer => {
                let buffer = unsafe {
                    ClBuffer::<u8>::create(context, flags, byte_size, host_ptr)
                        .map_err(|e| Error::backend("clCreateBuffer", e))?
                };
                DeviceMem::Buffer(buffer)
            }
            DeclKind::Image(format, dims) => {
                let image = create_image(context, flags, format, dims, host_ptr)?;
                DeviceMem::Image(image, format, dims)
            }
        };
        Ok(self.push(Direction::Input, decl.numel, decl.dtype, byte_size, mem))
    }

    /// Allocates an uninitialized output object and appends its slot.
    pub(crate) fn register_output(&mut self, context: &Context, decl: &OutputDecl) -> Result<usize> {
        decl.validate(self.output_count)?;
        let byte_size = decl.byte_size();
        let mem = match decl.kind {
            DeclKind::Buffer => {
                let buffer = unsafe {
                    ClBuffer::<u8>::create(context, CL_MEM_WRITE_ONLY, byte_size, ptr::null_mut())
                        .map_err(|e| Error::backend("clCreateBuffer", e))?
                };
                DeviceMem::Buffer(buffer)
            }
            DeclKind::Image(format, dims) => {
                let image =
                    create_image(context, CL_MEM_WRITE_ONLY, format, dims, ptr::null_mut())?;
                DeviceMem::Image(image, format, dims)
            }
        };
        Ok(self.push(Direction::Output, decl.numel, decl.dtype, byte_size, mem))
    }

    fn push(
        &mut self,
        direction: Direction,
        numel: usize,
        dtype: DType,
        byte_size: usize,
        mem: DeviceMem,
    ) -> usize {
        let index = self.slots.len();
        self.slots.push(Slot {
            index,
            direction,
            numel,
            dtype,
            byte_size,
            mem,
        });
        match direction {
            Direction::Input => self.input_count += 1,
            Direction::Output => self.output_count += 1,
        }
        debug!("registered {direction} slot {index}: {numel} x {dtype} ({byte_size} bytes)");
        index
    }

    /// Binds every slot to its argument index, in ascending index order.
    /// Stops at the first failure so the root cause is not masked by
    /// follow-on binding errors.
    pub(crate) fn bind_all(&self, kernel: &Kernel) -> Result<()> {
        for slot in &self.slots {
            let arg_index = slot.index as cl_uint;
            let bound = unsafe {
                match &slot.mem {
                    DeviceMem::Buffer(buffer) => kernel.set_arg(arg_index, buffer).map(|_| ()),
                    DeviceMem::Image(image, _, _) => kernel.set_arg(arg_index, image).map(|_| ()),
                }
            };
            bound.map_err(|e| Error::backend("clSetKernelArg", e))?;
            debug!("bound {} slot as kernel argument {arg_index}", slot.direction);
        }
        Ok(())
    }

    /// Resolves the `ordinal`-th slot of `direction` to its global index.
    fn resolve(&self, direction: Direction, ordinal: usize) -> Result<usize> {
        let count = match direction {
            Direction::Input => self.input_count,
            Direction::Output => self.output_count,
        };
        if ordinal >= count {
            return Err(Error::usage(format!(
                "{direction} index {ordinal} out of range ({count} {direction}(s) registered)"
            )));
        }
        Ok(match direction {
            Direction::Input => ordinal,
            Direction::Output => self.input_count + ordinal,
        })
    }

    pub(crate) fn input(&self, ordinal: usize) -> Result<&Slot> {
        let index = self.resolve(Direction::Input, ordinal)?;
        Ok(&self.slots[index])
    }

    pub(crate) fn output(&self, ordinal: usize) -> Result<&Slot> {
        let index = self.resolve(Direction::Output, ordinal)?;
        Ok(&self.slots[index])
    }

    /// Blocking host-to-device copy into an input slot. The slot stays bound
    /// to its kernel argument, so no re-binding is needed afterwards.
    pub(crate) fn write_input(
        &mut self,
        queue: &CommandQueue,
        ordinal: usize,
        data: &[u8],
    ) -> Result<()> {
        let index = self.resolve(Direction::Input, ordinal)?;
        let slot = &mut self.slots[index];
        if data.len() != slot.byte_size {
            return Err(Error::usage(format!(
                "input {ordinal} holds {} bytes but {} bytes were supplied",
                slot.byte_size,
                data.len()
            )));
        }
        match &mut slot.mem {
            DeviceMem::Buffer(buffer) => unsafe {
                queue
                    .enqueue_write_buffer(buffer, CL_BLOCKING, 0, data, &[])
                    .map_err(|e| Error::backend("clEnqueueWriteBuffer", e))?;
            },
            DeviceMem::Image(image, _, dims) => unsafe {
                let origin = [0usize; 3];
                let region = [dims.width, dims.height, dims.depth];
                queue
                    .enqueue_write_image(
                        image,
                        CL_BLOCKING,
                        origin.as_ptr(),
                        region.as_ptr(),
                        0,
                        0,
                        data.as_ptr() as *mut u8 as *mut c_void,
                        &[],
                    )
                    .map_err(|e| Error::backend("clEnqueueWriteImage", e))?;
            },
        }
        debug!("updated input slot {index} ({} bytes)", data.len());
        Ok(())
    }

    /// Blocking device-to-host copy out of an output slot.
    pub(crate) fn read_output(&mut self, queue: &CommandQueue, ordinal: usize) -> Result<Vec<u8>> {
        let index = self.resolve(Direction::Output, ordinal)?;
        let slot = &mut self.slots[index];
        let mut data = vec![0u8; slot.byte_size];
        match &mut slot.mem {
            DeviceMem::Buffer(buffer) => unsafe {
                queue
                    .enqueue_read_buffer(buffer, CL_BLOCKING, 0, &mut data, &[])
                    .map_err(|e| Error::backend("clEnqueueReadBuffer", e))?;
            },
            DeviceMem::Image(image, _, dims) => unsafe {
                let origin = [0usize; 3];
                let region = [dims.width, dims.height, dims.depth];
                queue
                    .enqueue_read_image(
                        image,
                        CL_BLOCKING,
                        origin.as_ptr(),
                        region.as_ptr(),
                        0,
                        0,
                        data.as_mut_ptr() as *mut c_void,
                        &[],
                    )
                    .map_err(|e| Error::backend("clEnqueueReadImage", e))?;
            },
        }
        debug!("read output slot {index} ({} bytes)", slot.byte_size);
        Ok(data)
    }

    /// Releases every slot. Indices restart from zero afterwards; the
    /// registry is only cleared as part of session teardown, never while a
    /// kernel still holds bindings.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.input_count = 0;
        self.output_count = 0;
    }
}

fn create_image(
    context: &Context,
    flags: cl_mem_flags,
    format: ImageFormat,
    dims: ImageDims,
    host_ptr: *mut c_void,
) -> Result<Image> {
    let cl_format = format.cl_format();
    let desc = cl_image_desc {
        image_type: if dims.is_3d() {
            CL_MEM_OBJECT_IMAGE3D
        } else {
            CL_MEM_OBJECT_IMAGE2D
        },
        image_width: dims.width,
        image_height: dims.height,
        image_depth: dims.depth,
        image_array_size: 1,
        image_row_pitch: 0,
        image_slice_pitch: 0,
        num_mip_levels: 0,
        num_samples: 0,
        buffer: ptr::null_mut(),
    };
    let image = unsafe {
        Image::create(context, flags, &cl_format, &desc, host_ptr)
            .map_err(|e| Error::backend("clCreateImage", e))?
    };
    Ok(image)
}
