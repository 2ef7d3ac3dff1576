use std::fmt;

/// Element types supported for device buffers and image channels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// The OpenCL C type name for this element type.
    pub fn cl_type(&self) -> &'static str {
        match self {
            DType::U8 => "uchar",
            DType::I32 => "int",
            DType::I64 => "long",
            DType::F32 => "float",
            DType::F64 => "double",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.cl_type())
    }
}

/// Reinterprets a float slice as the byte sequence the device expects.
pub fn bytes_of_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Reassembles floats from a byte sequence read back from the device.
///
/// Trailing bytes that do not form a whole element are dropped.
pub fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
