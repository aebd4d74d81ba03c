#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tensor_test;

use crate::error::LlamaError;
use crate::gguf::GgmlType;
use crate::kernels::*;
use crate::utils::TensorBytes;
use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use rayon::prelude::*;

/// Read-only block-encoded weights living in the model file (or an owned buffer).
#[derive(Clone)]
pub struct BlockTensor {
    size: usize,
    bytes: TensorBytes,
}

/// A flat tensor of `size` logical f32 elements in one of the supported encodings.
///
/// `F32` tensors are owned and writable. Tensors loaded from model bytes
/// (`MappedF32`, `Q8_0`, `Q4_0`) are shared views into those bytes and only
/// support reads.
#[allow(non_camel_case_types)]
#[derive(Clone)]
pub enum FloatTensor {
    F32(Vec<f32>),
    MappedF32(BlockTensor),
    Q8_0(BlockTensor),
    Q4_0(BlockTensor),
}

impl FloatTensor {
    /// Wraps encoded bytes of a tensor with `size` elements.
    pub fn from_bytes(ggml_type: GgmlType, size: usize, bytes: TensorBytes) -> Result<Self> {
        let expected = ggml_type.byte_size(size)?;
        if bytes.len() != expected {
            anyhow::bail!(LlamaError::Format(format!(
                "{ggml_type:?} tensor of {size} elements needs {expected} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(match ggml_type {
            GgmlType::F32 => Self::MappedF32(BlockTensor { size, bytes }),
            GgmlType::Q8_0 => Self::Q8_0(BlockTensor { size, bytes }),
            GgmlType::Q4_0 => Self::Q4_0(BlockTensor { size, bytes }),
            other => anyhow::bail!(LlamaError::UnsupportedType(format!("{other:?}"))),
        })
    }

    /// Encodes `values` with the given encoding.
    pub fn quantize(ggml_type: GgmlType, values: &[f32]) -> Result<Self> {
        let bytes = match ggml_type {
            GgmlType::F32 => return Ok(Self::F32(values.to_vec())),
            GgmlType::Q8_0 => encode_q8_0(values)?,
            GgmlType::Q4_0 => encode_q4_0(values)?,
            other => anyhow::bail!(LlamaError::UnsupportedType(format!("{other:?}"))),
        };
        Self::from_bytes(ggml_type, values.len(), TensorBytes::from_vec(bytes))
    }

    pub fn ggml_type(&self) -> GgmlType {
        match self {
            Self::F32(_) | Self::MappedF32(_) => GgmlType::F32,
            Self::Q8_0(_) => GgmlType::Q8_0,
            Self::Q4_0(_) => GgmlType::Q4_0,
        }
    }

    /// Number of logical elements.
    pub fn size(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::MappedF32(t) | Self::Q8_0(t) | Self::Q4_0(t) => t.size,
        }
    }

    /// Decoded value at `index`. Panics when `index >= size()`.
    pub fn get(&self, index: usize) -> f32 {
        match self {
            Self::F32(values) => values[index],
            Self::MappedF32(t) => {
                assert!(index < t.size, "index {index} out of bounds for tensor of size {}", t.size);
                f32_le_value(&t.bytes, index)
            }
            Self::Q8_0(t) => {
                assert!(index < t.size, "index {index} out of bounds for tensor of size {}", t.size);
                q8_0_value(&t.bytes, index)
            }
            Self::Q4_0(t) => {
                assert!(index < t.size, "index {index} out of bounds for tensor of size {}", t.size);
                q4_0_value(&t.bytes, index)
            }
        }
    }

    /// Writes one element; only dense tensors are writable.
    pub fn set(&mut self, index: usize, value: f32) -> Result<()> {
        match self {
            Self::F32(values) => {
                let len = values.len();
                let slot = values
                    .get_mut(index)
                    .ok_or_else(|| anyhow::anyhow!("Index {index} out of bounds for tensor of size {len}"))?;
                *slot = value;
                Ok(())
            }
            other => anyhow::bail!(LlamaError::UnsupportedType(format!(
                "{:?} tensors are read-only",
                other.ggml_type()
            ))),
        }
    }

    /// Dense view of an owned `F32` tensor.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(values) => Some(values),
            _ => None,
        }
    }

    /// Decodes `out.len()` elements starting at `offset` into `out`.
    pub fn copy_to(&self, offset: usize, out: &mut [f32]) {
        match self {
            Self::F32(values) => out.copy_from_slice(&values[offset..offset + out.len()]),
            Self::MappedF32(t) => LittleEndian::read_f32_into(&t.bytes[offset * 4..(offset + out.len()) * 4], out),
            _ => out.iter_mut().enumerate().for_each(|(i, o)| *o = self.get(offset + i)),
        }
    }

    /// Element-by-element reference dot product of
    /// `self[this_offset..this_offset + size]` and `that[that_offset..that_offset + size]`.
    pub fn scalar_dot(&self, this_offset: usize, that: &[f32], that_offset: usize, size: usize) -> f32 {
        (0..size).map(|j| self.get(this_offset + j) * that[that_offset + j]).sum()
    }

    /// Same contract as [`FloatTensor::scalar_dot`], using the widest lane kernels the CPU supports.
    pub fn vector_dot(&self, this_offset: usize, that: &[f32], that_offset: usize, size: usize) -> f32 {
        self.lane_dot(&LaneKernels::preferred(), this_offset, that, that_offset, size)
    }

    /// Same contract as [`FloatTensor::scalar_dot`], using the given lane kernels.
    pub fn lane_dot(&self, kernels: &LaneKernels, this_offset: usize, that: &[f32], that_offset: usize, size: usize) -> f32 {
        let that = &that[that_offset..that_offset + size];
        match self {
            Self::F32(values) => kernels.dense(&values[this_offset..this_offset + size], that),
            Self::MappedF32(t) => {
                assert!(this_offset + size <= t.size, "dot range exceeds tensor of size {}", t.size);
                kernels.dense_le(&t.bytes[this_offset * 4..(this_offset + size) * 4], that)
            }
            Self::Q8_0(t) => {
                assert!(this_offset + size <= t.size, "dot range exceeds tensor of size {}", t.size);
                kernels.q8_0(&t.bytes, this_offset, that, size)
            }
            Self::Q4_0(t) => {
                assert!(this_offset + size <= t.size, "dot range exceeds tensor of size {}", t.size);
                kernels.q4_0(&t.bytes, this_offset, that, size)
            }
        }
    }

    /// Dot product using the globally selected kernel.
    pub fn dot(&self, this_offset: usize, that: &[f32], that_offset: usize, size: usize) -> f32 {
        if vector_kernels_enabled() {
            self.vector_dot(this_offset, that, that_offset, size)
        } else {
            self.scalar_dot(this_offset, that, that_offset, size)
        }
    }

    /// Row-major matrix-vector product: `out[i] = dot(self row i, input)` for `i < rows`.
    ///
    /// Rows are computed in parallel on the rayon pool; each output element is
    /// written by exactly one task.
    pub fn matmul(&self, input: &[f32], out: &mut [f32], rows: usize, cols: usize) {
        assert!(out.len() >= rows, "Output slice length must be at least rows: {} >= {}", out.len(), rows);
        assert!(input.len() >= cols, "Input slice length must be at least cols: {} >= {}", input.len(), cols);
        assert!(rows * cols <= self.size(), "{rows}x{cols} matrix exceeds tensor of size {}", self.size());

        let kernels = vector_kernels_enabled().then(LaneKernels::preferred);
        out.par_iter_mut().enumerate().take(rows).for_each(|(i, out_val)| {
            *out_val = match &kernels {
                Some(kernels) => self.lane_dot(kernels, i * cols, input, 0, cols),
                None => self.scalar_dot(i * cols, input, 0, cols),
            };
        });
    }
}

impl std::fmt::Debug for FloatTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloatTensor").field("type", &self.ggml_type()).field("size", &self.size()).finish()
    }
}

/// Encodes f32 values as Q8_0 blocks (per-block absmax scaling to 127).
pub fn encode_q8_0(values: &[f32]) -> Result<Vec<u8>> {
    check_whole_blocks(values.len())?;
    let mut bytes = Vec::with_capacity(values.len() / QK * Q8_0_BLOCK_BYTES);

    for block in values.chunks_exact(QK) {
        let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let scale = amax / 127.0;
        let inv_scale = if scale != 0.0 { scale.recip() } else { 0.0 };

        bytes.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        bytes.extend(block.iter().map(|&v| (v * inv_scale).round() as i8 as u8));
    }

    Ok(bytes)
}

/// Encodes f32 values as Q4_0 blocks: element j goes to the low nibble of
/// byte j and element j + 16 to its high nibble, both offset by 8.
pub fn encode_q4_0(values: &[f32]) -> Result<Vec<u8>> {
    check_whole_blocks(values.len())?;
    let mut bytes = Vec::with_capacity(values.len() / QK * Q4_0_BLOCK_BYTES);

    for block in values.chunks_exact(QK) {
        // signed value with the largest magnitude maps to -8
        let max = block.iter().fold(0.0f32, |acc, &v| if v.abs() > acc.abs() { v } else { acc });
        let scale = max / -8.0;
        let inv_scale = if scale != 0.0 { scale.recip() } else { 0.0 };
        let encode = |v: f32| ((v * inv_scale + 8.5) as i8).clamp(0, 15) as u8;

        bytes.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        let (low, high) = block.split_at(QK / 2);
        bytes.extend(low.iter().zip(high).map(|(&l, &h)| encode(l) | (encode(h) << 4)));
    }

    Ok(bytes)
}

fn check_whole_blocks(len: usize) -> Result<()> {
    if len % QK != 0 {
        anyhow::bail!(LlamaError::Format(format!("{len} values do not fill whole blocks of {QK}")));
    }
    Ok(())
}
