//! Reader for GGUF model containers.
//!
//! A GGUF file is a little-endian header (magic, version, counts), a list of
//! typed metadata key/value pairs, a table of tensor descriptors, and an
//! aligned data section holding raw tensor bytes. Only the header and tables
//! are decoded here; tensor bytes stay in the memory map and are handed out
//! as [`TensorBytes`] windows.

#[cfg(test)]
#[path = "../tests/unit/gguf_test.rs"]
mod gguf_test;

use crate::error::LlamaError;
use crate::utils::{MemoryMapper, TensorBytes};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// "GGUF" read as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;
/// Data section alignment used when `general.alignment` is absent.
pub const DEFAULT_ALIGNMENT: usize = 32;
const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];
const MAX_DIMS: usize = 4;

/// Element encodings of the tensor table.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    BF16,
}

impl GgmlType {
    pub fn from_id(id: u32) -> Result<Self> {
        Ok(match id {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2_K,
            11 => Self::Q3_K,
            12 => Self::Q4_K,
            13 => Self::Q5_K,
            14 => Self::Q6_K,
            15 => Self::Q8_K,
            30 => Self::BF16,
            other => anyhow::bail!(LlamaError::Format(format!("Unknown tensor type id: {other}"))),
        })
    }

    pub fn id(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q8_1 => 9,
            Self::Q2_K => 10,
            Self::Q3_K => 11,
            Self::Q4_K => 12,
            Self::Q5_K => 13,
            Self::Q6_K => 14,
            Self::Q8_K => 15,
            Self::BF16 => 30,
        }
    }

    /// Number of elements per encoded block.
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::BF16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 => 32,
            Self::Q2_K | Self::Q3_K | Self::Q4_K | Self::Q5_K | Self::Q6_K | Self::Q8_K => 256,
        }
    }

    /// Number of bytes per encoded block.
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => 34,
            Self::Q8_1 => 36,
            Self::Q2_K => 84,
            Self::Q3_K => 110,
            Self::Q4_K => 144,
            Self::Q5_K => 176,
            Self::Q6_K => 210,
            Self::Q8_K => 292,
        }
    }

    /// Encoded size of `elements` values; the count must fill whole blocks.
    pub fn byte_size(self, elements: usize) -> Result<usize> {
        let block_size = self.block_size();
        if elements % block_size != 0 {
            anyhow::bail!(LlamaError::Format(format!(
                "{elements} elements of {self:?} do not fill whole blocks of {block_size}"
            )));
        }
        (elements / block_size)
            .checked_mul(self.type_size())
            .ok_or_else(|| LlamaError::Format(format!("Tensor of {elements} elements is too large")).into())
    }
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<MetadataValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::U8(_) => "u8",
            Self::I8(_) => "i8",
            Self::U16(_) => "u16",
            Self::I16(_) => "i16",
            Self::U32(_) => "u32",
            Self::I32(_) => "i32",
            Self::F32(_) => "f32",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::U64(_) => "u64",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
        }
    }

    /// Any non-negative integer value as `usize`.
    pub fn as_usize(&self) -> Option<usize> {
        match *self {
            Self::U8(v) => Some(v as usize),
            Self::U16(v) => Some(v as usize),
            Self::U32(v) => Some(v as usize),
            Self::U64(v) => usize::try_from(v).ok(),
            Self::I8(v) => usize::try_from(v).ok(),
            Self::I16(v) => usize::try_from(v).ok(),
            Self::I32(v) => usize::try_from(v).ok(),
            Self::I64(v) => usize::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::U8(v) => Some(v as i64),
            Self::U16(v) => Some(v as i64),
            Self::U32(v) => Some(v as i64),
            Self::U64(v) => i64::try_from(v).ok(),
            Self::I8(v) => Some(v as i64),
            Self::I16(v) => Some(v as i64),
            Self::I32(v) => Some(v as i64),
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            Self::F64(v) => Some(v as f32),
            _ => self.as_i64().map(|v| v as f32),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Array(values) => {
                let kind = values.first().map_or("empty", MetadataValue::type_name);
                write!(f, "[{kind}; {}]", values.len())
            }
            Self::U64(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
        }
    }
}

/// Descriptor of one tensor in the data section.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    /// Dimensions as stored, fastest-varying first.
    pub dimensions: Vec<usize>,
    pub ggml_type: GgmlType,
    /// Offset relative to the start of the data section.
    pub offset: usize,
}

impl TensorInfo {
    pub fn num_elements(&self) -> usize {
        self.dimensions.iter().product()
    }

    pub fn byte_size(&self) -> Result<usize> {
        self.ggml_type.byte_size(self.num_elements()).with_context(|| format!("Tensor '{}'", self.name))
    }
}

/// A parsed GGUF container with its tensor bytes still in place.
pub struct GgufFile {
    version: u32,
    metadata: HashMap<String, MetadataValue>,
    tensor_infos: Vec<TensorInfo>,
    tensor_index: HashMap<String, usize>,
    alignment: usize,
    data_offset: usize,
    mapper: MemoryMapper,
}

impl GgufFile {
    /// Memory-maps and parses the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open model file: {}", path.display()))?;
        let mapper = MemoryMapper::new(file)?;
        Self::parse(mapper).with_context(|| format!("Failed to read model file: {}", path.display()))
    }

    /// Parses a GGUF image already held in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(MemoryMapper::from_bytes(bytes))
    }

    fn parse(mut mapper: MemoryMapper) -> Result<Self> {
        match mapper.read_u32().context("Failed to read magic number")? {
            GGUF_MAGIC => {}
            actual => anyhow::bail!(LlamaError::Format(format!(
                "Invalid magic number: expected {GGUF_MAGIC:#x}, got {actual:#x}"
            ))),
        }

        let version = mapper.read_u32().context("Failed to read version")?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            anyhow::bail!(LlamaError::Format(format!("Unsupported GGUF version: {version}")));
        }

        let tensor_count = read_count(&mut mapper, "tensor count")?;
        let metadata_count = read_count(&mut mapper, "metadata count")?;

        let mut metadata = HashMap::new();
        for i in 0..metadata_count {
            let key = read_string(&mut mapper).with_context(|| format!("Failed to read key of metadata entry {i}"))?;
            let value_type = mapper.read_u32()?;
            let value =
                read_value(&mut mapper, value_type).with_context(|| format!("Failed to read metadata value '{key}'"))?;
            metadata.insert(key, value);
        }

        let mut tensor_infos = Vec::new();
        for i in 0..tensor_count {
            let info = read_tensor_info(&mut mapper).with_context(|| format!("Failed to read tensor descriptor {i}"))?;
            tensor_infos.push(info);
        }

        let alignment = match metadata.get("general.alignment") {
            None => DEFAULT_ALIGNMENT,
            Some(value) => match value.as_usize() {
                Some(alignment) if alignment > 0 => alignment,
                _ => anyhow::bail!(LlamaError::Format(format!("Invalid general.alignment: {value}"))),
            },
        };

        // The data section may be empty when the file holds no tensors.
        let data_offset = mapper.position().next_multiple_of(alignment).min(mapper.len());

        for info in &tensor_infos {
            let size = info.byte_size()?;
            let end = data_offset.checked_add(info.offset).and_then(|start| start.checked_add(size));
            if end.is_none_or(|end| end > mapper.len()) {
                anyhow::bail!(LlamaError::Format(format!(
                    "Tensor '{}' extends past the end of the file",
                    info.name
                )));
            }
        }

        let tensor_index = tensor_infos.iter().enumerate().map(|(i, info)| (info.name.clone(), i)).collect();

        Ok(Self { version, metadata, tensor_infos, tensor_index, alignment, data_offset, mapper })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Absolute offset of the tensor data section.
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn metadata(&self) -> &HashMap<String, MetadataValue> {
        &self.metadata
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    /// Tensor descriptors in file order.
    pub fn tensor_infos(&self) -> &[TensorInfo] {
        &self.tensor_infos
    }

    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.tensor_index.get(name).map(|&i| &self.tensor_infos[i])
    }

    /// Returns the descriptor and raw bytes of the named tensor.
    pub fn tensor_data(&self, name: &str) -> Result<(&TensorInfo, TensorBytes)> {
        let info = self
            .tensor_info(name)
            .ok_or_else(|| LlamaError::Format(format!("Tensor '{name}' not found")))?;
        let bytes = self.mapper.view(self.data_offset + info.offset, info.byte_size()?)?;
        Ok((info, bytes))
    }
}

impl std::fmt::Debug for GgufFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufFile")
            .field("version", &self.version)
            .field("metadata_entries", &self.metadata.len())
            .field("tensors", &self.tensor_infos.len())
            .field("alignment", &self.alignment)
            .field("data_offset", &self.data_offset)
            .finish()
    }
}

fn read_count(mapper: &mut MemoryMapper, what: &str) -> Result<usize> {
    let count = mapper.read_u64().with_context(|| format!("Failed to read {what}"))?;
    usize::try_from(count).map_err(|_| LlamaError::Format(format!("Invalid {what}: {count}")).into())
}

fn read_string(mapper: &mut MemoryMapper) -> Result<String> {
    let len = read_count(mapper, "string length")?;
    let bytes = mapper.get_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| LlamaError::Format(format!("Invalid UTF-8 string: {e}")).into())
}

/// Smallest encoded size of one value of the given type, used to reject
/// array lengths that cannot fit in the remaining bytes before allocating.
fn min_value_size(value_type: u32) -> Result<usize> {
    Ok(match value_type {
        0 | 1 | 7 => 1,
        2 | 3 => 2,
        4..=6 => 4,
        8 | 10..=12 => 8,
        other => anyhow::bail!(LlamaError::Format(format!("Unknown metadata value type: {other}"))),
    })
}

fn read_value(mapper: &mut MemoryMapper, value_type: u32) -> Result<MetadataValue> {
    Ok(match value_type {
        0 => MetadataValue::U8(mapper.read_u8()?),
        1 => MetadataValue::I8(mapper.read_i8()?),
        2 => MetadataValue::U16(mapper.read_u16()?),
        3 => MetadataValue::I16(mapper.read_i16()?),
        4 => MetadataValue::U32(mapper.read_u32()?),
        5 => MetadataValue::I32(mapper.read_i32()?),
        6 => MetadataValue::F32(mapper.read_f32()?),
        7 => MetadataValue::Bool(mapper.read_u8()? != 0),
        8 => MetadataValue::String(read_string(mapper)?),
        9 => {
            let element_type = mapper.read_u32()?;
            if element_type == 9 {
                anyhow::bail!(LlamaError::Format("Nested metadata arrays are not supported".to_string()));
            }
            let count = read_count(mapper, "array length")?;
            let needed = count.checked_mul(min_value_size(element_type)?);
            if needed.is_none_or(|needed| needed > mapper.remaining()) {
                anyhow::bail!(LlamaError::Format(format!(
                    "Array of {count} elements exceeds the {} remaining bytes",
                    mapper.remaining()
                )));
            }
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(read_value(mapper, element_type)?);
            }
            MetadataValue::Array(values)
        }
        10 => MetadataValue::U64(mapper.read_u64()?),
        11 => MetadataValue::I64(mapper.read_i64()?),
        12 => MetadataValue::F64(mapper.read_f64()?),
        other => anyhow::bail!(LlamaError::Format(format!("Unknown metadata value type: {other}"))),
    })
}

fn read_tensor_info(mapper: &mut MemoryMapper) -> Result<TensorInfo> {
    let name = read_string(mapper)?;
    let n_dims = mapper.read_u32()? as usize;
    if n_dims == 0 || n_dims > MAX_DIMS {
        anyhow::bail!(LlamaError::Format(format!("Tensor '{name}' has unsupported rank {n_dims}")));
    }

    let mut dimensions = Vec::with_capacity(n_dims);
    for _ in 0..n_dims {
        dimensions.push(read_count(mapper, "tensor dimension")?);
    }
    if dimensions.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
        anyhow::bail!(LlamaError::Format(format!("Tensor '{name}' has too many elements")));
    }

    let ggml_type = GgmlType::from_id(mapper.read_u32()?)?;
    let offset = read_count(mapper, "tensor offset")?;

    Ok(TensorInfo { name, dimensions, ggml_type, offset })
}
