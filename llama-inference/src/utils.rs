use crate::error::LlamaError;
use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Clone)]
enum Backing {
    Mapped(Arc<Mmap>),
    Owned(Arc<[u8]>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => mmap,
            Backing::Owned(bytes) => bytes,
        }
    }
}

/// A cheaply clonable, read-only window into model bytes.
///
/// Tensors keep one of these instead of borrowing from the mapper, so the
/// mapping stays alive for as long as any tensor refers to it.
#[derive(Clone)]
pub struct TensorBytes {
    backing: Backing,
    offset: usize,
    len: usize,
}

impl TensorBytes {
    /// Wraps an owned buffer (used for synthesized tensors).
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self { backing: Backing::Owned(bytes.into()), offset: 0, len }
    }

    /// Returns a bounds-checked sub-window relative to this one.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        let end = offset.checked_add(len).filter(|&end| end <= self.len);
        if end.is_none() {
            anyhow::bail!(LlamaError::Format(format!(
                "Byte range {offset}..{} exceeds {} available bytes",
                offset.saturating_add(len),
                self.len
            )));
        }

        Ok(Self { backing: self.backing.clone(), offset: self.offset + offset, len })
    }
}

impl Deref for TensorBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.backing.as_slice()[self.offset..self.offset + self.len]
    }
}

impl std::fmt::Debug for TensorBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Mapped(_) => "mapped",
            Backing::Owned(_) => "owned",
        };
        f.debug_struct("TensorBytes").field("kind", &kind).field("offset", &self.offset).field("len", &self.len).finish()
    }
}

/// Sequential little-endian reader over a memory-mapped (or owned) model file.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    bytes: TensorBytes,
    offset: usize,
}

macro_rules! read_primitive {
    ($($name:ident -> $ty:ty, $size:expr, $decode:expr;)*) => {
        $(
            pub fn $name(&mut self) -> Result<$ty> {
                let bytes = self.get_bytes($size)?;
                Ok($decode(bytes))
            }
        )*
    };
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file).context("Failed to create memory mapping")? };
        let len = mmap.len();
        Ok(Self { bytes: TensorBytes { backing: Backing::Mapped(Arc::new(mmap)), offset: 0, len }, offset: 0 })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes: TensorBytes::from_vec(bytes), offset: 0 }
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        if count > self.remaining() {
            anyhow::bail!(LlamaError::Format(format!(
                "Insufficient data: need {} bytes, have {} remaining",
                count,
                self.remaining()
            )));
        }

        let result = &self.bytes[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    /// Shares the byte range `offset..offset + len` of the underlying file.
    pub fn view(&self, offset: usize, len: usize) -> Result<TensorBytes> {
        self.bytes.slice(offset, len)
    }

    read_primitive! {
        read_u8 -> u8, 1, |b: &[u8]| b[0];
        read_i8 -> i8, 1, |b: &[u8]| b[0] as i8;
        read_u16 -> u16, 2, LittleEndian::read_u16;
        read_i16 -> i16, 2, LittleEndian::read_i16;
        read_u32 -> u32, 4, LittleEndian::read_u32;
        read_i32 -> i32, 4, LittleEndian::read_i32;
        read_u64 -> u64, 8, LittleEndian::read_u64;
        read_i64 -> i64, 8, LittleEndian::read_i64;
        read_f32 -> f32, 4, LittleEndian::read_f32;
        read_f64 -> f64, 8, LittleEndian::read_f64;
    }
}
