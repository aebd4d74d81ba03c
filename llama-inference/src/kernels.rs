//! Block dot products for the 32-element GGML encodings.
//!
//! Every kernel comes in two flavours: a scalar one that decodes element by
//! element, and a lane one that keeps one accumulator per SIMD lane so the
//! compiler can map the inner loop onto vector registers. Lane kernels exist
//! for 128-bit (4 x f32) and 256-bit (8 x f32) registers; the 256-bit set is
//! compiled with AVX2 enabled and only selected when the running CPU has it.
//! Both flavours must agree to within float rounding.

#[cfg(test)]
#[path = "../tests/unit/kernels_test.rs"]
mod kernels_test;

use half::f16;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Elements per Q8_0 / Q4_0 block.
pub const QK: usize = 32;
/// f16 scale followed by 32 signed bytes.
pub const Q8_0_BLOCK_BYTES: usize = 2 + QK;
/// f16 scale followed by 16 bytes of packed nibbles.
pub const Q4_0_BLOCK_BYTES: usize = 2 + QK / 2;

static VECTOR_KERNELS: AtomicBool = AtomicBool::new(true);

/// Switches tensor dot products between the lane kernels and the scalar path.
pub fn set_vector_kernels(enabled: bool) {
    VECTOR_KERNELS.store(enabled, Ordering::Relaxed);
}

pub fn vector_kernels_enabled() -> bool {
    VECTOR_KERNELS.load(Ordering::Relaxed)
}

/// Register width the lane kernels are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneWidth {
    Bits128,
    Bits256,
}

impl LaneWidth {
    /// f32 lanes per register.
    pub fn lanes(self) -> usize {
        match self {
            Self::Bits128 => 4,
            Self::Bits256 => 8,
        }
    }

    /// Whether the running CPU can execute kernels of this width.
    pub fn is_supported(self) -> bool {
        match self {
            Self::Bits128 => true,
            Self::Bits256 => avx2_detected(),
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn avx2_detected() -> bool {
    std::arch::is_x86_feature_detected!("avx2")
}

#[cfg(not(target_arch = "x86_64"))]
fn avx2_detected() -> bool {
    false
}

type BlockDot = fn(&[u8], &[f32]) -> f32;
type DenseDot = fn(&[f32], &[f32]) -> f32;

/// The lane dot products of one [`LaneWidth`].
#[derive(Clone, Copy)]
pub struct LaneKernels {
    width: LaneWidth,
    q8_0: BlockDot,
    q4_0: BlockDot,
    dense_le: BlockDot,
    dense: DenseDot,
}

const PORTABLE: LaneKernels = LaneKernels {
    width: LaneWidth::Bits128,
    q8_0: dot_q8_0_block::<4>,
    q4_0: dot_q4_0_block::<4>,
    dense_le: dot_f32_le::<4>,
    dense: dot_f32::<4>,
};

impl LaneKernels {
    /// Kernels of `width`, or `None` when the CPU lacks the instructions.
    pub fn for_width(width: LaneWidth) -> Option<Self> {
        match width {
            LaneWidth::Bits128 => Some(PORTABLE),
            #[cfg(target_arch = "x86_64")]
            LaneWidth::Bits256 if width.is_supported() => Some(avx2::KERNELS),
            LaneWidth::Bits256 => None,
        }
    }

    /// Widest kernels the CPU supports, detected once per process.
    pub fn preferred() -> Self {
        static PREFERRED: OnceLock<LaneKernels> = OnceLock::new();
        *PREFERRED.get_or_init(|| Self::for_width(LaneWidth::Bits256).unwrap_or(PORTABLE))
    }

    pub fn width(&self) -> LaneWidth {
        self.width
    }

    /// One Q8_0 block against 32 floats.
    pub fn q8_0_block(&self, block: &[u8], x: &[f32]) -> f32 {
        (self.q8_0)(block, x)
    }

    /// One Q4_0 block against 32 floats.
    pub fn q4_0_block(&self, block: &[u8], x: &[f32]) -> f32 {
        (self.q4_0)(block, x)
    }

    /// Little-endian f32 bytes against `bytes.len() / 4` floats.
    pub fn dense_le(&self, bytes: &[u8], x: &[f32]) -> f32 {
        (self.dense_le)(bytes, x)
    }

    pub fn dense(&self, a: &[f32], b: &[f32]) -> f32 {
        (self.dense)(a, b)
    }

    /// Lane dot product of a Q8_0 window against `that`, see [`blocked_dot`].
    pub(crate) fn q8_0(&self, bytes: &[u8], this_offset: usize, that: &[f32], size: usize) -> f32 {
        blocked_dot(bytes, Q8_0_BLOCK_BYTES, this_offset, that, size, q8_0_value, self.q8_0)
    }

    pub(crate) fn q4_0(&self, bytes: &[u8], this_offset: usize, that: &[f32], size: usize) -> f32 {
        blocked_dot(bytes, Q4_0_BLOCK_BYTES, this_offset, that, size, q4_0_value, self.q4_0)
    }
}

impl std::fmt::Debug for LaneKernels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneKernels").field("width", &self.width).finish()
    }
}

/// The same generic kernels, compiled with AVX2 so each accumulator array
/// lives in one 256-bit register.
#[cfg(target_arch = "x86_64")]
mod avx2 {
    use super::{LaneKernels, LaneWidth};

    // Only reachable through `KERNELS`, which `for_width` hands out after detection.
    pub(super) const KERNELS: LaneKernels = LaneKernels {
        width: LaneWidth::Bits256,
        q8_0: |block, x| unsafe { q8_0(block, x) },
        q4_0: |block, x| unsafe { q4_0(block, x) },
        dense_le: |bytes, x| unsafe { dense_le(bytes, x) },
        dense: |a, b| unsafe { dense(a, b) },
    };

    #[target_feature(enable = "avx2")]
    unsafe fn q8_0(block: &[u8], x: &[f32]) -> f32 {
        super::dot_q8_0_block::<8>(block, x)
    }

    #[target_feature(enable = "avx2")]
    unsafe fn q4_0(block: &[u8], x: &[f32]) -> f32 {
        super::dot_q4_0_block::<8>(block, x)
    }

    #[target_feature(enable = "avx2")]
    unsafe fn dense_le(bytes: &[u8], x: &[f32]) -> f32 {
        super::dot_f32_le::<8>(bytes, x)
    }

    #[target_feature(enable = "avx2")]
    unsafe fn dense(a: &[f32], b: &[f32]) -> f32 {
        super::dot_f32::<8>(a, b)
    }
}

#[inline]
pub(crate) fn block_scale(block: &[u8]) -> f32 {
    f16::from_le_bytes([block[0], block[1]]).to_f32()
}

#[inline]
pub(crate) fn q8_0_value(bytes: &[u8], index: usize) -> f32 {
    let block = &bytes[(index / QK) * Q8_0_BLOCK_BYTES..][..Q8_0_BLOCK_BYTES];
    (block[2 + index % QK] as i8) as f32 * block_scale(block)
}

#[inline]
pub(crate) fn q4_0_value(bytes: &[u8], index: usize) -> f32 {
    let block = &bytes[(index / QK) * Q4_0_BLOCK_BYTES..][..Q4_0_BLOCK_BYTES];
    let within = index % QK;
    let packed = block[2 + within % (QK / 2)];
    let nibble = if within < QK / 2 { packed & 0x0F } else { packed >> 4 };
    (nibble as i32 - 8) as f32 * block_scale(block)
}

#[inline]
pub(crate) fn f32_le_value(bytes: &[u8], index: usize) -> f32 {
    let b = &bytes[index * 4..index * 4 + 4];
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// One Q8_0 block against 32 floats with `N` accumulators.
#[inline(always)]
pub(crate) fn dot_q8_0_block<const N: usize>(block: &[u8], x: &[f32]) -> f32 {
    let quants = &block[2..Q8_0_BLOCK_BYTES];
    let mut acc = [0.0f32; N];
    for (q, xs) in quants.chunks_exact(N).zip(x[..QK].chunks_exact(N)) {
        for lane in 0..N {
            acc[lane] += (q[lane] as i8) as f32 * xs[lane];
        }
    }
    acc.iter().sum::<f32>() * block_scale(block)
}

/// One Q4_0 block against 32 floats: low nibbles pair with the first half.
#[inline(always)]
pub(crate) fn dot_q4_0_block<const N: usize>(block: &[u8], x: &[f32]) -> f32 {
    let packed = &block[2..Q4_0_BLOCK_BYTES];
    let (low_x, high_x) = x[..QK].split_at(QK / 2);
    let mut acc = [0.0f32; N];
    for ((p, lx), hx) in packed.chunks_exact(N).zip(low_x.chunks_exact(N)).zip(high_x.chunks_exact(N)) {
        for lane in 0..N {
            let low = (p[lane] & 0x0F) as i32 - 8;
            let high = (p[lane] >> 4) as i32 - 8;
            acc[lane] += low as f32 * lx[lane] + high as f32 * hx[lane];
        }
    }
    acc.iter().sum::<f32>() * block_scale(block)
}

/// Dense lane dot product.
#[inline(always)]
pub(crate) fn dot_f32<const N: usize>(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; N];
    for (xa, xb) in a.chunks_exact(N).zip(b.chunks_exact(N)) {
        for lane in 0..N {
            acc[lane] += xa[lane] * xb[lane];
        }
    }
    let tail = a.len() - a.len() % N;
    let rest: f32 = a[tail..].iter().zip(&b[tail..]).map(|(x, y)| x * y).sum();
    acc.iter().sum::<f32>() + rest
}

/// Dense lane dot product over f32 values still encoded as little-endian bytes.
#[inline(always)]
pub(crate) fn dot_f32_le<const N: usize>(bytes: &[u8], x: &[f32]) -> f32 {
    let len = bytes.len() / 4;
    let mut acc = [0.0f32; N];
    for (chunk, xs) in bytes.chunks_exact(4 * N).zip(x.chunks_exact(N)) {
        for lane in 0..N {
            let b = &chunk[lane * 4..lane * 4 + 4];
            acc[lane] += f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * xs[lane];
        }
    }
    let tail = len - len % N;
    let rest: f32 = (tail..len).map(|i| f32_le_value(bytes, i) * x[i]).sum();
    acc.iter().sum::<f32>() + rest
}

/// Lane dot product of a block-encoded tensor window against dense floats.
///
/// The window `this_offset..this_offset + size` need not start on a block
/// boundary: elements before the first boundary and after the last whole
/// block are handled by `value`, whole blocks by `block_dot`.
pub(crate) fn blocked_dot(
    bytes: &[u8],
    block_bytes: usize,
    this_offset: usize,
    that: &[f32],
    size: usize,
    value: fn(&[u8], usize) -> f32,
    block_dot: BlockDot,
) -> f32 {
    let mut result = 0.0f32;
    let mut j = 0;

    let prefix = size.min((QK - this_offset % QK) % QK);
    while j < prefix {
        result += value(bytes, this_offset + j) * that[j];
        j += 1;
    }

    let mut block_index = (this_offset + j) / QK;
    while j + QK <= size {
        let block = &bytes[block_index * block_bytes..][..block_bytes];
        result += block_dot(block, &that[j..j + QK]);
        j += QK;
        block_index += 1;
    }

    while j < size {
        result += value(bytes, this_offset + j) * that[j];
        j += 1;
    }

    result
}
