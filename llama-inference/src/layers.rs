#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

use crate::configuration::ModelConfig;
use crate::state::GenerationState;
use crate::tensor::FloatTensor;
use rayon::prelude::*;

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Shape**: [vocab_size, dim], possibly quantized
pub struct TokenEmbedding {
    pub table: FloatTensor,
    pub dim: usize,
}

impl TokenEmbedding {
    pub fn new(table: FloatTensor, dim: usize) -> Self {
        Self { table, dim }
    }

    pub fn forward(&self, token: usize, output: &mut [f32]) {
        self.table.copy_to(token * self.dim, &mut output[..self.dim]);
    }
}

impl std::fmt::Debug for TokenEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding")
            .field("dim", &self.dim)
            .field("vocab_size", &(self.table.size() / self.dim))
            .field("type", &self.table.ggml_type())
            .finish()
    }
}

/// RMS Layer Normalization
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
pub struct RMSNorm {
    pub weight: Vec<f32>,
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let rms_norm_factor = self.norm_factor(input);

        output.iter_mut().zip(input.iter()).zip(self.weight.iter()).for_each(|((out, &inp), &w)| {
            *out = w * (rms_norm_factor * inp);
        });
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len(), self.weight.len());

        let rms_norm_factor = self.norm_factor(x);

        x.iter_mut().zip(self.weight.iter()).for_each(|(val, &w)| {
            *val = w * (rms_norm_factor * *val);
        });
    }

    fn norm_factor(&self, x: &[f32]) -> f32 {
        let sum_of_squares = x.iter().map(|&val| val * val).sum::<f32>();
        1.0f32 / ((sum_of_squares / x.len() as f32) + self.eps).sqrt()
    }
}

impl std::fmt::Debug for RMSNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len()).field("eps", &self.eps).finish()
    }
}

/// Llama 3.1 frequency rescaling of rotary embeddings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeScaling {
    pub factor: f32,
    pub low_freq_factor: f32,
    pub high_freq_factor: f32,
    pub original_context_length: f32,
}

impl RopeScaling {
    pub const LLAMA_3_1: Self =
        Self { factor: 8.0, low_freq_factor: 1.0, high_freq_factor: 3.0, original_context_length: 8192.0 };

    fn rescale(&self, freq: f32) -> f32 {
        let low_freq_wavelen = self.original_context_length / self.low_freq_factor;
        let high_freq_wavelen = self.original_context_length / self.high_freq_factor;
        let wavelen = 2.0 * std::f32::consts::PI / freq;

        if wavelen < high_freq_wavelen {
            freq
        } else if wavelen > low_freq_wavelen {
            freq / self.factor
        } else {
            let smooth = (self.original_context_length / wavelen - self.low_freq_factor)
                / (self.high_freq_factor - self.low_freq_factor);
            (1.0 - smooth) * freq / self.factor + smooth * freq
        }
    }
}

/// Rotary Position Embedding with precomputed tables
///
/// **Tables**: `cos`/`sin` of shape [context_length, head_dim / 2] with
/// angle `pos * theta^(-2i / head_dim)` for frequency index `i`.
///
/// **Rotation**: adjacent pairs `(v[2i], v[2i+1])` of every head are rotated
/// by the angle of frequency index `i` (interleaved layout used by GGUF Llama
/// weights).
pub struct RoPE {
    pub head_dim: usize,
    pub context_length: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RoPE {
    pub fn new(head_dim: usize, context_length: usize, theta: f32, scaling: Option<RopeScaling>) -> Self {
        debug_assert_eq!(head_dim % 2, 0, "head_dim must be even");

        let half = head_dim / 2;
        let freqs: Vec<f32> = (0..half)
            .map(|i| {
                let freq = (1.0 / (theta as f64).powf((2 * i) as f64 / head_dim as f64)) as f32;
                scaling.map_or(freq, |s| s.rescale(freq))
            })
            .collect();

        let mut cos = Vec::with_capacity(context_length * half);
        let mut sin = Vec::with_capacity(context_length * half);
        for pos in 0..context_length {
            for &freq in &freqs {
                let angle = pos as f32 * freq;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }

        Self { head_dim, context_length, cos, sin }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        let scaling = config.rope_scaling.then_some(RopeScaling::LLAMA_3_1);
        Self::new(config.head_dim, config.context_length, config.rope_theta, scaling)
    }

    /// Rotates every head of `x` in place for position `pos`.
    pub fn apply(&self, x: &mut [f32], pos: usize) {
        let half = self.head_dim / 2;
        let cos = &self.cos[pos * half..(pos + 1) * half];
        let sin = &self.sin[pos * half..(pos + 1) * half];

        x.chunks_exact_mut(self.head_dim).for_each(|head| {
            head.chunks_exact_mut(2).zip(cos.iter().zip(sin)).for_each(|(pair, (&fcr, &fci))| {
                let (v0, v1) = (pair[0], pair[1]);
                pair[0] = v0 * fcr - v1 * fci;
                pair[1] = v0 * fci + v1 * fcr;
            });
        });
    }
}

impl std::fmt::Debug for RoPE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoPE").field("head_dim", &self.head_dim).field("context_length", &self.context_length).finish()
    }
}

/// Linear layer over a (possibly quantized) row-major weight matrix
pub struct Linear {
    pub weight: FloatTensor,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(weight: FloatTensor, in_features: usize, out_features: usize) -> Self {
        Self { weight, in_features, out_features }
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        self.weight.matmul(input, output, self.out_features, self.in_features);
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("type", &self.weight.ggml_type())
            .finish()
    }
}

/// Head layout shared by the attention kernels.
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub n_heads: usize,
    pub head_dim: usize,
    pub kv_dim: usize,
    pub kv_mul: usize,
    pub context_length: usize,
}

/// Multi-Head Attention with Grouped Query Attention (GQA)
///
/// Query head `h` reads KV head `h / kv_mul`. Keys are rotated before they
/// enter the cache, so cached positions never need re-rotation.
///
/// **Attention Formula**:
/// ```text
/// Attention(Q,K,V) = softmax(QK^T / √d_k)V
/// ```
pub struct MultiHeadAttention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    pub shape: AttentionShape,
}

impl MultiHeadAttention {
    pub fn new(wq: Linear, wk: Linear, wv: Linear, wo: Linear, config: &ModelConfig) -> Self {
        let shape = AttentionShape {
            n_heads: config.n_heads,
            head_dim: config.head_dim,
            kv_dim: config.kv_dim(),
            kv_mul: config.kv_mul(),
            context_length: config.context_length,
        };
        Self { wq, wk, wv, wo, shape }
    }

    /// Reads the normalized input from `state.xb` and leaves the output projection in `state.xb2`.
    pub fn forward(&self, pos: usize, layer_idx: usize, rope: &RoPE, state: &mut GenerationState) {
        let kv_dim = self.shape.kv_dim;

        self.wq.forward(&mut state.q, &state.xb);
        self.wk.forward(&mut state.k, &state.xb);
        self.wv.forward(&mut state.v, &state.xb);

        rope.apply(&mut state.q, pos);
        rope.apply(&mut state.k[..kv_dim], pos);

        let cache_range = pos * kv_dim..(pos + 1) * kv_dim;
        state.key_cache[layer_idx][cache_range.clone()].copy_from_slice(&state.k[..kv_dim]);
        state.value_cache[layer_idx][cache_range].copy_from_slice(&state.v[..kv_dim]);

        attention(
            &state.q,
            &state.key_cache[layer_idx],
            &state.value_cache[layer_idx],
            &mut state.att,
            &mut state.xb,
            pos,
            self.shape,
        );

        self.wo.forward(&mut state.xb2, &state.xb);
    }
}

impl std::fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("shape", &self.shape)
            .field("wq", &self.wq)
            .field("wk", &self.wk)
            .field("wv", &self.wv)
            .field("wo", &self.wo)
            .finish()
    }
}

/// Causal scaled dot-product attention over cached positions `0..=pos`.
///
/// Heads run in parallel; head `h` owns `att[h * context_length..]` and
/// `out[h * head_dim..(h + 1) * head_dim]`. Cache entries past `pos` are never read.
pub fn attention(
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    att: &mut [f32],
    out: &mut [f32],
    pos: usize,
    shape: AttentionShape,
) {
    let AttentionShape { n_heads, head_dim, kv_dim, kv_mul, context_length } = shape;
    let attention_scale = (head_dim as f32).sqrt().recip();

    att.par_chunks_mut(context_length)
        .zip(out.par_chunks_mut(head_dim))
        .zip((0..n_heads).into_par_iter())
        .for_each(|((att_slice, out_slice), head_idx)| {
            let q_head = &q[head_idx * head_dim..(head_idx + 1) * head_dim];
            let kv_head_offset = (head_idx / kv_mul) * head_dim;

            let att_head = &mut att_slice[0..=pos];

            att_head.iter_mut().enumerate().for_each(|(time_step, att_score)| {
                let k_start = time_step * kv_dim + kv_head_offset;
                *att_score = q_head
                    .iter()
                    .zip(&key_cache[k_start..k_start + head_dim])
                    .map(|(&q, &k)| q * k)
                    .sum::<f32>()
                    * attention_scale;
            });

            softmax(att_head);

            out_slice.fill(0.0);
            for (time_step, &attention_weight) in att_head.iter().enumerate() {
                let v_start = time_step * kv_dim + kv_head_offset;
                out_slice
                    .iter_mut()
                    .zip(&value_cache[v_start..v_start + head_dim])
                    .for_each(|(out, &value)| *out += attention_weight * value);
            }
        });
}

/// Feed-Forward Network with SwiGLU activation
///
/// **Formula**: `W2 · (silu(W1·x) ⊙ (W3·x))` where `silu(x) = x · sigmoid(x)`
pub struct FeedForward {
    pub w1: Linear, // Gate projection
    pub w2: Linear, // Down projection
    pub w3: Linear, // Up projection
}

impl FeedForward {
    pub fn new(w1: Linear, w2: Linear, w3: Linear) -> Self {
        Self { w1, w2, w3 }
    }

    /// Reads the normalized input from `state.xb` and writes the result back to `state.xb`.
    pub fn forward(&self, state: &mut GenerationState) {
        self.w1.forward(&mut state.hb, &state.xb);
        self.w3.forward(&mut state.hb2, &state.xb);

        swiglu(&mut state.hb, &state.hb2);

        self.w2.forward(&mut state.xb, &state.hb);
    }
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.w1.out_features)
            .field("w1", &self.w1)
            .field("w2", &self.w2)
            .field("w3", &self.w3)
            .finish()
    }
}

/// `gate = silu(gate) * up`, element-wise.
pub fn swiglu(gate: &mut [f32], up: &[f32]) {
    gate.iter_mut().zip(up.iter()).for_each(|(gate_val, &up_val)| {
        let swish_output = *gate_val * (1.0f32 + (-*gate_val).exp()).recip();
        *gate_val = swish_output * up_val;
    });
}

/// Applies softmax normalization to a slice in-place.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}
