#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use crate::error::LlamaError;
use crate::gguf::GgufFile;
use anyhow::{Context, Result};

/// Architecture assumed when `general.architecture` is absent.
const DEFAULT_ARCHITECTURE: &str = "llama";
const DEFAULT_RMS_NORM_EPS: f32 = 1e-5;
const DEFAULT_ROPE_THETA: f32 = 10000.0;
/// Models published under this base name ship with scaled RoPE frequencies.
const LLAMA_3_1_BASENAME: &str = "Meta-Llama-3.1";

/// Hyperparameters of a Llama-style decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    /// Maximum number of positions the KV cache holds.
    pub context_length: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    /// Llama 3.1 frequency rescaling of the RoPE tables.
    pub rope_scaling: bool,
    pub head_dim: usize,
}

impl ModelConfig {
    /// Builds and validates a configuration; `head_dim` is derived as `dim / n_heads`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        hidden_dim: usize,
        n_layers: usize,
        n_heads: usize,
        n_kv_heads: usize,
        vocab_size: usize,
        context_length: usize,
        rms_norm_eps: f32,
        rope_theta: f32,
    ) -> Result<Self> {
        let dimensions = [
            ("dim", dim),
            ("hidden_dim", hidden_dim),
            ("n_layers", n_layers),
            ("n_heads", n_heads),
            ("n_kv_heads", n_kv_heads),
            ("vocab_size", vocab_size),
            ("context_length", context_length),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                anyhow::bail!(LlamaError::Config(format!("Invalid {name}: must be positive")));
            }
        }

        if dim % n_heads != 0 {
            anyhow::bail!(LlamaError::Config(format!("dim {dim} is not divisible by n_heads {n_heads}")));
        }
        if n_heads % n_kv_heads != 0 {
            anyhow::bail!(LlamaError::Config(format!(
                "n_heads {n_heads} is not divisible by n_kv_heads {n_kv_heads}"
            )));
        }

        let head_dim = dim / n_heads;
        if head_dim % 2 != 0 {
            anyhow::bail!(LlamaError::Config(format!("head_dim {head_dim} must be even for rotary embeddings")));
        }

        if !(rms_norm_eps > 0.0) || !(rope_theta > 0.0) {
            anyhow::bail!(LlamaError::Config(format!(
                "rms_norm_eps ({rms_norm_eps}) and rope_theta ({rope_theta}) must be positive"
            )));
        }

        Ok(Self {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size,
            context_length,
            rms_norm_eps,
            rope_theta,
            rope_scaling: false,
            head_dim,
        })
    }

    /// Reads the configuration from GGUF metadata.
    ///
    /// `requested_context` is honoured only when it is positive and does not
    /// exceed the model's own context length; otherwise the model value is used.
    pub fn from_gguf(gguf: &GgufFile, vocab_size: usize, requested_context: Option<usize>) -> Result<Self> {
        let arch = gguf.get("general.architecture").and_then(|v| v.as_str()).unwrap_or(DEFAULT_ARCHITECTURE);
        let key = |name: &str| format!("{arch}.{name}");

        let n_heads = required_usize(gguf, &key("attention.head_count"))?;
        let n_kv_heads = optional_usize(gguf, &key("attention.head_count_kv"))?.unwrap_or(n_heads);
        let model_context = required_usize(gguf, &key("context_length"))?;
        let context_length = requested_context.filter(|&n| n > 0 && n <= model_context).unwrap_or(model_context);

        let mut config = Self::new(
            required_usize(gguf, &key("embedding_length"))?,
            required_usize(gguf, &key("feed_forward_length"))?,
            required_usize(gguf, &key("block_count"))?,
            n_heads,
            n_kv_heads,
            vocab_size,
            context_length,
            optional_f32(gguf, &key("attention.layer_norm_rms_epsilon"))?.unwrap_or(DEFAULT_RMS_NORM_EPS),
            optional_f32(gguf, &key("rope.freq_base"))?.unwrap_or(DEFAULT_ROPE_THETA),
        )
        .context("Invalid model configuration")?;

        config.rope_scaling = gguf.get("general.basename").and_then(|v| v.as_str()) == Some(LLAMA_3_1_BASENAME);

        Ok(config)
    }

    /// Width of one position's keys (or values) across all KV heads.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Number of query heads sharing one KV head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

fn required_usize(gguf: &GgufFile, key: &str) -> Result<usize> {
    optional_usize(gguf, key)?.ok_or_else(|| LlamaError::Format(format!("Missing metadata key '{key}'")).into())
}

fn optional_usize(gguf: &GgufFile, key: &str) -> Result<Option<usize>> {
    gguf.get(key)
        .map(|value| {
            value.as_usize().ok_or_else(|| {
                LlamaError::Format(format!("Metadata '{key}' must be a non-negative integer, got {value}")).into()
            })
        })
        .transpose()
}

fn optional_f32(gguf: &GgufFile, key: &str) -> Result<Option<f32>> {
    gguf.get(key)
        .map(|value| {
            value
                .as_f32()
                .ok_or_else(|| LlamaError::Format(format!("Metadata '{key}' must be numeric, got {value}")).into())
        })
        .transpose()
}
